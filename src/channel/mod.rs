//! # Channel Layer
//!
//! A channel is one duplex MQTT connection, framed into [`Message`]s, with the
//! flow-control hooks the proxy needs.
//!
//! ## Responsibilities
//! - Queue outbound messages (one in the "currently sending" slot, the rest FIFO)
//! - Deliver each inbound message exactly once, in arrival order, as a
//!   [`ChannelEvent`] on the owner's [`EventSink`]
//! - Pause and resume delivery on request of the owner; a channel never pauses itself
//! - Report in-flight and queued message counts for load balancing
//! - Close idempotently, reporting the close once
//!
//! Events for every channel a component owns arrive on a single unbounded
//! stream, so the owner handles them on one task in arrival order.
//! [`Channel::register`] moves a channel to a new owner, which is how a
//! connection accepted by the registry joins a proxy session.

pub mod connector;
#[cfg(test)]
pub(crate) mod mock;
pub mod tcp;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::core::message::Message;
use crate::error::Result;

pub use connector::{Connector, TcpConnector};
pub use tcp::TcpChannel;

/// Process-unique channel identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Allocate the next identifier
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ChannelId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Result of [`Channel::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The message went straight to the writer
    Sent,
    /// A write was already in progress; the message waits in the send queue
    Queued,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEventKind {
    /// An outbound connection finished connecting
    Opened,
    /// The channel was registered with a new owner
    Attached,
    /// A complete message was read
    Message(Message),
    /// The channel closed; carries the reason when it was not a clean shutdown
    Closed(Option<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub channel: ChannelId,
    pub kind: ChannelEventKind,
}

impl ChannelEvent {
    pub fn new(channel: ChannelId, kind: ChannelEventKind) -> Self {
        Self { channel, kind }
    }
}

/// Where a channel reports its events
pub type EventSink = mpsc::UnboundedSender<ChannelEvent>;

/// Receiving side of an [`EventSink`]
pub type EventStream = mpsc::UnboundedReceiver<ChannelEvent>;

/// Create a connected sink/stream pair
pub fn event_stream() -> (EventSink, EventStream) {
    mpsc::unbounded_channel()
}

/// A framed, flow-controlled MQTT connection.
///
/// All methods are non-blocking. Once [`Channel::close`] has been called,
/// `send` fails with `ConnectionClosed` and every other operation is a no-op.
pub trait Channel: Send + Sync + fmt::Debug {
    fn id(&self) -> ChannelId;

    /// Peer address, once known
    fn remote_address(&self) -> Option<SocketAddr>;

    /// Queue a message for writing
    fn send(&self, message: Message) -> Result<SendOutcome>;

    /// Stop delivering inbound messages until [`Channel::resume_read`]
    fn pause_read(&self);

    fn resume_read(&self);

    fn is_read_paused(&self) -> bool;

    /// Acknowledgable messages written here whose acknowledgment has not been read yet
    fn in_flight_message_count(&self) -> usize;

    /// Messages waiting behind the one currently being written
    fn send_queue_depth(&self) -> usize;

    /// Remove and return every message this channel has not delivered to its
    /// peer: unacknowledged in-flight messages (marked duplicate), the one being
    /// written, and the send queue, in that order.
    fn unsent_messages(&self) -> Vec<Message>;

    /// Hand the channel to a new owner. Subsequent events go to `sink`,
    /// starting with [`ChannelEventKind::Attached`].
    fn register(&self, sink: EventSink);

    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Shared handle to a channel
pub type ChannelRef = Arc<dyn Channel>;
