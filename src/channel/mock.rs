//! In-memory channels for driving sessions in tests.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::channel::{
    Channel, ChannelEvent, ChannelEventKind, ChannelId, ChannelRef, Connector, EventSink,
    SendOutcome,
};
use crate::core::message::Message;
use crate::error::{ProtocolError, Result};

#[derive(Debug, Default)]
struct MockState {
    sent: Vec<Message>,
    queued: VecDeque<Message>,
    in_flight: usize,
    hold_writes: bool,
    paused: bool,
    closed: bool,
    sink: Option<EventSink>,
}

/// Records what the session writes and lets the test inject inbound events
#[derive(Debug)]
pub(crate) struct MockChannel {
    id: ChannelId,
    state: Mutex<MockState>,
}

impl MockChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ChannelId::next(),
            state: Mutex::new(MockState::default()),
        })
    }

    fn with_sink(sink: EventSink) -> Arc<Self> {
        let channel = Self::new();
        channel.lock().sink = Some(sink);
        channel
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state lock")
    }

    fn emit(&self, kind: ChannelEventKind) {
        let sink = self.lock().sink.clone().expect("mock channel has no owner");
        sink.send(ChannelEvent::new(self.id, kind)).expect("owner dropped");
    }

    /// Report the outbound connection as established
    pub fn open(&self) {
        self.emit(ChannelEventKind::Opened);
    }

    /// Simulate a message arriving from the peer
    pub fn deliver(&self, message: Message) {
        self.emit(ChannelEventKind::Message(message));
    }

    /// Simulate the peer dropping the connection
    pub fn drop_connection(&self) {
        self.lock().closed = true;
        self.emit(ChannelEventKind::Closed(Some("peer closed".into())));
    }

    pub fn sent(&self) -> Vec<Message> {
        self.lock().sent.clone()
    }

    pub fn take_sent(&self) -> Vec<Message> {
        std::mem::take(&mut self.lock().sent)
    }

    pub fn set_in_flight(&self, count: usize) {
        self.lock().in_flight = count;
    }

    /// Queue sends instead of writing them
    pub fn hold_writes(&self, hold: bool) {
        self.lock().hold_writes = hold;
    }

    pub fn channel_ref(self: &Arc<Self>) -> ChannelRef {
        self.clone()
    }
}

impl Channel for MockChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        None
    }

    fn send(&self, message: Message) -> Result<SendOutcome> {
        let mut state = self.lock();
        if state.closed {
            return Err(ProtocolError::ConnectionClosed);
        }
        if state.hold_writes {
            state.queued.push_back(message);
            Ok(SendOutcome::Queued)
        } else {
            state.sent.push(message);
            Ok(SendOutcome::Sent)
        }
    }

    fn pause_read(&self) {
        self.lock().paused = true;
    }

    fn resume_read(&self) {
        self.lock().paused = false;
    }

    fn is_read_paused(&self) -> bool {
        self.lock().paused
    }

    fn in_flight_message_count(&self) -> usize {
        self.lock().in_flight
    }

    fn send_queue_depth(&self) -> usize {
        self.lock().queued.len()
    }

    fn unsent_messages(&self) -> Vec<Message> {
        self.lock().queued.drain(..).collect()
    }

    fn register(&self, sink: EventSink) {
        let _ = sink.send(ChannelEvent::new(self.id, ChannelEventKind::Attached));
        self.lock().sink = Some(sink);
    }

    fn close(&self) {
        let sink = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.sink.clone()
        };
        if let Some(sink) = sink {
            let _ = sink.send(ChannelEvent::new(self.id, ChannelEventKind::Closed(None)));
        }
    }

    fn is_open(&self) -> bool {
        !self.lock().closed
    }
}

/// Hands out a [`MockChannel`] as the broker connection
#[derive(Default)]
pub(crate) struct MockConnector {
    broker: Mutex<Option<Arc<MockChannel>>>,
    keep_alive: Mutex<Option<Duration>>,
    refuse: bool,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A connector whose `connect` fails outright
    pub fn refusing() -> Arc<Self> {
        Arc::new(Self {
            refuse: true,
            ..Self::default()
        })
    }

    pub fn broker(&self) -> Arc<MockChannel> {
        self.broker
            .lock()
            .expect("connector lock")
            .clone()
            .expect("connect has not been called")
    }

    pub fn broker_opt(&self) -> Option<Arc<MockChannel>> {
        self.broker.lock().expect("connector lock").clone()
    }

    pub fn keep_alive(&self) -> Option<Duration> {
        *self.keep_alive.lock().expect("connector lock")
    }
}

impl Connector for MockConnector {
    fn connect(&self, sink: EventSink, keep_alive: Option<Duration>) -> Result<ChannelRef> {
        if self.refuse {
            return Err(ProtocolError::TransportError("connection refused".into()));
        }
        let channel = MockChannel::with_sink(sink);
        *self.broker.lock().expect("connector lock") = Some(channel.clone());
        *self.keep_alive.lock().expect("connector lock") = keep_alive;
        Ok(channel)
    }
}
