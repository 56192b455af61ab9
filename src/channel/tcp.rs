//! # TCP Channel
//!
//! [`Channel`] implementation over a tokio `TcpStream`.
//!
//! Each started channel runs two tasks: a reader that decodes frames with
//! [`MqttCodec`] and forwards them to the owner's [`EventSink`], and a writer
//! that drains the "currently sending" slot and the send queue. Both stop when
//! the channel is closed, which drops the socket halves.
//!
//! A channel is created unstarted. Its tasks are spawned by
//! [`Channel::register`] (accepted connections) or once the outbound connect
//! completes (broker connections), so the owner always sees `Attached` or
//! `Opened` before the first message.
//!
//! The writer closes the channel by itself after writing a rejecting CONNACK or
//! a DISCONNECT, and on broker connections sends PINGREQ whenever it has been
//! idle for half the keep-alive interval.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio::time::{Instant, Interval};
use tokio_util::codec::{Framed, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::channel::{
    Channel, ChannelEvent, ChannelEventKind, ChannelId, EventSink, SendOutcome,
};
use crate::core::codec::MqttCodec;
use crate::core::message::{Body, Message};
use crate::error::{ProtocolError, Result};
use crate::utils::metrics::global_metrics;

type Reader = FramedRead<OwnedReadHalf, MqttCodec>;
type Writer = FramedWrite<OwnedWriteHalf, MqttCodec>;

struct Io {
    reader: Reader,
    writer: Writer,
}

struct ChannelState {
    sending: Option<Message>,
    pending: VecDeque<Message>,
    in_flight: VecDeque<(u16, Message)>,
    sink: Option<EventSink>,
    io: Option<Io>,
    remote: Option<SocketAddr>,
    last_write: Instant,
    closed: bool,
}

struct Shared {
    id: ChannelId,
    state: Mutex<ChannelState>,
    write_ready: Notify,
    paused: watch::Sender<bool>,
    shutdown: CancellationToken,
    keep_alive: Option<Duration>,
    /// Counts against the active client connection gauge until closed
    client: AtomicBool,
}

/// A framed MQTT connection over TCP
pub struct TcpChannel {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpChannel")
            .field("id", &self.shared.id)
            .field("remote", &self.remote_address())
            .finish()
    }
}

impl TcpChannel {
    fn with_state(io: Option<Io>, remote: Option<SocketAddr>, keep_alive: Option<Duration>) -> Arc<Self> {
        let (paused, _) = watch::channel(false);
        Arc::new(Self {
            shared: Arc::new(Shared {
                id: ChannelId::next(),
                state: Mutex::new(ChannelState {
                    sending: None,
                    pending: VecDeque::new(),
                    in_flight: VecDeque::new(),
                    sink: None,
                    io,
                    remote,
                    last_write: Instant::now(),
                    closed: false,
                }),
                write_ready: Notify::new(),
                paused,
                shutdown: CancellationToken::new(),
                keep_alive,
                client: AtomicBool::new(false),
            }),
        })
    }

    /// Wrap an accepted stream. Nothing is read until the channel is registered.
    pub fn from_stream(stream: TcpStream, codec: MqttCodec) -> Arc<Self> {
        let remote = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let io = Io {
            reader: FramedRead::new(read_half, codec),
            writer: FramedWrite::new(write_half, codec),
        };
        Self::with_state(Some(io), remote, None)
    }

    /// Wrap a connection that has already been read from, keeping any bytes
    /// buffered past the frames consumed so far.
    pub fn from_framed(framed: Framed<TcpStream, MqttCodec>) -> Arc<Self> {
        let parts = framed.into_parts();
        let remote = parts.io.peer_addr().ok();
        let codec = parts.codec;
        let (read_half, write_half) = parts.io.into_split();

        let mut reader = FramedRead::new(read_half, codec);
        reader.read_buffer_mut().extend_from_slice(&parts.read_buf);
        let io = Io {
            reader,
            writer: FramedWrite::new(write_half, codec),
        };
        Self::with_state(Some(io), remote, None)
    }

    /// A channel whose transport is still being established by a connector.
    /// Events go to `sink` from the start.
    pub(crate) fn connecting(sink: EventSink, keep_alive: Option<Duration>) -> Arc<Self> {
        let channel = Self::with_state(None, None, keep_alive);
        channel.shared.lock_state().sink = Some(sink);
        channel
    }

    /// Install the connected stream of a [`TcpChannel::connecting`] channel,
    /// report `Opened` and start its I/O tasks.
    pub(crate) fn opened(&self, stream: TcpStream, codec: MqttCodec) {
        let remote = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        {
            let mut state = self.shared.lock_state();
            if state.closed {
                return;
            }
            state.remote = remote;
            state.io = Some(Io {
                reader: FramedRead::new(read_half, codec),
                writer: FramedWrite::new(write_half, codec),
            });
        }
        self.shared.emit(ChannelEventKind::Opened);
        self.start();
    }

    /// Mark this as an accepted client connection, already counted by
    /// [`Metrics::connection_established`](crate::utils::metrics::Metrics::connection_established)
    pub(crate) fn track_client_connection(&self) {
        self.shared.client.store(true, Ordering::Relaxed);
    }

    /// Close with a reason that is reported in the `Closed` event
    pub(crate) fn fail(&self, reason: String) {
        self.shared.close(Some(reason));
    }

    fn start(&self) {
        let Some(io) = self.shared.lock_state().io.take() else {
            return;
        };
        tokio::spawn(read_loop(self.shared.clone(), io.reader));
        tokio::spawn(write_loop(self.shared.clone(), io.writer));
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, kind: ChannelEventKind) {
        let sink = self.lock_state().sink.clone();
        if let Some(sink) = sink {
            let _ = sink.send(ChannelEvent::new(self.id, kind));
        }
    }

    fn close(&self, reason: Option<String>) {
        let sink = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.io = None;
            state.sink.clone()
        };
        self.shutdown.cancel();
        if self.client.load(Ordering::Relaxed) {
            global_metrics().connection_closed();
        }

        match &reason {
            Some(reason) => debug!(channel = %self.id, reason = %reason, "Channel closed"),
            None => debug!(channel = %self.id, "Channel closed"),
        }

        if let Some(sink) = sink {
            let _ = sink.send(ChannelEvent::new(self.id, ChannelEventKind::Closed(reason)));
        }
    }

    /// Wait until reads are not paused. False if the channel closed meanwhile.
    async fn wait_resumed(&self, paused: &mut watch::Receiver<bool>) -> bool {
        while *paused.borrow_and_update() {
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                changed = paused.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
        !self.shutdown.is_cancelled()
    }

    /// Read and deliver the next message. Returns whether more data may follow.
    async fn read(&self, reader: &mut Reader, paused: &mut watch::Receiver<bool>) -> Result<bool> {
        if !self.wait_resumed(paused).await {
            return Ok(false);
        }

        let frame = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(false),
            frame = reader.next() => frame,
        };

        let message = match frame {
            None => return Ok(false),
            Some(Err(e)) => return Err(e),
            Some(Ok(message)) => message,
        };

        // A pause requested while the frame was in transit still holds it back
        if !self.wait_resumed(paused).await {
            return Ok(false);
        }

        global_metrics().message_received();
        trace!(channel = %self.id, message_type = %message.message_type(), "Message received");

        if message.is_ack() {
            if let Some(id) = message.message_id() {
                let mut state = self.lock_state();
                if let Some(pos) = state.in_flight.iter().position(|(in_flight, _)| *in_flight == id) {
                    state.in_flight.remove(pos);
                }
            }
        }

        self.emit(ChannelEventKind::Message(message));
        Ok(true)
    }
}

async fn read_loop(shared: Arc<Shared>, mut reader: Reader) {
    let mut paused = shared.paused.subscribe();
    loop {
        match shared.read(&mut reader, &mut paused).await {
            Ok(true) => continue,
            Ok(false) => {
                shared.close(None);
                break;
            }
            Err(e) => {
                if matches!(e, ProtocolError::MalformedFrame(_) | ProtocolError::OversizedPacket(_)) {
                    global_metrics().malformed_frame();
                    warn!(channel = %shared.id, error = %e, "Dropping connection after malformed frame");
                }
                shared.close(Some(e.to_string()));
                break;
            }
        }
    }
}

async fn next_keep_alive_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn write_loop(shared: Arc<Shared>, mut writer: Writer) {
    let mut keep_alive = shared.keep_alive.map(|period| {
        let half = (period / 2).max(Duration::from_millis(100));
        tokio::time::interval_at(Instant::now() + half, half)
    });

    loop {
        let next = shared.lock_state().sending.clone();
        let Some(message) = next else {
            tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                _ = shared.write_ready.notified() => {}
                _ = next_keep_alive_tick(&mut keep_alive) => {
                    let idle = shared.lock_state().last_write.elapsed();
                    let threshold = shared.keep_alive.map(|k| k / 2).unwrap_or_default();
                    if idle >= threshold {
                        trace!(channel = %shared.id, "Sending keep-alive PINGREQ");
                        if let Err(e) = writer.send(Message::pingreq()).await {
                            shared.close(Some(e.to_string()));
                            break;
                        }
                        shared.lock_state().last_write = Instant::now();
                    }
                }
            }
            continue;
        };

        let closes_after = message.is_rejecting_connack() || matches!(message.body, Body::Disconnect);
        let written = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            written = writer.send(message.clone()) => written,
        };
        if let Err(e) = written {
            warn!(channel = %shared.id, error = %e, "Write failed");
            shared.close(Some(e.to_string()));
            break;
        }
        global_metrics().message_sent();

        {
            let mut state = shared.lock_state();
            if message.is_ackable() {
                if let Some(id) = message.message_id() {
                    state.in_flight.push_back((id, message));
                }
            }
            state.sending = state.pending.pop_front();
            state.last_write = Instant::now();
        }

        if closes_after {
            shared.close(None);
            break;
        }
    }
}

impl Channel for TcpChannel {
    fn id(&self) -> ChannelId {
        self.shared.id
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.shared.lock_state().remote
    }

    fn send(&self, message: Message) -> Result<SendOutcome> {
        let outcome = {
            let mut state = self.shared.lock_state();
            if state.closed {
                return Err(ProtocolError::ConnectionClosed);
            }
            if state.sending.is_none() {
                state.sending = Some(message);
                SendOutcome::Sent
            } else {
                state.pending.push_back(message);
                SendOutcome::Queued
            }
        };
        if outcome == SendOutcome::Sent {
            self.shared.write_ready.notify_one();
        }
        Ok(outcome)
    }

    fn pause_read(&self) {
        self.shared.paused.send_if_modified(|paused| !std::mem::replace(paused, true));
    }

    fn resume_read(&self) {
        self.shared.paused.send_if_modified(|paused| std::mem::replace(paused, false));
    }

    fn is_read_paused(&self) -> bool {
        *self.shared.paused.borrow()
    }

    fn in_flight_message_count(&self) -> usize {
        self.shared.lock_state().in_flight.len()
    }

    fn send_queue_depth(&self) -> usize {
        self.shared.lock_state().pending.len()
    }

    fn unsent_messages(&self) -> Vec<Message> {
        let mut state = self.shared.lock_state();
        let mut unsent = Vec::with_capacity(state.in_flight.len() + state.pending.len() + 1);
        for (_, mut message) in state.in_flight.drain(..) {
            message.duplicate = true;
            unsent.push(message);
        }
        unsent.extend(state.sending.take());
        unsent.extend(state.pending.drain(..));
        unsent
    }

    fn register(&self, sink: EventSink) {
        let closed = {
            let mut state = self.shared.lock_state();
            state.sink = Some(sink.clone());
            state.closed
        };
        let _ = sink.send(ChannelEvent::new(self.shared.id, ChannelEventKind::Attached));
        if closed {
            let _ = sink.send(ChannelEvent::new(self.shared.id, ChannelEventKind::Closed(None)));
            return;
        }
        self.start();
    }

    fn close(&self) {
        self.shared.close(None);
    }

    fn is_open(&self) -> bool {
        !self.shared.lock_state().closed
    }
}
