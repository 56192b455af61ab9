//! # Proxy Session
//!
//! One session per logical client identity. It owns the single broker
//! channel and every client channel that presented a matching CONNECT, and it
//! runs on one task: all of its state is touched only from
//! [`ProxySession::handle_event`], which consumes the events of every channel
//! the session owns in arrival order.
//!
//! ## Lifecycle
//! ```text
//! Pending ──broker CONNACK accepted──▶ Connected ──broker lost / last client gone──▶ Disconnected
//!    └───────────broker rejected / unreachable───────────────────────────────────────▶ Disconnected
//! ```
//! Disconnected is terminal.
//!
//! ## Identifier remapping
//! Acknowledgable client messages (QoS 1 PUBLISH, SUBSCRIBE, UNSUBSCRIBE) are
//! forwarded under identifiers from a [`PendingAckTable`] so that clients
//! reusing the same identifiers never collide at the broker. When the table is
//! full every client is read-paused until an acknowledgment frees a slot.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::channel::{
    event_stream, ChannelEvent, ChannelEventKind, ChannelId, ChannelRef, Connector, EventSink,
    EventStream,
};
use crate::core::message::{Body, ConnAck, Connect, ConnectReturnCode, Message, QoS};
use crate::error::constants;
use crate::proxy::inflight::{PendingAck, PendingAckTable};
use crate::proxy::validate::validate_connect;
use crate::utils::metrics::global_metrics;

/// Minimum spacing between "in-flight limit reached" warnings
const CAPACITY_WARNING_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the broker's CONNACK
    Pending,
    Connected,
    Disconnected,
}

/// Per-session tunables
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Broker identifiers that may be awaiting acknowledgment at once
    pub max_in_flight_messages: u16,
    /// Ping the broker when its connection idles for the CONNECT keep-alive
    pub broker_keep_alive: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_in_flight_messages: u16::MAX,
            broker_keep_alive: true,
        }
    }
}

/// A connection accepted by the registry, waiting for its `Attached` event
struct PendingAttach {
    connect: Connect,
    channel: ChannelRef,
}

/// State shared between the session task and the handles that feed it
pub(crate) struct SessionShared {
    client_id: String,
    sink: EventSink,
    disconnected: AtomicBool,
    pending_attach: Mutex<HashMap<ChannelId, PendingAttach>>,
}

impl SessionShared {
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<ChannelId, PendingAttach>> {
        self.pending_attach
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Offer a connection to the session. Returns false once the session is
    /// disconnected; the caller keeps ownership of the channel in that case.
    pub fn new_connection(&self, channel: ChannelRef, connect: Connect) -> bool {
        {
            let mut pending = self.lock_pending();
            if self.is_disconnected() {
                return false;
            }
            pending.insert(
                channel.id(),
                PendingAttach {
                    connect,
                    channel: channel.clone(),
                },
            );
        }
        channel.register(self.sink.clone());
        true
    }

    fn take_pending(&self, channel: ChannelId) -> Option<PendingAttach> {
        self.lock_pending().remove(&channel)
    }

    fn mark_disconnected(&self) {
        let _pending = self.lock_pending();
        self.disconnected.store(true, Ordering::Release);
    }

    /// Refuse further connections and hand back the ones not yet attached
    fn close_pending(&self) -> Vec<PendingAttach> {
        let mut pending = self.lock_pending();
        self.disconnected.store(true, Ordering::Release);
        pending.drain().map(|(_, attach)| attach).collect()
    }
}

/// A client that passed validation while the broker CONNACK is outstanding,
/// with whatever it sent in the meantime
struct AwaitingBroker {
    channel: ChannelRef,
    backlog: Vec<Message>,
}

/// The proxy state machine for one client identity
pub struct ProxySession {
    shared: Arc<SessionShared>,
    original_connect: Connect,
    connector: Arc<dyn Connector>,
    options: SessionOptions,
    state: ConnectionState,
    broker: Option<ChannelRef>,
    clients: Vec<ChannelRef>,
    awaiting_broker: Vec<AwaitingBroker>,
    pending_acks: PendingAckTable,
    /// Acknowledgable client messages read after the table filled up
    deferred: VecDeque<(ChannelId, Message)>,
    cursor: usize,
    broker_connack: Option<ConnAck>,
    broker_rejection: Option<ConnectReturnCode>,
    last_capacity_warning: Option<Instant>,
    disconnect_sent: bool,
    shut_down: bool,
}

impl ProxySession {
    /// Create a session for the identity in `original_connect`. The returned
    /// stream carries the events of every channel the session will own.
    pub fn new(
        original_connect: Connect,
        connector: Arc<dyn Connector>,
        options: SessionOptions,
    ) -> (Self, EventStream) {
        let (sink, events) = event_stream();
        let shared = Arc::new(SessionShared {
            client_id: original_connect.client_id.clone(),
            sink,
            disconnected: AtomicBool::new(false),
            pending_attach: Mutex::new(HashMap::new()),
        });
        let pending_acks = PendingAckTable::new(options.max_in_flight_messages);

        let session = Self {
            shared,
            original_connect,
            connector,
            options,
            state: ConnectionState::Pending,
            broker: None,
            clients: Vec::new(),
            awaiting_broker: Vec::new(),
            pending_acks,
            deferred: VecDeque::new(),
            cursor: 0,
            broker_connack: None,
            broker_rejection: None,
            last_capacity_warning: None,
            disconnect_sent: false,
            shut_down: false,
        };
        (session, events)
    }

    pub(crate) fn shared(&self) -> Arc<SessionShared> {
        self.shared.clone()
    }

    pub fn client_id(&self) -> &str {
        self.shared.client_id()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_disconnected()
    }

    /// Nothing left to serve: disconnected with no channels still owned
    pub fn is_finished(&self) -> bool {
        self.state == ConnectionState::Disconnected
            && self.broker.is_none()
            && self.clients.is_empty()
            && self.awaiting_broker.is_empty()
    }

    /// Start connecting to the broker. The original CONNECT is sent once the
    /// broker channel reports `Opened`.
    pub fn init(&mut self) {
        let keep_alive = (self.options.broker_keep_alive && self.original_connect.keep_alive > 0)
            .then(|| Duration::from_secs(u64::from(self.original_connect.keep_alive)));

        match self.connector.connect(self.shared.sink.clone(), keep_alive) {
            Ok(broker) => {
                debug!(channel = %broker.id(), "Connecting to broker");
                self.broker = Some(broker);
            }
            Err(e) => {
                error!(error = %e, "Unable to start broker connection");
                self.enter_disconnected();
            }
        }
    }

    /// See [`SessionShared::new_connection`]
    pub fn new_connection(&self, channel: ChannelRef, connect: Connect) -> bool {
        self.shared.new_connection(channel, connect)
    }

    pub fn handle_event(&mut self, event: ChannelEvent) {
        let ChannelEvent { channel, kind } = event;
        match kind {
            ChannelEventKind::Opened => {
                if self.is_broker(channel) {
                    self.on_broker_opened();
                }
            }
            ChannelEventKind::Attached => self.on_attached(channel),
            ChannelEventKind::Message(message) => {
                if self.is_broker(channel) {
                    self.on_broker_message(message);
                } else if let Some(client) = self.client(channel) {
                    self.on_client_message(client, message);
                } else if let Some(awaiting) = self
                    .awaiting_broker
                    .iter_mut()
                    .find(|awaiting| awaiting.channel.id() == channel)
                {
                    awaiting.backlog.push(message);
                } else {
                    trace!(channel = %channel, "Ignoring message from unowned channel");
                }
            }
            ChannelEventKind::Closed(reason) => self.on_closed(channel, reason),
        }
    }

    /// Close every channel and refuse further connections. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if self.state != ConnectionState::Disconnected {
            info!("Shutting down session");
            self.state = ConnectionState::Disconnected;
        }

        // Connections that never joined get the broker's refusal when there was one
        for attach in self.shared.close_pending() {
            self.refuse(&attach.channel);
        }
        for awaiting in std::mem::take(&mut self.awaiting_broker) {
            self.refuse(&awaiting.channel);
        }
        for client in self.clients.drain(..) {
            client.close();
        }
        if let Some(broker) = self.broker.take() {
            broker.close();
        }
        self.pending_acks.clear();
        self.deferred.clear();
    }

    fn is_broker(&self, channel: ChannelId) -> bool {
        self.broker.as_ref().is_some_and(|broker| broker.id() == channel)
    }

    fn client(&self, channel: ChannelId) -> Option<ChannelRef> {
        self.clients
            .iter()
            .find(|client| client.id() == channel)
            .cloned()
    }

    fn send_to_broker(&self, message: Message) {
        if let Some(broker) = &self.broker {
            if let Err(e) = broker.send(message) {
                debug!(error = %e, "Broker send failed");
            }
        }
    }

    fn on_broker_opened(&mut self) {
        debug!("Broker connection open, sending CONNECT");
        self.send_to_broker(Message::connect(self.original_connect.clone()));
    }

    fn on_attached(&mut self, channel: ChannelId) {
        let Some(PendingAttach { connect, channel }) = self.shared.take_pending(channel) else {
            return;
        };

        if let Err(code) = validate_connect(&self.original_connect, &connect) {
            warn!(
                channel = %channel.id(),
                remote = ?channel.remote_address(),
                return_code = code.value(),
                "Rejecting client whose CONNECT does not match the session"
            );
            global_metrics().connect_rejected();
            // The channel closes itself once the rejection is written
            let _ = channel.send(Message::connack(code));
            return;
        }

        match self.state {
            ConnectionState::Pending => {
                debug!(channel = %channel.id(), "Client waiting for broker CONNACK");
                channel.pause_read();
                self.awaiting_broker.push(AwaitingBroker {
                    channel,
                    backlog: Vec::new(),
                });
            }
            ConnectionState::Connected => self.join(channel, Vec::new()),
            ConnectionState::Disconnected => self.refuse(&channel),
        }
    }

    /// Answer a client the session can no longer serve
    fn refuse(&self, channel: &ChannelRef) {
        let code = self
            .broker_rejection
            .unwrap_or(ConnectReturnCode::ServerUnavailable);
        global_metrics().connect_rejected();
        let _ = channel.send(Message::connack(code));
    }

    fn join(&mut self, channel: ChannelRef, backlog: Vec<Message>) {
        let connack = self.broker_connack.unwrap_or(ConnAck {
            session_present: false,
            return_code: ConnectReturnCode::Accepted,
        });
        if channel.send(Message::new(Body::ConnAck(connack))).is_err() {
            return;
        }

        info!(
            channel = %channel.id(),
            remote = ?channel.remote_address(),
            clients = self.clients.len() + 1,
            "Client joined session"
        );
        self.clients.push(channel.clone());

        if self.pending_acks.is_full() {
            channel.pause_read();
        } else {
            channel.resume_read();
        }

        for message in backlog {
            self.on_client_message(channel.clone(), message);
        }
    }

    fn on_broker_message(&mut self, message: Message) {
        match &message.body {
            Body::ConnAck(connack) => self.on_broker_connack(*connack),
            Body::Publish(_) => self.route_publish(message),
            Body::PubAck(_) | Body::SubAck(_) | Body::UnsubAck(_) => self.on_broker_ack(message),
            Body::PingResp => trace!("Broker PINGRESP"),
            Body::PubRec(_) | Body::PubRel(_) | Body::PubComp(_) => {
                global_metrics().message_dropped();
                debug!(message_type = %message.message_type(), "Dropping QoS 2 flow message from broker");
            }
            _ => {
                debug!(message_type = %message.message_type(), "Ignoring unexpected message from broker");
            }
        }
    }

    fn on_broker_connack(&mut self, connack: ConnAck) {
        if self.state != ConnectionState::Pending {
            debug!("Ignoring repeated broker CONNACK");
            return;
        }

        if connack.return_code.is_accepted() {
            info!(session_present = connack.session_present, "Broker accepted CONNECT");
            self.state = ConnectionState::Connected;
            self.broker_connack = Some(connack);
            for awaiting in std::mem::take(&mut self.awaiting_broker) {
                self.join(awaiting.channel, awaiting.backlog);
            }
        } else {
            warn!(return_code = connack.return_code.value(), "Broker rejected CONNECT");
            self.broker_rejection = Some(connack.return_code);
            if let Some(broker) = self.broker.take() {
                broker.close();
            }
            self.enter_disconnected();
        }
    }

    fn route_publish(&mut self, message: Message) {
        if message.qos == QoS::ExactlyOnce {
            global_metrics().message_dropped();
            debug!("Dropping QoS 2 PUBLISH from broker");
            return;
        }

        match self.least_busy_client() {
            Some(client) => {
                if let Err(e) = client.send(message) {
                    debug!(channel = %client.id(), error = %e, "Client send failed");
                }
            }
            None => {
                global_metrics().message_dropped();
                debug!("No client attached, dropping broker PUBLISH");
            }
        }
    }

    fn on_broker_ack(&mut self, mut message: Message) {
        let Some(broker_message_id) = message.message_id() else {
            return;
        };

        let was_full = self.pending_acks.is_full();
        let Some(pending) = self.pending_acks.remove(broker_message_id) else {
            trace!(message_id = broker_message_id, "Discarding acknowledgment with no pending entry");
            return;
        };

        message.set_message_id(pending.client_message_id);
        global_metrics().ack_remapped();
        match self.client(pending.channel) {
            Some(client) => {
                let _ = client.send(message);
            }
            None => trace!(channel = %pending.channel, "Acknowledged client is gone"),
        }

        if was_full {
            self.capacity_freed();
        }
    }

    /// Forward deferred messages, then resume reads if room is left
    fn capacity_freed(&mut self) {
        while !self.pending_acks.is_full() {
            let Some((channel, message)) = self.deferred.pop_front() else {
                break;
            };
            self.forward_remapped(channel, message);
        }
        if !self.pending_acks.is_full() {
            for client in &self.clients {
                client.resume_read();
            }
        }
    }

    fn on_client_message(&mut self, client: ChannelRef, message: Message) {
        match &message.body {
            Body::Publish(_) => match message.qos {
                QoS::AtMostOnce => self.send_to_broker(message),
                QoS::AtLeastOnce => self.remap_to_broker(client.id(), message),
                QoS::ExactlyOnce => {
                    global_metrics().message_dropped();
                    debug!(channel = %client.id(), "Dropping QoS 2 PUBLISH from client");
                }
            },
            Body::Subscribe(_) | Body::Unsubscribe(_) => self.remap_to_broker(client.id(), message),
            // Acknowledges a broker PUBLISH, whose identifier was never remapped
            Body::PubAck(_) => self.send_to_broker(message),
            Body::PingReq => {
                let _ = client.send(Message::pingresp());
            }
            Body::Disconnect => {
                debug!(channel = %client.id(), "Client sent DISCONNECT");
                client.close();
            }
            Body::Connect(_) => {
                warn!(channel = %client.id(), "Second CONNECT on an attached connection");
                client.close();
            }
            _ => {
                global_metrics().message_dropped();
                debug!(
                    channel = %client.id(),
                    message_type = %message.message_type(),
                    "Ignoring unexpected message from client"
                );
            }
        }
    }

    fn remap_to_broker(&mut self, channel: ChannelId, message: Message) {
        if self.pending_acks.is_full() || !self.deferred.is_empty() {
            self.deferred.push_back((channel, message));
            return;
        }
        self.forward_remapped(channel, message);
    }

    fn forward_remapped(&mut self, channel: ChannelId, mut message: Message) {
        let Some(client_message_id) = message.message_id() else {
            return;
        };

        let Some(broker_message_id) = self.pending_acks.allocate() else {
            error!(
                channel = %channel,
                message_id = client_message_id,
                "{}", constants::ERR_IDS_EXHAUSTED
            );
            message.set_message_id(0);
            global_metrics().message_dropped();
            return;
        };

        self.pending_acks.insert(
            broker_message_id,
            PendingAck {
                client_message_id,
                channel,
            },
        );
        message.set_message_id(broker_message_id);
        trace!(
            channel = %channel,
            client_message_id,
            broker_message_id,
            "Forwarding remapped message"
        );
        self.send_to_broker(message);

        if self.pending_acks.is_full() {
            self.pause_clients();
        }
    }

    fn pause_clients(&mut self) {
        for client in &self.clients {
            client.pause_read();
        }
        global_metrics().capacity_pause();

        let warn_now = self
            .last_capacity_warning
            .map_or(true, |last| last.elapsed() >= CAPACITY_WARNING_INTERVAL);
        if warn_now {
            self.last_capacity_warning = Some(Instant::now());
            warn!(
                max_in_flight = self.pending_acks.max(),
                clients = self.clients.len(),
                "In-flight limit reached, pausing client reads"
            );
        }
    }

    /// Round-robin scan from the cursor for the client with the lowest
    /// in-flight plus queued count; ties go to the first one scanned.
    fn least_busy_client(&mut self) -> Option<ChannelRef> {
        let count = self.clients.len();
        if count == 0 {
            return None;
        }

        let start = self.cursor % count;
        let mut best: Option<(usize, usize)> = None;
        for offset in 0..count {
            let index = (start + offset) % count;
            let client = &self.clients[index];
            let load = client.in_flight_message_count() + client.send_queue_depth();
            if best.map_or(true, |(_, lowest)| load < lowest) {
                best = Some((index, load));
            }
        }

        let (index, _) = best?;
        self.cursor = (index + 1) % count;
        Some(self.clients[index].clone())
    }

    fn on_closed(&mut self, channel: ChannelId, reason: Option<String>) {
        if self.is_broker(channel) {
            self.on_broker_closed(reason);
        } else if let Some(index) = self.clients.iter().position(|c| c.id() == channel) {
            self.on_client_closed(index);
        } else if let Some(index) = self
            .awaiting_broker
            .iter()
            .position(|awaiting| awaiting.channel.id() == channel)
        {
            debug!(channel = %channel, "Client closed before the broker answered");
            self.awaiting_broker.remove(index);
        } else {
            self.shared.take_pending(channel);
        }
    }

    fn on_broker_closed(&mut self, reason: Option<String>) {
        self.broker = None;
        if self.state == ConnectionState::Disconnected {
            return;
        }

        match reason {
            Some(reason) => warn!(reason = %reason, "Broker connection lost"),
            None => info!("Broker connection closed"),
        }
        self.enter_disconnected();
    }

    /// Terminal transition: refuse waiting clients, drop attached ones
    fn enter_disconnected(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.state = ConnectionState::Disconnected;
        self.shared.mark_disconnected();

        for awaiting in std::mem::take(&mut self.awaiting_broker) {
            self.refuse(&awaiting.channel);
        }
        for client in self.clients.drain(..) {
            client.close();
        }
        if let Some(broker) = self.broker.take() {
            broker.close();
        }
        self.pending_acks.clear();
        self.deferred.clear();
        self.cursor = 0;
    }

    fn on_client_closed(&mut self, index: usize) {
        let channel = self.clients.remove(index);
        let id = channel.id();
        if index < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.clients.len() {
            self.cursor = 0;
        }

        let was_full = self.pending_acks.is_full();
        let orphaned = self.pending_acks.remove_for_channel(id);
        self.deferred.retain(|(owner, _)| *owner != id);
        debug!(
            channel = %id,
            orphaned_acks = orphaned,
            clients = self.clients.len(),
            "Client left session"
        );

        if self.clients.is_empty() {
            if !self.disconnect_sent {
                self.disconnect_sent = true;
                info!("Last client left, disconnecting from broker");
                self.send_to_broker(Message::disconnect());
            }
            // The broker channel closes itself once DISCONNECT is written
            self.broker = None;
            self.enter_disconnected();
            return;
        }

        if was_full && !self.pending_acks.is_full() {
            self.capacity_freed();
        }

        for message in channel.unsent_messages() {
            if matches!(message.body, Body::Publish(_)) {
                self.route_publish(message);
            }
        }
    }
}

impl std::fmt::Debug for ProxySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySession")
            .field("client_id", &self.shared.client_id)
            .field("state", &self.state)
            .field("clients", &self.clients.len())
            .field("pending_acks", &self.pending_acks.len())
            .finish()
    }
}
