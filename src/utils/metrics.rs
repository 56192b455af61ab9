//! Observability and Metrics
//!
//! Process-wide counters for the proxy: client connections, handshakes,
//! sessions, message traffic and flow-control events.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Global metrics collector for proxy operations
#[derive(Debug)]
pub struct Metrics {
    /// Total client connections accepted
    pub connections_total: AtomicU64,
    /// Client connections currently open
    pub connections_active: AtomicU64,
    /// Total CONNECT handshakes attempted
    pub handshakes_total: AtomicU64,
    /// Handshakes that produced a CONNECT handed to a session
    pub handshakes_success: AtomicU64,
    /// Handshakes that timed out or did not start with CONNECT
    pub handshakes_failed: AtomicU64,
    /// Proxy sessions created
    pub sessions_created: AtomicU64,
    /// Proxy sessions currently running
    pub sessions_active: AtomicU64,
    /// Messages written to any channel
    pub messages_sent: AtomicU64,
    /// Messages read from any channel
    pub messages_received: AtomicU64,
    /// Messages the proxy deliberately discarded
    pub messages_dropped: AtomicU64,
    /// Broker acknowledgments routed back to a client
    pub acks_remapped: AtomicU64,
    /// Connections dropped after an unparseable frame
    pub malformed_frames: AtomicU64,
    /// CONNACK rejections sent to clients
    pub connect_rejections: AtomicU64,
    /// Times client reads were paused because no identifier was free
    pub capacity_pauses: AtomicU64,
    /// Failed broker connection attempts
    pub connection_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            handshakes_total: AtomicU64::new(0),
            handshakes_success: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            sessions_created: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            acks_remapped: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
            connect_rejections: AtomicU64::new(0),
            capacity_pauses: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new client connection
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a client connection closed
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn handshake_attempt(&self) {
        self.handshakes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_success(&self) {
        self.handshakes_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_started(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_ended(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ack_remapped(&self) {
        self.acks_remapped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connect_rejected(&self) {
        self.connect_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_frame(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn capacity_pause(&self) {
        self.capacity_pauses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed broker connection
    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            handshakes_total: self.handshakes_total.load(Ordering::Relaxed),
            handshakes_success: self.handshakes_success.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            acks_remapped: self.acks_remapped.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            connect_rejections: self.connect_rejections.load(Ordering::Relaxed),
            capacity_pauses: self.capacity_pauses.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            handshakes_total = snapshot.handshakes_total,
            handshakes_success = snapshot.handshakes_success,
            handshakes_failed = snapshot.handshakes_failed,
            sessions_created = snapshot.sessions_created,
            sessions_active = snapshot.sessions_active,
            messages_sent = snapshot.messages_sent,
            messages_received = snapshot.messages_received,
            messages_dropped = snapshot.messages_dropped,
            acks_remapped = snapshot.acks_remapped,
            malformed_frames = snapshot.malformed_frames,
            connect_rejections = snapshot.connect_rejections,
            capacity_pauses = snapshot.capacity_pauses,
            connection_errors = snapshot.connection_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Proxy metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub handshakes_total: u64,
    pub handshakes_success: u64,
    pub handshakes_failed: u64,
    pub sessions_created: u64,
    pub sessions_active: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub acks_remapped: u64,
    pub malformed_frames: u64,
    pub connect_rejections: u64,
    pub capacity_pauses: u64,
    pub connection_errors: u64,
    pub uptime_seconds: u64,
}

static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

/// Initialize metrics collection (call once at startup)
pub fn init_metrics() {
    let _ = global_metrics();
    info!("Metrics collection initialized");
}

/// Logs how long an operation took when dropped
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}
