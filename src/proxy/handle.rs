//! Registry-facing handle to a session running on its own task.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

use crate::channel::{ChannelRef, Connector};
use crate::core::message::Connect;
use crate::proxy::session::{ProxySession, SessionOptions, SessionShared};
use crate::utils::metrics::global_metrics;

/// Cloneable handle to a spawned [`ProxySession`]
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
    shutdown: CancellationToken,
    task: Arc<JoinHandle<()>>,
}

impl SessionHandle {
    /// Create the session for `original_connect` and start it on a new task.
    /// The task connects to the broker and then serves channel events until
    /// the session is finished or shut down. Must be called within a tokio
    /// runtime.
    pub fn spawn(
        original_connect: Connect,
        connector: Arc<dyn Connector>,
        options: SessionOptions,
    ) -> Self {
        let span = info_span!("proxy_session", client_id = %original_connect.client_id);
        let (mut session, mut events) = ProxySession::new(original_connect, connector, options);
        let shared = session.shared();
        let shutdown = CancellationToken::new();
        let cancelled = shutdown.clone();

        let task = tokio::spawn(
            async move {
                global_metrics().session_started();
                session.init();

                while !session.is_finished() {
                    tokio::select! {
                        biased;
                        _ = cancelled.cancelled() => break,
                        event = events.recv() => match event {
                            Some(event) => session.handle_event(event),
                            None => break,
                        },
                    }
                }

                session.shutdown();
                global_metrics().session_ended();
                debug!("Session task finished");
            }
            .instrument(span),
        );

        Self {
            shared,
            shutdown,
            task: Arc::new(task),
        }
    }

    pub fn client_id(&self) -> &str {
        self.shared.client_id()
    }

    /// Hand a connection whose first message was `connect` to the session.
    /// False if the session no longer accepts connections.
    pub fn new_connection(&self, channel: ChannelRef, connect: Connect) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        self.shared.new_connection(channel, connect)
    }

    /// Ask the session to close every channel. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// The session task has exited and released its channels
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.shared.is_disconnected() || self.task.is_finished()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("client_id", &self.client_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
