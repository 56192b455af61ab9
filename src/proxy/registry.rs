//! Maps client identities to their proxy sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::channel::{ChannelRef, Connector};
use crate::core::message::Connect;
use crate::proxy::handle::SessionHandle;
use crate::proxy::session::SessionOptions;

/// Routes new connections to the session for their client id, creating
/// sessions on demand
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionHandle>>,
    connector: Arc<dyn Connector>,
    options: SessionOptions,
}

impl SessionRegistry {
    pub fn new(connector: Arc<dyn Connector>, options: SessionOptions) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            connector,
            options,
        }
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Give `channel`, whose first message was `connect`, to the session for
    /// its client id. A closed session is replaced by a new one whose broker
    /// CONNECT is `connect`.
    ///
    /// Returns false if no session took the channel; the caller should close it.
    pub fn dispatch(&self, channel: ChannelRef, connect: Connect) -> bool {
        let mut sessions = self.lock_sessions();
        sessions.retain(|_, handle| !handle.is_closed());

        if let Some(handle) = sessions.get(&connect.client_id) {
            if handle.new_connection(channel.clone(), connect.clone()) {
                debug!(client_id = %connect.client_id, channel = %channel.id(), "Joined existing session");
                return true;
            }
            sessions.remove(&connect.client_id);
        }

        info!(client_id = %connect.client_id, "Creating proxy session");
        let client_id = connect.client_id.clone();
        let handle = SessionHandle::spawn(connect.clone(), self.connector.clone(), self.options.clone());
        let accepted = handle.new_connection(channel, connect);
        sessions.insert(client_id, handle);
        accepted
    }

    pub fn session(&self, client_id: &str) -> Option<SessionHandle> {
        self.lock_sessions()
            .get(client_id)
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    /// Number of sessions that are still open
    pub fn len(&self) -> usize {
        self.lock_sessions()
            .values()
            .filter(|handle| !handle.is_closed())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shut down and forget every session, returning their handles so the
    /// caller can wait for them to finish
    pub fn shutdown_all(&self) -> Vec<SessionHandle> {
        let sessions: Vec<SessionHandle> = self.lock_sessions().drain().map(|(_, h)| h).collect();
        info!(sessions = sessions.len(), "Shutting down all sessions");
        for handle in &sessions {
            handle.shutdown();
        }
        sessions
    }
}
