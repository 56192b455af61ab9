//! Timeout defaults and an async wrapper that maps elapsed deadlines onto
//! [`ProtocolError::Timeout`].

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Time a new client has to send its CONNECT
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for the broker connection to be established
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long shutdown waits for active connections to finish
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Await `future`, failing with `Timeout` once `duration` has elapsed.
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
