//! Timeout defaults and helpers.
//!
//! Every suspension point in a session (key agreement, spawn, shutdown drain)
//! is wrapped so that expiry becomes a `ProtocolError::Timeout` the caller can
//! turn into a state transition.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Session must reach the play state within this window
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Game sink must answer a spawn request within this window
pub const SPAWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between server keepalives in the play state
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// No keepalive from the peer for this long closes the session
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// No datagram at all for this long evicts the session from the registry
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(20);

/// Graceful shutdown waits at most this long for workers to finish
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Await `future`, mapping expiry to `ProtocolError::Timeout`
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
