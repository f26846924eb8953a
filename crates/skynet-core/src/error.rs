//! Error taxonomy for the Skynet fabric.
//!
//! Dial-level failures are retried by the pool, write failures are
//! retried by the connection as a whole send, and read failures after
//! a successful write are surfaced unless the caller declared the
//! call idempotent. Everything else propagates to the caller.

use std::time::Duration;

/// Errors surfaced by the registry, pool, connection, and client layers.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// TCP dial exhausted its retries. Triggers endpoint failover in
    /// the client when rooted in ECONNREFUSED.
    #[error("connection to {endpoint} failed after {attempts} attempts: {source}")]
    ConnectionFailure {
        endpoint: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// A framed read exceeded the configured read timeout.
    #[error("read timed out after {}s", .0.as_secs_f64())]
    ReadTimeout(Duration),

    /// Framing error, sequence mismatch, malformed handshake, or a
    /// servicemethod without the ".Forward" suffix. Terminal for the
    /// connection it occurred on.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Non-empty `error` in a response header from the peer.
    #[error("skynet error from peer: {0}")]
    Skynet(String),

    /// Non-empty `error` in a response body from the peer.
    #[error("service error from peer: {0}")]
    Service(String),

    /// The registry has no endpoints for the requested tuple.
    #[error("no servers available for service {name} version {version} in region {region}")]
    ServiceUnavailable {
        name: String,
        version: String,
        region: String,
    },

    /// A handler registered at the server does not satisfy the
    /// service contract.
    #[error("invalid service: {0}")]
    InvalidService(String),

    /// Timed out waiting to borrow a pooled connection.
    #[error("timed out borrowing a connection to {endpoint} after {}s", .waited.as_secs_f64())]
    PoolTimeout { endpoint: String, waited: Duration },

    /// Transport-level I/O on an established connection.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// True when the failure is a dial refused by the remote end —
    /// the one condition the client fails over on.
    pub fn is_connection_refused(&self) -> bool {
        matches!(
            self,
            RpcError::ConnectionFailure { source, .. }
                if source.kind() == std::io::ErrorKind::ConnectionRefused
        )
    }

    /// True for transport faults where the peer may never have seen
    /// the request: safe to retry the whole send on a fresh
    /// connection.
    pub fn is_transport(&self) -> bool {
        matches!(self, RpcError::Io(_) | RpcError::ReadTimeout(_))
    }
}
