//! Error types for the connect server core.
//!
//! Only [`ConnectServerError`] ever reaches the caller of the acceptor, and only
//! from start-up. Everything that goes wrong for a single connection is logged
//! and contained to that connection.

use std::io;

/// Errors surfaced by the [`ConnectionAcceptor`](crate::ConnectionAcceptor)
/// control operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectServerError {
    /// The listener could not be bound to the requested port.
    #[error("Failed to bind client listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: TransportError,
    },

    /// `start` was called while the accept loop is already running.
    #[error("Client listener is already running on {0}")]
    AlreadyStarted(std::net::SocketAddr),

    /// Invalid acceptor configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Errors reported by a [`Transport`](crate::transport::Transport) or one of
/// its connections.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    Closed,

    /// The candidate broke while it was being finalized.
    #[error("Connection candidate was rejected")]
    Rejected,

    #[error("Receive loop already started for this connection")]
    ReceiveStarted,
}

impl TransportError {
    /// Returns the I/O error kind when this error wraps one.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            TransportError::Io(e) => Some(e.kind()),
            _ => None,
        }
    }
}

/// Raised by an accept policy that cannot reach a decision.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Accept policy failed: {0}")]
pub struct PolicyError(pub String);

/// Raised by a disconnect hook.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Disconnect hook failed: {0}")]
pub struct HookError(pub String);

/// Raised by a packet interpreter while handling inbound data.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InterpreterError {
    #[error("Malformed packet: {0}")]
    Malformed(String),

    #[error("Packet handling failed: {0}")]
    Handler(String),
}
