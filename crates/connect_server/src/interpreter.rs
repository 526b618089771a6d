//! Packet interpreter collaborator contract.
//!
//! The core only creates an interpreter for each approved session and attaches
//! it; what the interpreter does with the bytes is outside of this crate.

use crate::error::InterpreterError;
use crate::transport::Connection;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Handles inbound data of one session.
#[async_trait]
pub trait PacketInterpreter: Send + Sync {
    /// Handles one chunk delivered by the receive loop.
    async fn handle_packet(&self, packet: &[u8]) -> Result<(), InterpreterError>;
}

/// Everything an interpreter is constructed with.
#[derive(Clone)]
pub struct InterpreterContext {
    /// The session's transport handle, for replies
    pub connection: Arc<dyn Connection>,
    /// Configured idle timeout of the session
    pub idle_timeout: Duration,
    /// Configured maximum receive size of the session
    pub max_receive_size: usize,
}

/// Creates one interpreter per session. Never reused across sessions.
pub trait InterpreterFactory: Send + Sync + 'static {
    fn create(&self, context: InterpreterContext) -> Arc<dyn PacketInterpreter>;
}

impl<F> InterpreterFactory for F
where
    F: Fn(InterpreterContext) -> Arc<dyn PacketInterpreter> + Send + Sync + 'static,
{
    fn create(&self, context: InterpreterContext) -> Arc<dyn PacketInterpreter> {
        (self)(context)
    }
}

/// Interpreter that only traces what it receives.
#[derive(Debug, Default)]
pub struct TracingInterpreter {
    peer: Option<std::net::SocketAddr>,
}

impl TracingInterpreter {
    /// Factory producing a `TracingInterpreter` per session.
    pub fn factory() -> impl InterpreterFactory {
        |context: InterpreterContext| -> Arc<dyn PacketInterpreter> {
            Arc::new(TracingInterpreter {
                peer: context.connection.endpoint(),
            })
        }
    }
}

#[async_trait]
impl PacketInterpreter for TracingInterpreter {
    async fn handle_packet(&self, packet: &[u8]) -> Result<(), InterpreterError> {
        trace!(peer = ?self.peer, bytes = packet.len(), "packet received");
        Ok(())
    }
}
