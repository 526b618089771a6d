//! Transport collaborator contract.
//!
//! The acceptor never touches sockets directly. It asks a [`Transport`] for a
//! [`Listener`], receives raw [`PendingConnection`] candidates from it and
//! either rejects them or finalizes them into a [`Connection`] handle.
//!
//! Two implementations ship with the crate:
//!
//! * [`tcp::TcpTransport`] - tokio TCP sockets, used by the gateway binary
//! * [`memory::MemoryTransport`] - in-process loopback for tests and embedding

pub mod memory;
pub mod tcp;

use crate::error::TransportError;
use crate::interpreter::PacketInterpreter;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub use memory::{MemoryConnector, MemoryPeer, MemoryPeerOptions, MemoryTransport, WireEvent};
pub use tcp::TcpTransport;

/// Limits the receive layer applies to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Close the connection after this long without inbound data; zero disables it
    pub idle_timeout: Duration,
    /// Upper bound of a single delivered chunk
    pub max_receive_size: usize,
}

/// Factory for listeners.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Binds `port` with the given pending-connection `backlog`.
    async fn listen(&self, port: u16, backlog: u32) -> Result<Box<dyn Listener>, TransportError>;
}

/// A bound listener producing raw connection candidates.
///
/// Dropping the listener releases the port.
#[async_trait]
pub trait Listener: Send {
    /// Waits for the next raw candidate.
    async fn accept(&mut self) -> Result<Box<dyn PendingConnection>, TransportError>;

    /// The address the listener is bound to.
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// A raw connection that has not been approved yet.
pub trait PendingConnection: Send {
    /// Remote endpoint of the candidate, if the transport knows it.
    fn endpoint(&self) -> Option<SocketAddr>;

    /// Closes the raw transport without any further side effect.
    fn reject(self: Box<Self>);

    /// Finalizes the candidate into a connection handle.
    fn accept(self: Box<Self>) -> Result<Arc<dyn Connection>, TransportError>;
}

/// Handle of an accepted connection.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Remote endpoint, if the transport knows it.
    fn endpoint(&self) -> Option<SocketAddr>;

    /// Queues `data` for the peer.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Runs the receive loop, handing inbound chunks to `interpreter`.
    ///
    /// Returns once the peer disconnects, the idle timeout elapses or
    /// [`close`](Connection::close) is called. May only be called once.
    async fn receive(
        &self,
        interpreter: Arc<dyn PacketInterpreter>,
        options: ReceiveOptions,
    ) -> Result<(), TransportError>;

    /// Closes the connection. Idempotent.
    async fn close(&self);

    /// Resolves once the connection is closed, from either side.
    async fn closed(&self);

    /// Whether the connection has been closed.
    fn is_closed(&self) -> bool;
}
