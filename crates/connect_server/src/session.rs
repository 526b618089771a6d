//! Client session representation.
//!
//! A [`Session`] is the server-side record of one approved, connected client.
//! It is only ever built by the acceptor after every accept policy allowed the
//! underlying connection.

use crate::error::TransportError;
use crate::interpreter::{InterpreterContext, InterpreterFactory, PacketInterpreter};
use crate::transport::{Connection, ReceiveOptions};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Address assigned to a session whose transport reports no endpoint.
pub const UNKNOWN_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::BROADCAST);

/// Unique identifier of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One connected client.
///
/// Address, port and timeout are fixed at construction.
pub struct Session {
    id: SessionId,
    connection: Arc<dyn Connection>,
    address: IpAddr,
    port: u16,
    timeout: Duration,
    max_receive_size: usize,
    interpreter: Arc<dyn PacketInterpreter>,
    connected_at: SystemTime,
}

impl Session {
    /// Builds a session around an accepted connection.
    ///
    /// The interpreter is created here, once, from `interpreters`.
    pub fn new(
        connection: Arc<dyn Connection>,
        timeout: Duration,
        max_receive_size: usize,
        interpreters: &dyn InterpreterFactory,
    ) -> Self {
        let (address, port) = match connection.endpoint() {
            Some(endpoint) => (endpoint.ip(), endpoint.port()),
            None => (UNKNOWN_ADDRESS, 0),
        };

        let interpreter = interpreters.create(InterpreterContext {
            connection: connection.clone(),
            idle_timeout: timeout,
            max_receive_size,
        });

        Self {
            id: SessionId::new(),
            connection,
            address,
            port,
            timeout,
            max_receive_size,
            interpreter,
            connected_at: SystemTime::now(),
        }
    }

    /// Identity of the session, unique for the process lifetime.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Remote IP, or [`UNKNOWN_ADDRESS`] when the transport reported none.
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// Remote port, `0` when the transport reported no endpoint.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Remote endpoint as reported at construction.
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Configured idle timeout, enforced by the receive layer.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Configured maximum receive size, enforced by the receive layer.
    pub fn max_receive_size(&self) -> usize {
        self.max_receive_size
    }

    /// The underlying transport handle.
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// The interpreter created for this session.
    pub fn interpreter(&self) -> &Arc<dyn PacketInterpreter> {
        &self.interpreter
    }

    /// When the session was constructed.
    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    /// Sends the protocol hello to the peer.
    pub async fn send_hello(&self, hello: &[u8]) -> Result<(), TransportError> {
        self.connection.send(hello).await
    }

    /// Runs the receive loop until the connection closes.
    pub async fn begin_receive(&self) -> Result<(), TransportError> {
        let options = ReceiveOptions {
            idle_timeout: self.timeout,
            max_receive_size: self.max_receive_size,
        };
        self.connection.receive(self.interpreter.clone(), options).await
    }

    /// Closes the transport. The disconnect cascade follows from the close.
    pub async fn disconnect(&self) {
        self.connection.close().await;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::TracingInterpreter;
    use crate::transport::{MemoryPeerOptions, MemoryTransport, Transport};

    async fn accepted(options: MemoryPeerOptions) -> Arc<dyn Connection> {
        let transport = MemoryTransport::new();
        let mut listener = transport.listen(9100, 4).await.unwrap();
        let _peer = transport.connector().connect(9100, options).unwrap();
        listener.accept().await.unwrap().accept().unwrap()
    }

    #[tokio::test]
    async fn test_session_takes_endpoint_from_transport() {
        let connection = accepted(MemoryPeerOptions::from_endpoint("192.168.1.20:55000".parse().unwrap())).await;
        let session = Session::new(connection, Duration::from_secs(5), 6, &TracingInterpreter::factory());

        assert_eq!(session.address(), "192.168.1.20".parse::<IpAddr>().unwrap());
        assert_eq!(session.port(), 55000);
        assert_eq!(session.timeout(), Duration::from_secs(5));
        assert_eq!(session.max_receive_size(), 6);
    }

    #[tokio::test]
    async fn test_session_without_endpoint_uses_unknown_address() {
        let connection = accepted(MemoryPeerOptions::default()).await;
        let session = Session::new(connection, Duration::from_secs(5), 6, &TracingInterpreter::factory());

        assert_eq!(session.address(), UNKNOWN_ADDRESS);
        assert_eq!(session.port(), 0);
    }

    #[tokio::test]
    async fn test_each_session_gets_its_own_interpreter() {
        let created = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let factory = {
            let created = created.clone();
            move |_context: InterpreterContext| -> Arc<dyn PacketInterpreter> {
                created.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Arc::new(TracingInterpreter::default())
            }
        };

        let first = Session::new(accepted(MemoryPeerOptions::default()).await, Duration::ZERO, 6, &factory);
        let second = Session::new(accepted(MemoryPeerOptions::default()).await, Duration::ZERO, 6, &factory);

        assert_eq!(created.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_ne!(first.id(), second.id());
        assert!(!Arc::ptr_eq(first.interpreter(), second.interpreter()));
    }
}
