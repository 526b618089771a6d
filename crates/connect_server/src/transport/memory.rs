//! In-process loopback transport.
//!
//! Every connection keeps an ordered log of what happened on its wire, which
//! makes lifecycle ordering observable without real sockets.

use super::tcp::wait_closed;
use super::{Connection, Listener, PendingConnection, ReceiveOptions, Transport};
use crate::error::TransportError;
use crate::interpreter::PacketInterpreter;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::warn;

const FIRST_EPHEMERAL_PORT: u16 = 49152;

type PortTable = Arc<Mutex<HashMap<u16, mpsc::Sender<Incoming>>>>;

/// What a listener's queue carries.
enum Incoming {
    Candidate(MemoryPending),
    /// The next `accept` call fails with this error kind
    Fault(io::ErrorKind),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Something observable that happened on a memory connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    /// The server sent these bytes to the peer
    Sent(Vec<u8>),
    /// The server started its receive loop
    ReceiveStarted,
    /// The candidate was rejected before becoming a connection
    Rejected,
    /// The connection was closed, by either side
    Closed,
}

/// Loopback transport. Clones share the same port table.
#[derive(Clone)]
pub struct MemoryTransport {
    ports: PortTable,
    next_ephemeral: Arc<AtomicU16>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            ports: Arc::new(Mutex::new(HashMap::new())),
            next_ephemeral: Arc::new(AtomicU16::new(FIRST_EPHEMERAL_PORT)),
        }
    }

    /// Returns a handle that opens client connections against this transport.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            ports: self.ports.clone(),
        }
    }

    /// Whether a listener is currently bound to `port`.
    pub fn is_listening(&self, port: u16) -> bool {
        lock(&self.ports).contains_key(&port)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn listen(&self, port: u16, backlog: u32) -> Result<Box<dyn Listener>, TransportError> {
        let port = if port == 0 {
            self.next_ephemeral.fetch_add(1, Ordering::Relaxed)
        } else {
            port
        };

        let mut ports = lock(&self.ports);
        if ports.contains_key(&port) {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, format!("port {port} is in use")).into());
        }

        let (sender, receiver) = mpsc::channel(backlog.max(1) as usize);
        ports.insert(port, sender);

        Ok(Box::new(MemoryListener {
            port,
            receiver,
            ports: self.ports.clone(),
        }))
    }
}

struct MemoryListener {
    port: u16,
    receiver: mpsc::Receiver<Incoming>,
    ports: PortTable,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&mut self) -> Result<Box<dyn PendingConnection>, TransportError> {
        match self.receiver.recv().await {
            Some(Incoming::Candidate(pending)) => Ok(Box::new(pending)),
            Some(Incoming::Fault(kind)) => Err(io::Error::from(kind).into()),
            None => Err(TransportError::Closed),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddr::from(([127, 0, 0, 1], self.port)))
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        lock(&self.ports).remove(&self.port);
        // Candidates still queued were never accepted; refuse them.
        self.receiver.close();
        while let Ok(incoming) = self.receiver.try_recv() {
            if let Incoming::Candidate(pending) = incoming {
                pending.wire.close_now();
            }
        }
    }
}

/// How a memory peer behaves.
#[derive(Debug, Clone, Default)]
pub struct MemoryPeerOptions {
    /// Endpoint the server sees; `None` simulates a transport that reports none
    pub endpoint: Option<SocketAddr>,
    /// Every server send to this peer fails
    pub fail_send: bool,
    /// Delay applied to every server send to this peer
    pub send_delay: Option<Duration>,
    /// The candidate breaks while the server finalizes it
    pub fail_accept: bool,
}

impl MemoryPeerOptions {
    pub fn from_endpoint(endpoint: SocketAddr) -> Self {
        Self {
            endpoint: Some(endpoint),
            ..Default::default()
        }
    }
}

/// Opens client connections against a [`MemoryTransport`].
#[derive(Clone)]
pub struct MemoryConnector {
    ports: PortTable,
}

impl MemoryConnector {
    /// Connects to `port` with the given peer behavior.
    pub fn connect(&self, port: u16, options: MemoryPeerOptions) -> Result<MemoryPeer, TransportError> {
        let sender = lock(&self.ports)
            .get(&port)
            .cloned()
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let wire = Arc::new(Wire {
            endpoint: options.endpoint,
            events: Mutex::new(Vec::new()),
            inbound: tokio::sync::Mutex::new(Some(inbound_rx)),
            closed,
            fail_send: options.fail_send,
            send_delay: options.send_delay,
        });

        sender
            .try_send(Incoming::Candidate(MemoryPending {
                wire: wire.clone(),
                fail_accept: options.fail_accept,
            }))
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;

        Ok(MemoryPeer {
            wire,
            inbound: inbound_tx,
        })
    }

    /// Connects to `port` as a well-behaved peer at `endpoint`.
    pub fn connect_from(&self, port: u16, endpoint: SocketAddr) -> Result<MemoryPeer, TransportError> {
        self.connect(port, MemoryPeerOptions::from_endpoint(endpoint))
    }

    /// Makes the listener on `port` fail one `accept` call with `kind`.
    ///
    /// The fault is queued behind candidates that are already waiting.
    pub fn inject_accept_error(&self, port: u16, kind: io::ErrorKind) -> Result<(), TransportError> {
        let sender = lock(&self.ports)
            .get(&port)
            .cloned()
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        sender
            .try_send(Incoming::Fault(kind))
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        Ok(())
    }
}

struct Wire {
    endpoint: Option<SocketAddr>,
    events: Mutex<Vec<WireEvent>>,
    inbound: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    closed: watch::Sender<bool>,
    fail_send: bool,
    send_delay: Option<Duration>,
}

impl Wire {
    fn record(&self, event: WireEvent) {
        lock(&self.events).push(event);
    }

    fn close_now(&self) {
        if !self.closed.send_replace(true) {
            self.record(WireEvent::Closed);
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

struct MemoryPending {
    wire: Arc<Wire>,
    fail_accept: bool,
}

impl PendingConnection for MemoryPending {
    fn endpoint(&self) -> Option<SocketAddr> {
        self.wire.endpoint
    }

    fn reject(self: Box<Self>) {
        self.wire.record(WireEvent::Rejected);
        self.wire.close_now();
    }

    fn accept(self: Box<Self>) -> Result<Arc<dyn Connection>, TransportError> {
        if self.fail_accept {
            self.wire.close_now();
            return Err(TransportError::Rejected);
        }
        Ok(Arc::new(MemoryConnection { wire: self.wire }))
    }
}

struct MemoryConnection {
    wire: Arc<Wire>,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn endpoint(&self) -> Option<SocketAddr> {
        self.wire.endpoint
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if let Some(delay) = self.wire.send_delay {
            tokio::time::sleep(delay).await;
        }
        if self.wire.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.wire.fail_send {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
        }
        self.wire.record(WireEvent::Sent(data.to_vec()));
        Ok(())
    }

    async fn receive(
        &self,
        interpreter: Arc<dyn PacketInterpreter>,
        options: ReceiveOptions,
    ) -> Result<(), TransportError> {
        let mut inbound = self
            .wire
            .inbound
            .lock()
            .await
            .take()
            .ok_or(TransportError::ReceiveStarted)?;
        self.wire.record(WireEvent::ReceiveStarted);

        let mut closed = self.wire.closed.subscribe();
        let chunk_size = options.max_receive_size.max(1);

        loop {
            if *closed.borrow() {
                break;
            }

            let next = tokio::select! {
                next = next_inbound(&mut inbound, options.idle_timeout) => next,
                _ = wait_closed(&mut closed) => break,
            };

            match next {
                Some(Some(data)) => {
                    for chunk in data.chunks(chunk_size) {
                        if let Err(e) = interpreter.handle_packet(chunk).await {
                            warn!("Packet from {:?} could not be handled: {}", self.wire.endpoint, e);
                        }
                    }
                }
                // Peer hung up or went idle.
                Some(None) | None => break,
            }
        }

        self.wire.close_now();
        Ok(())
    }

    async fn close(&self) {
        self.wire.close_now();
    }

    async fn closed(&self) {
        let mut closed = self.wire.closed.subscribe();
        wait_closed(&mut closed).await;
    }

    fn is_closed(&self) -> bool {
        self.wire.is_closed()
    }
}

/// `None` means the idle timeout elapsed, `Some(None)` that the peer hung up.
async fn next_inbound(
    inbound: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    idle_timeout: Duration,
) -> Option<Option<Vec<u8>>> {
    if idle_timeout.is_zero() {
        return Some(inbound.recv().await);
    }
    tokio::time::timeout(idle_timeout, inbound.recv()).await.ok()
}

/// Client side of a memory connection.
pub struct MemoryPeer {
    wire: Arc<Wire>,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl MemoryPeer {
    /// Sends bytes to the server. Returns `false` once the connection is closed.
    pub fn send(&self, data: &[u8]) -> bool {
        !self.wire.is_closed() && self.inbound.send(data.to_vec()).is_ok()
    }

    /// Drops the connection abruptly.
    pub fn disconnect(&self) {
        self.wire.close_now();
    }

    /// Everything that happened on the wire so far, in order.
    pub fn events(&self) -> Vec<WireEvent> {
        lock(&self.wire.events).clone()
    }

    /// Payloads the server sent, in order.
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                WireEvent::Sent(data) => Some(data),
                _ => None,
            })
            .collect()
    }

    pub fn was_rejected(&self) -> bool {
        self.events().contains(&WireEvent::Rejected)
    }

    pub fn is_closed(&self) -> bool {
        self.wire.is_closed()
    }

    /// Waits until the connection is closed.
    pub async fn wait_closed(&self) {
        let mut closed = self.wire.closed.subscribe();
        wait_closed(&mut closed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listen_twice_on_same_port() {
        let transport = MemoryTransport::new();
        let _listener = transport.listen(7000, 8).await.unwrap();

        let second = transport.listen(7000, 8).await;
        assert_eq!(second.err().and_then(|e| e.io_kind()), Some(io::ErrorKind::AddrInUse));
    }

    #[tokio::test]
    async fn test_dropping_listener_releases_port() {
        let transport = MemoryTransport::new();
        let connector = transport.connector();
        let listener = transport.listen(7001, 8).await.unwrap();
        assert!(transport.is_listening(7001));

        let queued = connector.connect(7001, MemoryPeerOptions::default()).unwrap();
        drop(listener);

        assert!(!transport.is_listening(7001));
        assert!(queued.is_closed());
        let refused = connector.connect(7001, MemoryPeerOptions::default());
        assert_eq!(refused.err().and_then(|e| e.io_kind()), Some(io::ErrorKind::ConnectionRefused));
    }

    #[tokio::test]
    async fn test_reject_records_and_closes() {
        let transport = MemoryTransport::new();
        let mut listener = transport.listen(7002, 8).await.unwrap();
        let peer = transport
            .connector()
            .connect_from(7002, "10.0.0.1:5000".parse().unwrap())
            .unwrap();

        let pending = listener.accept().await.unwrap();
        assert_eq!(pending.endpoint(), Some("10.0.0.1:5000".parse().unwrap()));
        pending.reject();

        assert_eq!(peer.events(), vec![WireEvent::Rejected, WireEvent::Closed]);
    }

    #[tokio::test]
    async fn test_ephemeral_ports_are_distinct() {
        let transport = MemoryTransport::new();
        let first = transport.listen(0, 8).await.unwrap();
        let second = transport.listen(0, 8).await.unwrap();
        assert_ne!(first.local_addr(), second.local_addr());
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let transport = MemoryTransport::new();
        let connector = transport.connector();
        let mut listener = transport.listen(7003, 8).await.unwrap();

        connector.inject_accept_error(7003, io::ErrorKind::ConnectionAborted).unwrap();
        let broken = connector
            .connect(
                7003,
                MemoryPeerOptions {
                    fail_accept: true,
                    ..Default::default()
                },
            )
            .unwrap();

        let fault = listener.accept().await.err();
        assert_eq!(fault.and_then(|e| e.io_kind()), Some(io::ErrorKind::ConnectionAborted));

        let pending = listener.accept().await.unwrap();
        assert!(matches!(pending.accept(), Err(TransportError::Rejected)));
        assert!(broken.is_closed());
        assert!(connector.inject_accept_error(7004, io::ErrorKind::Other).is_err());
    }
}
