//! TCP transport built on tokio and socket2.

use super::{Connection, Listener, PendingConnection, ReceiveOptions, Transport};
use crate::error::TransportError;
use crate::interpreter::PacketInterpreter;
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

/// Transport accepting plain TCP connections on a fixed interface.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    bind_ip: IpAddr,
}

impl TcpTransport {
    /// Creates a transport binding listeners to `bind_ip`.
    pub fn new(bind_ip: IpAddr) -> Self {
        Self { bind_ip }
    }

    /// Transport bound to the IPv4 loopback interface.
    pub fn localhost() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&self, port: u16, backlog: u32) -> Result<Box<dyn Listener>, TransportError> {
        let address = SocketAddr::new(self.bind_ip, port);

        let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true).ok();
        socket.bind(&address.into())?;
        socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

        let std_listener: StdTcpListener = socket.into();
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;

        Ok(Box::new(TcpClientListener { listener }))
    }
}

struct TcpClientListener {
    listener: TcpListener,
}

#[async_trait]
impl Listener for TcpClientListener {
    async fn accept(&mut self) -> Result<Box<dyn PendingConnection>, TransportError> {
        let (stream, endpoint) = self.listener.accept().await?;
        Ok(Box::new(TcpPending {
            stream,
            endpoint: Some(endpoint),
        }))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

struct TcpPending {
    stream: TcpStream,
    endpoint: Option<SocketAddr>,
}

impl PendingConnection for TcpPending {
    fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint
    }

    fn reject(self: Box<Self>) {
        drop(self.stream);
    }

    fn accept(self: Box<Self>) -> Result<Arc<dyn Connection>, TransportError> {
        self.stream.set_nodelay(true).ok();
        Ok(Arc::new(TcpConnection::new(self.stream, self.endpoint)))
    }
}

/// An accepted TCP connection.
pub struct TcpConnection {
    endpoint: Option<SocketAddr>,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    closed: watch::Sender<bool>,
}

impl TcpConnection {
    fn new(stream: TcpStream, endpoint: Option<SocketAddr>) -> Self {
        let (reader, writer) = stream.into_split();
        let (closed, _) = watch::channel(false);
        Self {
            endpoint,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(writer),
            closed,
        }
    }

    /// Marks the connection closed. Returns `true` for the first caller only.
    fn mark_closed(&self) -> bool {
        !self.closed.send_replace(true)
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(data).await {
            self.mark_closed();
            return Err(e.into());
        }
        Ok(())
    }

    async fn receive(
        &self,
        interpreter: Arc<dyn PacketInterpreter>,
        options: ReceiveOptions,
    ) -> Result<(), TransportError> {
        let mut reader = self
            .reader
            .lock()
            .await
            .take()
            .ok_or(TransportError::ReceiveStarted)?;
        let mut closed = self.closed.subscribe();
        let mut buffer = vec![0u8; options.max_receive_size.max(1)];

        let result = loop {
            if *closed.borrow() {
                break Ok(());
            }

            let read = tokio::select! {
                read = read_chunk(&mut reader, &mut buffer, options.idle_timeout) => read,
                _ = wait_closed(&mut closed) => break Ok(()),
            };

            match read {
                Ok(Some(0)) => break Ok(()),
                Ok(Some(len)) => {
                    if let Err(e) = interpreter.handle_packet(&buffer[..len]).await {
                        warn!("Packet from {:?} could not be handled: {}", self.endpoint, e);
                    }
                }
                Ok(None) => {
                    debug!("Connection {:?} idle for {:?}, closing", self.endpoint, options.idle_timeout);
                    break Ok(());
                }
                Err(e) => break Err(e.into()),
            }
        };

        drop(reader);
        self.close().await;
        result
    }

    async fn close(&self) {
        if !self.mark_closed() {
            return;
        }
        // A send blocked on backpressure keeps the writer; dropping the
        // connection closes the socket in that case.
        if let Ok(mut writer) = self.writer.try_lock() {
            let _ = writer.shutdown().await;
        }
    }

    async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        wait_closed(&mut closed).await;
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Reads one chunk. `Ok(None)` means the idle timeout elapsed.
async fn read_chunk(
    reader: &mut OwnedReadHalf,
    buffer: &mut [u8],
    idle_timeout: Duration,
) -> io::Result<Option<usize>> {
    if idle_timeout.is_zero() {
        return reader.read(buffer).await.map(Some);
    }
    match tokio::time::timeout(idle_timeout, reader.read(buffer)).await {
        Ok(read) => read.map(Some),
        Err(_) => Ok(None),
    }
}

pub(crate) async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}
