//! Core connection acceptor implementation.
//!
//! This module contains the [`ConnectionAcceptor`] and its builder. The
//! acceptor owns the accept loop and drives every connection through policy
//! evaluation, handshake, registration and the disconnect cascade.

use super::handlers::{accept_loop, AcceptorContext};
use crate::config::ConnectServerConfig;
use crate::error::ConnectServerError;
use crate::handshake::HELLO_PACKET;
use crate::hooks::{DisconnectHook, DisconnectHookChain};
use crate::interpreter::InterpreterFactory;
use crate::policy::{AcceptPolicy, AcceptPolicyChain};
use crate::registry::SessionRegistry;
use crate::session::Session;
use crate::transport::Transport;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Bookkeeping of a running accept loop.
struct RunningListener {
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Accepts client connections and tracks them as sessions.
///
/// # Lifecycle
///
/// * `start` binds the listener and spawns the accept loop
/// * every raw connection runs through the accept policy chain; a denied one
///   is closed without creating a session
/// * an approved connection gets a session, the hello, a registry entry and
///   finally its receive loop, in that order
/// * when the transport disconnects, the disconnect hooks run and the session
///   leaves the registry
/// * `stop` ends the accept loop only; registered sessions live on until they
///   disconnect or [`disconnect_all`](Self::disconnect_all) is called
pub struct ConnectionAcceptor {
    context: Arc<AcceptorContext>,
    transport: Arc<dyn Transport>,
    running: Mutex<Option<RunningListener>>,
}

impl ConnectionAcceptor {
    /// Starts building an acceptor.
    ///
    /// # Arguments
    ///
    /// * `config` - Limits carried into every session
    /// * `transport` - Where connections come from
    /// * `interpreters` - Creates the packet interpreter of each session
    pub fn builder(
        config: ConnectServerConfig,
        transport: impl Transport,
        interpreters: impl InterpreterFactory,
    ) -> AcceptorBuilder {
        AcceptorBuilder {
            config,
            transport: Arc::new(transport),
            interpreters: Arc::new(interpreters),
            handshake: HELLO_PACKET.to_vec(),
            accept_policies: AcceptPolicyChain::new(),
            disconnect_hooks: DisconnectHookChain::new(),
            registry: None,
        }
    }

    /// Binds `port` and starts accepting connections.
    ///
    /// Returns the bound local address. Calling `start` while the acceptor is
    /// already running is refused with [`ConnectServerError::AlreadyStarted`]
    /// and leaves the running listener untouched.
    ///
    /// # Errors
    ///
    /// [`ConnectServerError::Bind`] if the port cannot be bound.
    pub async fn start(&self, port: u16, backlog: u32) -> Result<SocketAddr, ConnectServerError> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            if !current.task.is_finished() {
                warn!("Client listener already running on {}, ignoring start", current.local_addr);
                return Err(ConnectServerError::AlreadyStarted(current.local_addr));
            }
        }

        let listener = self
            .transport
            .listen(port, backlog)
            .await
            .map_err(|source| ConnectServerError::Bind { port, source })?;
        let local_addr = listener
            .local_addr()
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], port)));

        let (stop, stop_receiver) = watch::channel(false);
        let task = tokio::spawn(accept_loop(listener, self.context.clone(), stop_receiver));
        *running = Some(RunningListener {
            local_addr,
            stop,
            task,
        });

        info!("🚀 Client listener started on {} (backlog {})", local_addr, backlog);
        Ok(local_addr)
    }

    /// Stops accepting new connections. Idempotent.
    ///
    /// Returns after the accept loop has ended and the listener is released.
    /// Sessions that are already registered or mid-handshake are not touched.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        let _ = running.stop.send(true);
        if let Err(e) = running.task.await {
            error!("Accept loop on {} ended abnormally: {}", running.local_addr, e);
        }
        info!("🛑 Client listener stopped");
    }

    /// Whether the accept loop is running.
    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Address of the running listener.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|running| running.local_addr)
    }

    /// The live session registry.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.context.registry.clone()
    }

    /// Snapshot of the connected sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.context.registry.snapshot()
    }

    /// The limits this acceptor carries into every session.
    pub fn config(&self) -> &ConnectServerConfig {
        &self.context.config
    }

    /// Closes every registered session.
    ///
    /// Each session then runs its own disconnect cascade; use
    /// [`wait_until_empty`](Self::wait_until_empty) to wait for it.
    pub async fn disconnect_all(&self) {
        let sessions = self.context.registry.snapshot();
        if sessions.is_empty() {
            return;
        }
        info!("🧹 Disconnecting {} client session(s)", sessions.len());
        futures::future::join_all(sessions.iter().map(|session| session.disconnect())).await;
    }

    /// Waits until no session is registered. Returns `false` on timeout.
    pub async fn wait_until_empty(&self, timeout: Duration) -> bool {
        let registry = &self.context.registry;
        let mut changes = registry.subscribe();
        tokio::time::timeout(timeout, async {
            while !registry.is_empty() {
                if changes.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok()
    }
}

/// Builder for [`ConnectionAcceptor`].
///
/// Policies and hooks keep the order they are added in.
pub struct AcceptorBuilder {
    config: ConnectServerConfig,
    transport: Arc<dyn Transport>,
    interpreters: Arc<dyn InterpreterFactory>,
    handshake: Vec<u8>,
    accept_policies: AcceptPolicyChain,
    disconnect_hooks: DisconnectHookChain,
    registry: Option<Arc<SessionRegistry>>,
}

impl AcceptorBuilder {
    /// Appends an accept policy.
    pub fn with_accept_policy(mut self, policy: Arc<dyn AcceptPolicy>) -> Self {
        self.accept_policies.push(policy);
        self
    }

    /// Appends a disconnect hook.
    pub fn with_disconnect_hook(mut self, hook: Arc<dyn DisconnectHook>) -> Self {
        self.disconnect_hooks.push(hook);
        self
    }

    /// Replaces the hello sent to every approved client.
    pub fn with_handshake(mut self, handshake: impl Into<Vec<u8>>) -> Self {
        self.handshake = handshake.into();
        self
    }

    /// Uses an existing registry, e.g. one a policy already observes.
    pub fn with_registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Builds the acceptor.
    ///
    /// # Errors
    ///
    /// [`ConnectServerError::Config`] for an empty handshake or a zero
    /// maximum receive size.
    pub fn build(self) -> Result<ConnectionAcceptor, ConnectServerError> {
        if self.handshake.is_empty() {
            return Err(ConnectServerError::Config("handshake must not be empty".to_string()));
        }
        if self.config.maximum_receive_size == 0 {
            return Err(ConnectServerError::Config(
                "maximum receive size must be greater than zero".to_string(),
            ));
        }

        let context = AcceptorContext {
            config: self.config,
            handshake: self.handshake,
            interpreters: self.interpreters,
            accept_policies: self.accept_policies,
            disconnect_hooks: self.disconnect_hooks,
            registry: self.registry.unwrap_or_default(),
        };

        Ok(ConnectionAcceptor {
            context: Arc::new(context),
            transport: self.transport,
            running: Mutex::new(None),
        })
    }
}
