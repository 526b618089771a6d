//! # Connect Server - Connection Lifecycle Core
//!
//! The gateway tier of the game server: it accepts client transport
//! connections, performs the initial protocol handshake and exposes every
//! connection to the rest of the server as a tracked session.
//!
//! ## Architecture Overview
//!
//! * **Session** - one connected client: transport handle, remote address and
//!   port, idle timeout, attached packet interpreter
//! * **AcceptPolicyChain** - ordered veto over raw connections, first denial wins
//! * **DisconnectHookChain** - ordered notification of disconnecting sessions,
//!   every hook always runs
//! * **SessionRegistry** - the concurrency-safe set of live sessions plus a
//!   payload-free change signal
//! * **ConnectionAcceptor** - the accept loop tying the above together
//!
//! ### Connection Flow
//!
//! 1. The transport hands over a raw candidate
//! 2. The accept policy chain decides; a denied candidate is closed, nothing else
//! 3. A session is built and the hello is sent to the peer
//! 4. The session is registered and the change signal fires
//! 5. The receive loop starts
//! 6. On disconnect the hooks run, the session is removed, the signal fires
//!
//! ## Example
//!
//! ```rust,no_run
//! use connect_server::{ConnectServerConfig, ConnectionAcceptor, TcpTransport, TracingInterpreter};
//!
//! # async fn run() -> Result<(), connect_server::ConnectServerError> {
//! let config = ConnectServerConfig::default();
//! let acceptor = ConnectionAcceptor::builder(config.clone(), TcpTransport::default(), TracingInterpreter::factory())
//!     .build()?;
//!
//! acceptor.start(config.client_listener_port, config.listener_backlog).await?;
//! // ...
//! acceptor.stop().await;
//! acceptor.disconnect_all().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Only start-up failures reach the caller ([`ConnectServerError`]). Policy
//! failures count as denials, hook failures are logged and skipped, and a
//! failed handshake drops the connection before it is ever registered.

pub use config::ConnectServerConfig;
pub use error::{ConnectServerError, HookError, InterpreterError, PolicyError, TransportError};
pub use handshake::HELLO_PACKET;
pub use hooks::{DisconnectHook, DisconnectHookChain, LoggingHook};
pub use interpreter::{InterpreterContext, InterpreterFactory, PacketInterpreter, TracingInterpreter};
pub use policy::{AcceptPolicy, AcceptPolicyChain, BlocklistPolicy, Decision, MaxSessionsPolicy, Verdict};
pub use registry::{Admission, SessionRegistry};
pub use server::{AcceptorBuilder, ConnectionAcceptor};
pub use session::{Session, SessionId, UNKNOWN_ADDRESS};
pub use transport::{MemoryTransport, TcpTransport, Transport};

pub mod config;
pub mod error;
pub mod handshake;
pub mod hooks;
pub mod interpreter;
pub mod policy;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;
