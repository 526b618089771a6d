//! The connection acceptor and its per-connection lifecycle.

pub mod core;
mod handlers;

pub use self::core::{AcceptorBuilder, ConnectionAcceptor};
