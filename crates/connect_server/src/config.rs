//! Connect server configuration types and defaults.
//!
//! This module contains the settings the acceptor carries into every session.
//! Loading them from disk is the job of the surrounding application.

use std::time::Duration;

/// Default port of the client listener.
pub const DEFAULT_CLIENT_LISTENER_PORT: u16 = 44405;

/// Configuration structure for the connect server core.
///
/// The acceptor itself never enforces `timeout` or `maximum_receive_size`; it
/// hands both to each session so the receive layer can.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectServerConfig {
    /// The port client connections are accepted on
    pub client_listener_port: u16,

    /// Length of the pending connection queue of the listener
    pub listener_backlog: u32,

    /// Idle timeout for a session; zero disables it
    pub timeout: Duration,

    /// Maximum number of bytes a single receive may deliver
    pub maximum_receive_size: usize,

    /// Maximum number of concurrently registered sessions
    pub max_connections: usize,
}

impl Default for ConnectServerConfig {
    fn default() -> Self {
        Self {
            client_listener_port: DEFAULT_CLIENT_LISTENER_PORT,
            listener_backlog: 1000,
            timeout: Duration::from_secs(60),
            maximum_receive_size: 6,
            max_connections: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConnectServerConfig::default();
        assert_eq!(config.client_listener_port, 44405);
        assert_eq!(config.listener_backlog, 1000);
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.maximum_receive_size, 6);
    }
}
