//! Disconnect hooks.
//!
//! Every hook in a [`DisconnectHookChain`] sees every disconnecting session
//! exactly once, in registration order. A failing hook never stops the ones
//! after it.

use crate::error::HookError;
use crate::session::Session;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{info, warn};

/// Reacts to a session disconnecting.
pub trait DisconnectHook: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    fn notify(&self, session: &Session) -> Result<(), HookError>;
}

/// Ordered, non-short-circuiting list of disconnect hooks.
#[derive(Default)]
pub struct DisconnectHookChain {
    hooks: Vec<Arc<dyn DisconnectHook>>,
}

impl DisconnectHookChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a hook. Registration order is notification order.
    pub fn push(&mut self, hook: Arc<dyn DisconnectHook>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Notifies every hook. Returns how many of them failed.
    pub fn notify(&self, session: &Session) -> usize {
        let mut failures = 0;
        for hook in &self.hooks {
            match catch_unwind(AssertUnwindSafe(|| hook.notify(session))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    warn!("Disconnect hook '{}' failed for session {}: {}", hook.name(), session.id(), e);
                }
                Err(_) => {
                    failures += 1;
                    warn!("Disconnect hook '{}' panicked for session {}", hook.name(), session.id());
                }
            }
        }
        failures
    }
}

impl FromIterator<Arc<dyn DisconnectHook>> for DisconnectHookChain {
    fn from_iter<I: IntoIterator<Item = Arc<dyn DisconnectHook>>>(iter: I) -> Self {
        Self {
            hooks: iter.into_iter().collect(),
        }
    }
}

/// Logs every disconnected session with its lifetime.
#[derive(Debug, Default)]
pub struct LoggingHook;

impl DisconnectHook for LoggingHook {
    fn name(&self) -> &str {
        "logging"
    }

    fn notify(&self, session: &Session) -> Result<(), HookError> {
        let lifetime = SystemTime::now()
            .duration_since(session.connected_at())
            .unwrap_or_default();
        info!(
            session = %session.id(),
            peer = %session.endpoint(),
            lifetime_ms = lifetime.as_millis() as u64,
            "👋 Client session ended"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::TracingInterpreter;
    use crate::transport::{MemoryPeerOptions, MemoryTransport, Transport};
    use std::sync::Mutex;
    use std::time::Duration;

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        outcome: fn() -> Result<(), HookError>,
    }

    impl DisconnectHook for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn notify(&self, _session: &Session) -> Result<(), HookError> {
            self.log.lock().unwrap().push(self.name);
            (self.outcome)()
        }
    }

    async fn session() -> Session {
        let transport = MemoryTransport::new();
        let mut listener = transport.listen(9200, 4).await.unwrap();
        let _peer = transport
            .connector()
            .connect(9200, MemoryPeerOptions::from_endpoint("10.0.0.9:1234".parse().unwrap()))
            .unwrap();
        let connection = listener.accept().await.unwrap().accept().unwrap();
        Session::new(connection, Duration::from_secs(1), 6, &TracingInterpreter::factory())
    }

    #[tokio::test]
    async fn test_all_hooks_run_in_order_despite_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = DisconnectHookChain::new();
        chain.push(Arc::new(Recording { name: "first", log: log.clone(), outcome: || Ok(()) }));
        chain.push(Arc::new(Recording {
            name: "failing",
            log: log.clone(),
            outcome: || Err(HookError("database offline".to_string())),
        }));
        chain.push(Arc::new(Recording { name: "panicking", log: log.clone(), outcome: || panic!("hook bug") }));
        chain.push(Arc::new(Recording { name: "last", log: log.clone(), outcome: || Ok(()) }));

        let session = session().await;
        let failures = chain.notify(&session);

        assert_eq!(failures, 2);
        assert_eq!(*log.lock().unwrap(), vec!["first", "failing", "panicking", "last"]);
    }

    #[tokio::test]
    async fn test_logging_hook_never_fails() {
        let session = session().await;
        assert!(LoggingHook.notify(&session).is_ok());
    }
}
