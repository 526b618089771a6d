//! Accept loop and per-connection lifecycle.
//!
//! Per connection the states are, in order: policy evaluation, rejected or
//! approved, handshake sent, registered, receiving, disconnecting, removed.
//! Nothing here propagates an error; a failing connection only affects itself.

use crate::config::ConnectServerConfig;
use crate::hooks::DisconnectHookChain;
use crate::interpreter::InterpreterFactory;
use crate::policy::AcceptPolicyChain;
use crate::registry::{Admission, SessionRegistry};
use crate::session::Session;
use crate::transport::{Connection, Listener};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Pause after a failed raw accept before accepting again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// State shared by the accept loop and every session task.
pub(crate) struct AcceptorContext {
    pub config: ConnectServerConfig,
    pub handshake: Vec<u8>,
    pub interpreters: Arc<dyn InterpreterFactory>,
    pub accept_policies: AcceptPolicyChain,
    pub disconnect_hooks: DisconnectHookChain,
    pub registry: Arc<SessionRegistry>,
}

/// Accepts raw connections until `stop` is set or its sender is dropped.
pub(crate) async fn accept_loop(
    mut listener: Box<dyn Listener>,
    context: Arc<AcceptorContext>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok(pending) => {
                let endpoint = pending.endpoint();
                if !context.accept_policies.evaluate(endpoint).is_allowed() {
                    pending.reject();
                    continue;
                }

                match pending.accept() {
                    Ok(connection) => {
                        // Reserved before the next candidate is evaluated so
                        // session caps see this connection immediately.
                        let admission = context.registry.admit();
                        tokio::spawn(establish_session(context.clone(), connection, admission));
                    }
                    Err(e) => {
                        warn!("Connection from {:?} broke before it was accepted: {}", endpoint, e);
                    }
                }
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

/// Builds the session, sends the hello and registers it, then supervises it
/// until disconnect.
async fn establish_session(
    context: Arc<AcceptorContext>,
    connection: Arc<dyn Connection>,
    admission: Admission,
) {
    let built = catch_unwind(AssertUnwindSafe(|| {
        Session::new(
            connection.clone(),
            context.config.timeout,
            context.config.maximum_receive_size,
            context.interpreters.as_ref(),
        )
    }));
    let session = match built {
        Ok(session) => Arc::new(session),
        Err(_) => {
            warn!("Interpreter factory panicked for {:?}, dropping connection", connection.endpoint());
            connection.close().await;
            return;
        }
    };

    // The hello must be the first thing the peer receives and has to be
    // queued before anything inbound is interpreted.
    if let Err(e) = session.send_hello(&context.handshake).await {
        warn!("Handshake with {} failed, dropping connection: {}", session.endpoint(), e);
        session.disconnect().await;
        return;
    }

    admission.register(session.clone());
    debug!(
        "Client connected: {}, current client count: {}",
        session.endpoint(),
        context.registry.len()
    );

    supervise(context, session).await;
}

/// Runs the receive loop and the disconnect cascade, exactly once.
async fn supervise(context: Arc<AcceptorContext>, session: Arc<Session>) {
    let connection = session.connection().clone();
    tokio::select! {
        result = session.begin_receive() => {
            if let Err(e) = result {
                debug!("Receive loop of {} ended with error: {}", session.endpoint(), e);
            }
        }
        _ = connection.closed() => {}
    }
    session.disconnect().await;

    context.disconnect_hooks.notify(&session);
    debug!("Connection to client {} disconnected.", session.endpoint());
    context.registry.remove(session.id());
}
