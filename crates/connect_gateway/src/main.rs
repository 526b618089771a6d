//! Connect gateway entry point.
//!
//! Loads the configuration, wires the connection acceptor with its policies
//! and hooks, and runs it until a shutdown signal arrives.

mod cli;
mod config;
mod logging;
mod signals;

use anyhow::{anyhow, Context};
use cli::CliArgs;
use config::AppConfig;
use connect_server::{
    BlocklistPolicy, ConnectionAcceptor, LoggingHook, MaxSessionsPolicy, SessionRegistry, TcpTransport,
    TracingInterpreter,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// The configured gateway, ready to run.
pub struct Application {
    config: AppConfig,
    acceptor: ConnectionAcceptor,
}

impl Application {
    /// Loads and validates the configuration, sets up logging and builds the acceptor.
    pub async fn new(args: CliArgs) -> anyhow::Result<Self> {
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        if let Some(bind_address) = args.bind_address {
            config.server.bind_address = bind_address;
        }
        if let Some(port) = args.port {
            config.server.client_listener_port = port;
        }
        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }

        config
            .validate()
            .map_err(|e| anyhow!("Configuration validation failed: {e}"))?;

        logging::setup_logging(&config.logging)?;

        let acceptor = build_acceptor(&config)?;
        info!(
            "🚀 Connect Gateway v{} | Config: {}",
            env!("CARGO_PKG_VERSION"),
            args.config_path.display()
        );

        Ok(Self { config, acceptor })
    }

    /// Runs until a shutdown signal, then drains the sessions.
    pub async fn run(self) -> anyhow::Result<()> {
        let server = &self.config.server;
        info!("📋 Configuration Summary:");
        info!("  🌐 Listener: {}:{}", server.bind_address, server.client_listener_port);
        info!("  👥 Max connections: {}", server.max_connections);
        info!("  ⏱️ Idle timeout: {}s", server.timeout);
        info!("  📦 Maximum receive size: {} bytes", server.maximum_receive_size);
        if !server.blocked_addresses.is_empty() {
            info!("  🚫 Blocked addresses: {}", server.blocked_addresses.len());
        }

        let local_addr = self
            .acceptor
            .start(server.client_listener_port, server.listener_backlog)
            .await
            .context("starting client listener")?;

        let monitoring_handle = {
            let registry = self.acceptor.registry();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(STATUS_INTERVAL);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    info!(
                        "📊 Gateway status - {} client session(s), {} registry change(s)",
                        registry.len(),
                        registry.changes()
                    );
                }
            })
        };

        info!("✅ Connect Gateway is accepting clients on {}", local_addr);
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        signals::wait_for_shutdown_signal()
            .await
            .context("installing signal handlers")?;

        info!("🛑 Shutdown signal received, initiating graceful shutdown...");
        monitoring_handle.abort();

        self.acceptor.stop().await;
        self.acceptor.disconnect_all().await;

        info!("⏳ Waiting for client sessions to close...");
        if self.acceptor.wait_until_empty(self.config.shutdown_grace_period()).await {
            info!("✅ Connect Gateway shutdown complete");
        } else {
            warn!(
                "⚠️ {} client session(s) still open after the grace period",
                self.acceptor.registry().len()
            );
        }

        Ok(())
    }
}

/// Wires the acceptor: blocklist first, then the session cap, then logging on disconnect.
fn build_acceptor(config: &AppConfig) -> anyhow::Result<ConnectionAcceptor> {
    let server_config = config.to_server_config();
    let registry = Arc::new(SessionRegistry::new());

    let mut builder = ConnectionAcceptor::builder(
        server_config.clone(),
        TcpTransport::new(config.bind_ip()?),
        TracingInterpreter::factory(),
    )
    .with_registry(registry.clone());

    let blocked = config.blocked_ips()?;
    if !blocked.is_empty() {
        builder = builder.with_accept_policy(Arc::new(BlocklistPolicy::new(blocked)));
    }

    let acceptor = builder
        .with_accept_policy(Arc::new(MaxSessionsPolicy::new(
            registry,
            server_config.max_connections,
        )))
        .with_disconnect_hook(Arc::new(LoggingHook))
        .build()?;
    Ok(acceptor)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args = CliArgs::parse();

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("❌ Failed to start application: {:?}", e);
            std::process::exit(1);
        }
    }
}
