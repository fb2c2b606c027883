//! Daemon Lifecycle Management
//!
//! Handles startup, signal-driven shutdown and closing every open endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::Config;

use super::handler::RequestHandler;
use super::server::Server;

/// Running server plus the state shared by its connections
pub struct Daemon {
    handler: Arc<RequestHandler>,
    server: Server,
    shutdown_tx: broadcast::Sender<()>,
}

impl Daemon {
    /// Prepare the data directory and bind the listener
    pub async fn start(config: Config) -> Result<Self> {
        info!("Starting lindex {}", env!("CARGO_PKG_VERSION"));

        let data_dir = &config.server.data_dir;
        std::fs::create_dir_all(data_dir).with_context(|| {
            format!("Failed to create data directory {}", data_dir.display())
        })?;

        let handler = Arc::new(RequestHandler::from_config(&config));
        let server = Server::bind(
            &config.server.listen_addr,
            handler.clone(),
            config.server.max_line_bytes,
        )
        .await?;

        let (shutdown_tx, _) = broadcast::channel(1);

        info!("Data directory: {}", data_dir.display());
        info!("Command timeout: {:?}", config.server.command_timeout());

        Ok(Self {
            handler,
            server,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.server.local_addr()
    }

    /// Sender that stops [`Daemon::run`] when fired
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Serve until Ctrl+C, SIGTERM or a shutdown request
    pub async fn run(self) -> Result<()> {
        let Self {
            handler,
            server,
            shutdown_tx,
        } = self;

        let shutdown_rx = shutdown_tx.subscribe();
        let server_handle = tokio::spawn(server.run(shutdown_tx.subscribe()));

        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
            }
            _ = wait_for_sigterm() => {
                info!("Received SIGTERM, shutting down");
            }
            _ = wait_for_shutdown(shutdown_rx) => {
                info!("Shutdown requested");
            }
        }

        let _ = shutdown_tx.send(());

        let server_abort = server_handle.abort_handle();
        match tokio::time::timeout(Duration::from_secs(5), server_handle).await {
            Ok(Ok(Ok(()))) => info!("Server shut down cleanly"),
            Ok(Ok(Err(e))) => error!("Server failed: {}", e),
            Ok(Err(e)) => error!("Server task failed: {}", e),
            Err(_) => {
                warn!("Server did not shut down within 5s, aborting");
                server_abort.abort();
            }
        }

        Self::shutdown(&handler).await;
        Ok(())
    }

    /// Close every endpoint the registry opened
    async fn shutdown(handler: &RequestHandler) {
        info!("Closing {} open databases", handler.registry().entries().len());
        handler.registry().close_all().await;
        info!("Daemon shutdown complete");
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}

async fn wait_for_shutdown(mut rx: broadcast::Receiver<()>) {
    let _ = rx.recv().await;
}
