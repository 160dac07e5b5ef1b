//! Server lifecycle
//!
//! Starts the media engine, the SFU manager and the HTTP server, then waits
//! for a shutdown signal and tears everything down in order.

use anyhow::Context;
use metaverse_sfu::{LocalMediaEngine, MediaEngine, RelayHub, SfuManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::http::{create_router, AppState};

/// Bound on waiting for the HTTP server to drain after a shutdown signal
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct MetaverseServer {
    config: Config,
    manager: Arc<SfuManager>,
    relay: Arc<RelayHub>,
}

impl MetaverseServer {
    /// Create the media engine and the worker pool
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let engine: Arc<dyn MediaEngine> = Arc::new(LocalMediaEngine::new(config.media.clone()));
        let manager = SfuManager::init(config.sfu.clone(), config.media.transport_options(), engine)
            .await
            .context("Failed to initialize SFU manager")?;
        info!(
            workers = manager.pool().len(),
            max_rooms = config.sfu.max_rooms,
            max_peers_per_room = config.sfu.max_peers_per_room,
            "SFU manager initialized"
        );

        Ok(Self {
            config,
            manager,
            relay: RelayHub::new(),
        })
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<SfuManager> {
        &self.manager
    }

    #[must_use]
    pub fn app_state(&self) -> AppState {
        AppState::new(
            self.manager.clone(),
            self.relay.clone(),
            self.config.auth.jwt_secret.as_deref(),
        )
    }

    /// Serve until a shutdown signal arrives
    pub async fn start(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut http_handle = self.start_http_server(shutdown_rx).await?;

        if self.config.auth.jwt_secret.is_none() {
            warn!("auth.jwt_secret is not set, signaling sockets accept anonymous clients");
        }
        info!("Metaverse SFU server started");

        let http_stopped = tokio::select! {
            _ = &mut http_handle => {
                error!("HTTP server stopped unexpectedly");
                true
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
                false
            }
        };

        // Close rooms first so connected peers learn why
        info!("Shutting down SFU manager...");
        self.manager.shutdown().await;

        let _ = shutdown_tx.send(true);
        if !http_stopped && tokio::time::timeout(DRAIN_TIMEOUT, &mut http_handle).await.is_err() {
            warn!(
                timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "HTTP server did not drain in time, aborting"
            );
            http_handle.abort();
        }

        info!("Metaverse SFU server shut down complete");
        Ok(())
    }

    async fn start_http_server(&self, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<JoinHandle<()>> {
        let http_address = self.config.http_address();
        let listener = tokio::net::TcpListener::bind(&http_address)
            .await
            .with_context(|| format!("Failed to bind HTTP address {http_address}"))?;
        info!("HTTP server listening on {}", http_address);

        let router = create_router(self.app_state());
        let handle = tokio::spawn(async move {
            let mut rx = shutdown_rx;
            let graceful = async move {
                let _ = rx.changed().await;
            };

            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!("HTTP server error: {}", e);
            }

            info!("HTTP server shut down gracefully");
        });

        Ok(handle)
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
