//! HTTP server implementation.
//!
//! This module provides [`SandboxServer`], which binds the router and
//! serves until shutdown.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};

use csandbox_common::{SandboxConfig, SandboxError, ServerConfigFile};

use crate::router::build_router;
use crate::state::AppState;

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server.
    pub bind_addr: SocketAddr,
    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Enable graceful shutdown on SIGTERM/SIGINT.
    pub graceful_shutdown: bool,
    /// Largest accepted source text, in bytes.
    pub max_source_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
            request_timeout_secs: 30,
            graceful_shutdown: true,
            max_source_bytes: 64 * 1024,
        }
    }
}

impl ServerConfig {
    /// Build from the `[server]` table of a config file.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the bind address does not parse.
    pub fn from_file(file: &ServerConfigFile) -> Result<Self, SandboxError> {
        let bind_addr = file.bind_addr.parse().map_err(|e| {
            SandboxError::invalid_config(format!("bind_addr '{}': {e}", file.bind_addr))
        })?;

        Ok(Self {
            bind_addr,
            request_timeout_secs: file.request_timeout_secs,
            graceful_shutdown: file.graceful_shutdown,
            max_source_bytes: file.max_source_bytes,
        })
    }

    /// Use a different bind address.
    #[must_use]
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Use a different request timeout.
    #[must_use]
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Get the request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// The csandbox HTTP server.
pub struct SandboxServer {
    state: AppState,
    config: ServerConfig,
}

impl SandboxServer {
    /// Create a server; toolchains load on [`run`](Self::run) or first use.
    pub fn new(sandbox_config: SandboxConfig, server_config: ServerConfig) -> Self {
        let state = AppState::new(sandbox_config, server_config.max_source_bytes);

        Self {
            state,
            config: server_config,
        }
    }

    /// Get a reference to the application state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Load the toolchains, then serve until shutdown.
    ///
    /// With graceful shutdown enabled, returns after SIGTERM/SIGINT once
    /// in-flight requests finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to the address.
    pub async fn run(self) -> Result<(), SandboxError> {
        self.state.warm_up().await;

        let app = build_router(self.state, self.config.request_timeout());
        let listener = TcpListener::bind(&self.config.bind_addr).await?;

        info!(addr = %self.config.bind_addr, "Starting HTTP server");

        if self.config.graceful_shutdown {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        } else {
            axum::serve(listener, app).await?;
        }

        info!("Server shutdown complete");
        Ok(())
    }

    /// Start the server on an ephemeral local port and return a handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn start_test(sandbox_config: SandboxConfig) -> Result<TestHandle, SandboxError> {
        let server_config = ServerConfig::default();
        let state = AppState::new(sandbox_config, server_config.max_source_bytes);
        let app = build_router(state.clone(), server_config.request_timeout());

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        Ok(TestHandle {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }
}

/// Handle for a server started with [`SandboxServer::start_test`].
pub struct TestHandle {
    addr: SocketAddr,
    state: AppState,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<Result<(), std::io::Error>>,
}

impl TestHandle {
    /// Get the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the server URL.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the application state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Shutdown the server gracefully.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.handle.await;
    }
}

/// Wait for SIGTERM or SIGINT.
///
/// A handler that cannot be installed never fires; the other one still can.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler unavailable");
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
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.request_timeout_secs, 30);
        assert!(config.graceful_shutdown);
    }

    #[test]
    fn test_server_config_from_file() {
        let file = ServerConfigFile {
            bind_addr: "127.0.0.1:3000".to_string(),
            request_timeout_secs: 60,
            ..Default::default()
        };
        let config = ServerConfig::from_file(&file).unwrap();

        assert_eq!(config.bind_addr.port(), 3000);
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
        assert_eq!(config.max_source_bytes, file.max_source_bytes);
    }

    #[test]
    fn test_bad_bind_addr() {
        let file = ServerConfigFile {
            bind_addr: "not an address".to_string(),
            ..Default::default()
        };

        let err = ServerConfig::from_file(&file).unwrap_err();
        assert!(matches!(err, SandboxError::InvalidConfig { .. }));
    }

    #[test]
    fn test_server_creation() {
        let server = SandboxServer::new(
            SandboxConfig::default(),
            ServerConfig::default().with_timeout(5),
        );

        assert_eq!(server.config().request_timeout_secs, 5);
        assert!(!server.state().native_ready());
    }
}
