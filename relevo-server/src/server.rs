//! Relay state and server bootstrap.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use crate::auth::TokenOracle;
use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::registry::ConnectionRegistry;
use crate::rooms::Membership;

/// Shared state accessible by all connection and HTTP handlers.
///
/// The registry and membership model are the only mutable shared state in
/// the core. They are owned here and mutated only through their own
/// operations — the router and the HTTP layer read through the dispatcher.
pub struct RelayState {
    pub config: ServerConfig,
    pub registry: Arc<ConnectionRegistry>,
    pub rooms: Arc<Membership>,
    pub dispatcher: Dispatcher,
    pub oracle: TokenOracle,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl RelayState {
    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_secs(self.config.oracle_timeout_secs)
    }
}

pub struct Server {
    config: ServerConfig,
    oracle: TokenOracle,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let oracle = TokenOracle::http(
            config.oracle_url.clone(),
            Duration::from_secs(config.oracle_timeout_secs),
        );
        Self { config, oracle }
    }

    /// Create a server with a custom token oracle (for testing).
    pub fn with_oracle(config: ServerConfig, oracle: TokenOracle) -> Self {
        Self { config, oracle }
    }

    pub fn build_state(&self) -> Arc<RelayState> {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(Membership::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry), Arc::clone(&rooms));
        Arc::new(RelayState {
            config: self.config.clone(),
            registry,
            rooms,
            dispatcher,
            oracle: self.oracle.clone(),
            started_at: chrono::Utc::now(),
        })
    }

    /// Run the server until ctrl-c, then announce shutdown to all clients.
    pub async fn run(self) -> Result<()> {
        let state = self.build_state();
        let router = crate::web::router(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind(&state.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", state.config.listen_addr))?;
        tracing::info!("HTTP/WebSocket listener on {}", state.config.listen_addr);

        let shutdown_state = Arc::clone(&state);
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {e}");
                return;
            }
            tracing::info!("Shutdown signal received, notifying clients");
            shutdown_state.dispatcher.to_all(
                "server_shutdown",
                &serde_json::json!({
                    "message": "El servidor se está cerrando. Por favor reconecta en breve.",
                }),
            );
            // Give outboxes a moment to drain before the listener closes.
            tokio::time::sleep(Duration::from_millis(200)).await;
        })
        .await
        .context("HTTP server error")?;

        tracing::info!("Server stopped");
        Ok(())
    }

    /// Start the server and return the bound address + task handle (for
    /// testing).
    pub async fn start(self) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let state = self.build_state();
        let router = crate::web::router(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind(&state.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", state.config.listen_addr))?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");

        let handle = tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .context("HTTP server error")
        });

        Ok((addr, handle))
    }
}
