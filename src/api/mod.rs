//! HTTP control API for the Parley gateway

mod auth;
pub mod control;
pub mod health;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::driver::LoopbackDriver;
use crate::orchestrator::Orchestrator;

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Orchestrator,
    /// Bearer key required on `/api` routes
    pub api_key: Option<String>,
    /// Bind address; without a key only a loopback bind accepts writes
    pub host: IpAddr,
    /// Loopback driver behind the orchestrator, when one is in use
    pub loopback: Option<Arc<LoopbackDriver>>,
}

/// Configuration for building an API server
pub struct ApiServerBuilder {
    orchestrator: Orchestrator,
    api_key: Option<String>,
    loopback: Option<Arc<LoopbackDriver>>,
    host: IpAddr,
    port: u16,
}

impl ApiServerBuilder {
    /// Create a new API server builder
    #[must_use]
    pub const fn new(orchestrator: Orchestrator, port: u16) -> Self {
        Self {
            orchestrator,
            api_key: None,
            loopback: None,
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
        }
    }

    /// Set the bind address
    #[must_use]
    pub const fn host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    /// Set the bearer key for `/api` routes
    #[must_use]
    pub fn api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key.filter(|k| !k.is_empty());
        self
    }

    /// Expose the loopback driver's inject and outbox routes
    #[must_use]
    pub fn loopback(mut self, driver: Arc<LoopbackDriver>) -> Self {
        self.loopback = Some(driver);
        self
    }

    /// Build the API server
    #[must_use]
    pub fn build(self) -> ApiServer {
        ApiServer {
            state: Arc::new(ApiState {
                orchestrator: self.orchestrator,
                api_key: self.api_key,
                loopback: self.loopback,
                host: self.host,
            }),
            port: self.port,
        }
    }
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
}

impl ApiServer {
    /// Build the router with all routes
    #[must_use]
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .nest("/api", control::router(self.state.clone()))
            .merge(health::router(self.state.clone()))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Run the API server
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(self.state.host, self.port);
        if self.state.api_key.is_none() {
            if addr.ip().is_loopback() {
                tracing::warn!("no api key configured, control api is unauthenticated");
            } else {
                tracing::warn!(%addr, "no api key configured, control api is read-only on this bind");
            }
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server on {addr}: {e}")))?;

        tracing::info!(%addr, "API server listening");

        axum::serve(listener, self.router())
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}
