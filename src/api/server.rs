//! API server using Axum
//!
//! Exposes group state, manual selection, records and live streams.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::middleware::from_fn;
use axum::Router;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

use crate::config::ApiServerConfig;
use crate::error::{JunctionError, Result};
use crate::proxy::pump::TransportPump;
use crate::proxy::resolver::Resolver;
use crate::services::RecordStore;

use super::middleware::{cors_layer, RequestLogging};
use super::routes;

/// Shared state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<Resolver>,
    pub records: RecordStore,
    pub pump: TransportPump,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(resolver: Arc<Resolver>, records: RecordStore, pump: TransportPump) -> Self {
        Self {
            resolver,
            records,
            pump,
            started_at: Instant::now(),
        }
    }
}

/// API server
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Build the router
    pub fn build_router(&self) -> Router {
        let cors = cors_layer(&self.config.cors_origins);

        routes::create_router(self.state.clone())
            .layer(from_fn(RequestLogging::log_request))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Run the API server
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| JunctionError::InvalidConfig(format!("invalid API address: {}", e)))?;

        let router = self.build_router();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("API server listening on {}", addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            })
            .await
            .map_err(|e| JunctionError::Internal(e.to_string()))?;

        info!("API server shut down");
        Ok(())
    }
}
