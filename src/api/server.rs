//! API Server
//!
//! HTTP status endpoints plus the client WebSocket, served until the shared
//! shutdown signal flips.

use super::{
    handlers::AppState,
    middleware::{create_cors_layer, request_id_middleware},
    routes::create_router,
    websocket::SessionManager,
};
use crate::{config::ApiConfig, engine::Engine, errors::ArcadeResult, lobby::Lobby};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{signal, sync::watch};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

pub struct ApiServer {
    config: ApiConfig,
    enable_metrics: bool,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiConfig, enable_metrics: bool, engine: Arc<Engine>) -> Self {
        let sessions = SessionManager::new(Lobby::new(engine.clone()));
        let state = Arc::new(AppState {
            engine,
            sessions,
            version: env!("CARGO_PKG_VERSION").to_string(),
        });
        Self {
            config,
            enable_metrics,
            state,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> ArcadeResult<()> {
        let app = self.create_app();
        let addr = self.socket_addr()?;
        self.log_server_info(addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await?;

        info!("API server stopped");
        Ok(())
    }

    fn create_app(&self) -> axum::Router {
        create_router(self.state.clone(), self.enable_metrics)
            .layer(axum::middleware::from_fn(request_id_middleware))
            .layer(create_cors_layer(self.config.allowed_origins.clone()))
            .layer(TimeoutLayer::new(Duration::from_secs(self.config.request_timeout_secs)))
            .layer(TraceLayer::new_for_http())
    }

    fn socket_addr(&self) -> ArcadeResult<SocketAddr> {
        let ip = self.config.host.parse::<std::net::IpAddr>().map_err(|e| {
            crate::errors::ConfigurationError::InvalidValue {
                field: "api.host".to_string(),
                value: self.config.host.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(SocketAddr::from((ip, self.config.port)))
    }

    fn log_server_info(&self, addr: SocketAddr) {
        info!("Listen: http://{}", addr);
        info!("   CORS: {:?}", self.config.allowed_origins);
        info!("   Request timeout: {}s", self.config.request_timeout_secs);
        info!("Available endpoints:");
        info!("   GET  /health   - Health check");
        info!("   GET  /status   - Slot, queue and link status");
        if self.enable_metrics {
            info!("   GET  /metrics  - Prometheus metrics");
        }
        info!("   GET  /ws       - Client WebSocket");
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
