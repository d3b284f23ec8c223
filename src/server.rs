use axum::routing::{get, post, put};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::error::ThrottlerResult;
use crate::handlers::{
    acquire, delete_rule, health_check, list_rules, metrics, readiness_check, set_rule, status,
    AppState, SharedState,
};
use crate::middleware::logging_middleware;
use crate::throttler::Throttler;

/// Build the HTTP router around an existing throttler.
pub fn create_app(throttler: Arc<Throttler>) -> Router {
    let shared_state: SharedState = Arc::new(AppState::new(throttler));

    Router::new()
        .route("/acquire", post(acquire))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/rules", get(list_rules))
        .route("/rules/:key", put(set_rule).delete(delete_rule))
        // Health and readiness endpoints
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .with_state(shared_state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    app: Router,
    bind_addr: String,
    throttler: Arc<Throttler>,
    sweep_interval: Duration,
    fallback_idle_periods: u64,
}

impl Server {
    pub fn new(config: &Config) -> ThrottlerResult<Self> {
        let throttler = Arc::new(Throttler::from_config(config)?);

        Ok(Self {
            app: create_app(throttler.clone()),
            bind_addr: config.bind_addr.clone(),
            throttler,
            sweep_interval: config.sweep_interval,
            fallback_idle_periods: config.fallback_idle_periods,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let sweeper = self
            .throttler
            .fallback()
            .spawn_sweeper(self.sweep_interval, self.fallback_idle_periods);

        let health = self.throttler.health_snapshot().await;
        info!(?health, "initial shard health");

        let listener = tokio::net::TcpListener::bind(&self.bind_addr).await?;
        info!("Throttler server listening on {}", self.bind_addr);
        info!("Health check available at /health");
        info!("Readiness check available at /ready");

        // Run server with graceful shutdown
        axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        sweeper.abort();
        info!("Throttler server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
