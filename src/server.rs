use axum::routing::get;
use axum::{middleware, Router};
use std::net::SocketAddr;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::counters::spawn_uploader;
use crate::error::{Error, Result};
use crate::handlers::{health_check, stats, view, welcome, AppState};
use crate::middleware::{logging_middleware, rate_limit_middleware};
use crate::rate_limiter::RateLimiter;

/// Build the router. Everything except `/health` is rate limited.
pub fn create_app(state: AppState) -> Router {
    let limited = Router::new()
        .route("/", get(welcome))
        .route("/view", get(view))
        .route("/stats", get(stats))
        .route_layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .merge(limited)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    config: Config,
    state: AppState,
}

impl Server {
    /// Must be called inside a tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        if config.flush_interval.is_zero() {
            return Err(Error::Config("flush interval must be greater than 0".to_string()));
        }
        let rate_limiter = RateLimiter::new(config.rate_limit())?;
        Ok(Self {
            state: AppState::new(rate_limiter),
            config,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub async fn run(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        let uploader = spawn_uploader(
            self.state.counters.clone(),
            self.state.counters_store.clone(),
            self.config.flush_interval,
        );

        tracing::info!("Turnstile server listening on {}", listener.local_addr()?);
        tracing::info!(
            policy = %self.state.rate_limiter.header_value(),
            "Rate limiting enabled"
        );

        let app = create_app(self.state);
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        uploader.abort();
        tracing::info!("Turnstile server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
