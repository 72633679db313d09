use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::counters::{ContentCounters, CountersStore, CONTENT_TYPES};
use crate::rate_limiter::RateLimiter;
use crate::response::{HealthResponse, StatsResponse, ViewResponse};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub rate_limiter: Arc<RateLimiter>,
    pub counters: Arc<ContentCounters>,
    pub counters_store: Arc<CountersStore>,
}

impl AppState {
    pub fn new(rate_limiter: RateLimiter) -> Self {
        Self {
            rate_limiter: Arc::new(rate_limiter),
            counters: Arc::new(ContentCounters::new()),
            counters_store: Arc::new(CountersStore::new()),
        }
    }
}

pub async fn welcome() -> &'static str {
    "Welcome to Turnstile"
}

/// Simulated content view: records a view and, half of the time, a click.
pub async fn view(State(state): State<AppState>) -> impl IntoResponse {
    let (content, delay, clicked) = {
        let mut rng = rand::thread_rng();
        let content = CONTENT_TYPES.choose(&mut rng).copied().unwrap_or(CONTENT_TYPES[0]);
        (content, rng.gen_range(0..50u64), rng.gen_bool(0.5))
    };

    state.counters.add_view(content);

    // Simulated processing.
    tokio::time::sleep(Duration::from_millis(delay)).await;

    if clicked {
        state.counters.add_click(content);
    }
    debug!(content, clicked, "View processed");

    Json(ViewResponse { content, clicked })
}

pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatsResponse {
        records: state.counters_store.records(),
        pending_keys: state.counters.len(),
        rate_limiter: state.rate_limiter.stats(),
    })
}

pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse::healthy())
}
