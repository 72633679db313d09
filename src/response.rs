use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::counters::KeyCounters;
use crate::rate_limiter::LimiterStats;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
}

impl HealthResponse {
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub records: Vec<KeyCounters>,
    pub pending_keys: usize,
    pub rate_limiter: LimiterStats,
}

#[derive(Debug, Serialize)]
pub struct ViewResponse {
    pub content: &'static str,
    pub clicked: bool,
}
