use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

use crate::rate_limit_config::RateLimitSettings;

#[derive(Debug, Clone, Parser)]
#[command(name = "turnstile", version, about = "Per-client rate limited HTTP service")]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:8080")]
    pub bind_addr: SocketAddr,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Tokens added to a client's bucket per interval
    #[arg(long = "rate-limit", env = "RATE_LIMIT", default_value_t = 10)]
    pub limit: u32,

    /// Maximum tokens a client's bucket holds
    #[arg(long = "rate-limit-burst", env = "RATE_LIMIT_BURST", default_value_t = 20)]
    pub burst: u32,

    /// Refill interval; also the idle timeout of a client's bucket.
    /// Very small values increase refill timer churn.
    #[arg(
        long = "rate-limit-interval",
        env = "RATE_LIMIT_INTERVAL",
        default_value = "1s",
        value_parser = humantime::parse_duration
    )]
    pub interval: Duration,

    /// How often live content counters are uploaded
    #[arg(
        long,
        env = "FLUSH_INTERVAL",
        default_value = "5s",
        value_parser = parse_period
    )]
    pub flush_interval: Duration,
}

/// Humantime duration that must be non-zero.
fn parse_period(value: &str) -> Result<Duration, String> {
    let period = humantime::parse_duration(value).map_err(|e| e.to_string())?;
    if period.is_zero() {
        return Err("period must be greater than 0".to_string());
    }
    Ok(period)
}

impl Config {
    /// Load configuration from the command line and environment variables.
    pub fn from_env() -> Result<Self, clap::Error> {
        Config::try_parse()
    }

    pub fn rate_limit(&self) -> RateLimitSettings {
        RateLimitSettings::new(self.limit, self.burst, self.interval)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            log_level: "info".to_string(),
            limit: 10,
            burst: 20,
            interval: Duration::from_secs(1),
            flush_interval: Duration::from_secs(5),
        }
    }
}
