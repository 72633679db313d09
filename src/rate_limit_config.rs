use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Shortest refill period accepted; anything tighter is timer churn.
pub const MIN_REFILL_PERIOD: Duration = Duration::from_millis(1);

/// Longest interval accepted. Bounds every deadline derived from it.
pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

pub const POLICY_NAME: &str = "leaky bucket";

/// Rate limiting parameters shared by every client bucket.
///
/// `limit` tokens are added per `interval`, up to `burst` tokens held.
/// `interval` is also the idle timeout of a bucket and the lifespan of a
/// store generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_refill_period"))]
pub struct RateLimitSettings {
    #[validate(range(min = 1))]
    pub limit: u32,
    #[validate(range(min = 1))]
    pub burst: u32,
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_interval"))]
    pub interval: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            limit: 10,
            burst: 20,
            interval: Duration::from_secs(1),
        }
    }
}

impl RateLimitSettings {
    pub fn new(limit: u32, burst: u32, interval: Duration) -> Self {
        Self {
            limit,
            burst,
            interval,
        }
    }

    /// Time between two token additions.
    pub fn refill_period(&self) -> Duration {
        self.interval / self.limit.max(1)
    }
}

fn validate_interval(interval: &Duration) -> Result<(), ValidationError> {
    if interval.is_zero() {
        let mut err = ValidationError::new("interval");
        err.message = Some(Cow::Borrowed("Interval must be greater than 0"));
        return Err(err);
    }
    if *interval > MAX_INTERVAL {
        let mut err = ValidationError::new("interval");
        err.message = Some(Cow::Owned(format!(
            "Interval must be at most {}",
            humantime::format_duration(MAX_INTERVAL)
        )));
        return Err(err);
    }
    Ok(())
}

fn validate_refill_period(settings: &RateLimitSettings) -> Result<(), ValidationError> {
    if settings.limit > 0 && settings.refill_period() < MIN_REFILL_PERIOD {
        let mut err = ValidationError::new("refill_period");
        err.message = Some(Cow::Owned(format!(
            "interval / limit must be at least {:?}",
            MIN_REFILL_PERIOD
        )));
        return Err(err);
    }
    Ok(())
}

/// Approximate, human-readable quota descriptor reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaPolicy {
    pub limit: u32,
    pub quota: u64,
    /// Window in whole seconds.
    pub window: u64,
    pub burst: u32,
    pub name: &'static str,
}

impl QuotaPolicy {
    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        let interval_ms = settings.interval.as_millis().max(1) as u64;
        let limit = u64::from(settings.limit.max(1));

        let (quota, window) = match 1000 * limit / interval_ms {
            0 => (1, interval_ms / (1000 * limit)),
            per_second => (per_second, 1),
        };

        Self {
            limit: settings.limit,
            quota,
            window,
            burst: settings.burst,
            name: POLICY_NAME,
        }
    }

    pub fn header_value(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for QuotaPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {};window={}; burst={};policy=\"{}\"",
            self.limit, self.quota, self.window, self.burst, self.name
        )
    }
}
