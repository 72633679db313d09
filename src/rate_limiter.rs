use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, trace};
use validator::Validate;

use crate::error::Result;
use crate::identity::{ClientIdentity, IdentityError};
use crate::rate_limit_config::{QuotaPolicy, RateLimitSettings};
use crate::scheduler::RefillScheduler;
use crate::store::{Expirable, GenerationalStore};
use crate::token_bucket::{Admission, TokenBucket};

/// Per-client token bucket admission control.
///
/// One instance is built at startup and shared by every request handler.
/// Must be created inside a tokio runtime, which hosts the refill worker.
pub struct RateLimiter {
    settings: RateLimitSettings,
    policy: QuotaPolicy,
    header_value: String,
    buckets: GenerationalStore<Arc<TokenBucket>>,
    scheduler: RefillScheduler,
}

/// Result of one admission check.
#[derive(Debug, Clone)]
pub struct Decision {
    pub identity: ClientIdentity,
    pub admission: Admission,
    pub remaining: u32,
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        self.admission.is_admitted()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    pub current_generation: usize,
    pub next_generation: usize,
    pub scheduled_buckets: usize,
    pub policy: QuotaPolicy,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Result<Self> {
        settings.validate()?;

        let policy = QuotaPolicy::from_settings(&settings);
        let header_value = policy.header_value();

        debug!(
            limit = settings.limit,
            burst = settings.burst,
            interval = ?settings.interval,
            policy = %header_value,
            "Rate limiter initialized"
        );

        Ok(Self {
            settings,
            policy,
            header_value,
            buckets: GenerationalStore::new(settings.interval),
            scheduler: RefillScheduler::spawn(),
        })
    }

    /// Resolve the caller and run the admission check for it.
    pub fn admit(
        &self,
        forwarded: Option<&str>,
        remote_addr: &str,
    ) -> std::result::Result<Decision, IdentityError> {
        let identity = ClientIdentity::resolve(forwarded, remote_addr)?;
        Ok(self.check(identity))
    }

    /// Take one token from the caller's bucket, creating the bucket when it
    /// is missing or idle-expired.
    pub fn check(&self, identity: ClientIdentity) -> Decision {
        let mut bucket = match self.buckets.get(identity.as_str()) {
            Some(bucket) if !bucket.is_expired() && !bucket.is_stopped() => bucket,
            _ => self.start_bucket(&identity),
        };

        // The refill worker may stop the bucket between lookup and removal.
        let admission = loop {
            match bucket.try_remove_token() {
                Some(admission) => break admission,
                None => bucket = self.start_bucket(&identity),
            }
        };
        let remaining = bucket.tokens();
        self.buckets.set(identity.as_str(), Arc::clone(&bucket));

        trace!(client = %identity, ?admission, remaining, "Admission checked");

        Decision {
            identity,
            admission,
            remaining,
        }
    }

    fn start_bucket(&self, identity: &ClientIdentity) -> Arc<TokenBucket> {
        debug!(client = %identity, "Creating token bucket");
        TokenBucket::start(&self.settings, &self.scheduler)
    }

    /// Drop a client's bucket so its next request starts full.
    pub fn reset(&self, identity: &ClientIdentity) {
        self.buckets.delete(identity.as_str());
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    /// Value of the `RateLimit-Limit` response header.
    pub fn header_value(&self) -> &str {
        &self.header_value
    }

    pub fn stats(&self) -> LimiterStats {
        let (current_generation, next_generation) = self.buckets.generation_sizes();
        LimiterStats {
            current_generation,
            next_generation,
            scheduled_buckets: self.scheduler.pending(),
            policy: self.policy.clone(),
        }
    }
}
