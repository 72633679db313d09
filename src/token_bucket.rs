use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::rate_limit_config::RateLimitSettings;
use crate::scheduler::RefillScheduler;
use crate::store::Expirable;

/// Outcome of a single token removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected,
}

impl Admission {
    pub fn is_admitted(self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Per-client token bucket.
///
/// Starts full. Tokens are added one at a time, every `refill_period`, by
/// the shared [`RefillScheduler`]; requests remove them. Every removal
/// attempt, successful or not, pushes the idle expiry to `now + interval`.
///
/// A stopped bucket is dead: it is never refilled again and refuses
/// removals. The stop flag shares the token mutex so that the idle check,
/// the stop and a concurrent removal cannot interleave.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_period: Duration,
    idle_timeout: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    expiry: Instant,
    stopped: bool,
}

impl TokenBucket {
    pub fn new(settings: &RateLimitSettings) -> Self {
        Self {
            capacity: settings.burst,
            refill_period: settings.refill_period(),
            idle_timeout: settings.interval,
            state: Mutex::new(BucketState {
                tokens: settings.burst,
                expiry: Instant::now() + settings.interval,
                stopped: false,
            }),
        }
    }

    /// Create a full bucket and register it for periodic refill.
    pub fn start(settings: &RateLimitSettings, scheduler: &RefillScheduler) -> Arc<Self> {
        let bucket = Arc::new(Self::new(settings));
        scheduler.schedule(&bucket);
        bucket
    }

    /// Take one token. A stopped bucket always rejects.
    pub fn remove_token(&self) -> Admission {
        self.try_remove_token().unwrap_or(Admission::Rejected)
    }

    /// Take one token, or `None` when the bucket has been stopped. A stopped
    /// bucket keeps its expiry, so it is never revived by a late request.
    pub fn try_remove_token(&self) -> Option<Admission> {
        let mut state = self.state.lock();
        if state.stopped {
            return None;
        }
        state.expiry = Instant::now() + self.idle_timeout;

        if state.tokens == 0 {
            return Some(Admission::Rejected);
        }
        state.tokens -= 1;
        Some(Admission::Admitted)
    }

    /// Add one token. Returns `false` when the bucket was already full.
    pub fn add_token(&self) -> bool {
        let mut state = self.state.lock();
        Self::refill(&mut state, self.capacity)
    }

    fn refill(state: &mut BucketState, capacity: u32) -> bool {
        if state.tokens >= capacity {
            return false;
        }
        state.tokens += 1;
        true
    }

    /// Scheduler tick. Returns whether the bucket should stay scheduled.
    pub(crate) fn refill_tick(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        if state.stopped {
            return false;
        }
        if now >= state.expiry {
            state.stopped = true;
            return false;
        }
        Self::refill(&mut state, self.capacity);
        true
    }

    /// Stop the bucket only if it is idle at `now`. Returns whether it is
    /// stopped afterwards.
    pub fn stop_if_idle(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        if now >= state.expiry {
            state.stopped = true;
        }
        state.stopped
    }

    /// Signal the refill cycle to end. Returns `true` only for the call that
    /// actually stopped the bucket.
    pub fn stop(&self) -> bool {
        let mut state = self.state.lock();
        !std::mem::replace(&mut state.stopped, true)
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn tokens(&self) -> u32 {
        self.state.lock().tokens
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_period(&self) -> Duration {
        self.refill_period
    }

    pub fn expiry(&self) -> Instant {
        self.state.lock().expiry
    }
}

impl Expirable for TokenBucket {
    fn expiry(&self) -> Instant {
        TokenBucket::expiry(self)
    }

    fn retire(&self) {
        self.stop();
    }

    fn retire_if_expired(&self, now: Instant) {
        self.stop_if_idle(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    fn settings(limit: u32, burst: u32, interval: Duration) -> RateLimitSettings {
        RateLimitSettings::new(limit, burst, interval)
    }

    #[test]
    fn test_token_bucket_creation() {
        let bucket = TokenBucket::new(&settings(2, 10, Duration::from_secs(1)));
        assert_eq!(bucket.capacity(), 10);
        assert_eq!(bucket.tokens(), 10);
        assert_eq!(bucket.refill_period(), Duration::from_millis(500));
        assert!(!bucket.is_expired());
    }

    #[test]
    fn test_burst_then_reject() {
        let bucket = TokenBucket::new(&settings(1, 5, Duration::from_secs(60)));
        for _ in 0..5 {
            assert_eq!(bucket.remove_token(), Admission::Admitted);
        }
        assert_eq!(bucket.remove_token(), Admission::Rejected);
        assert_eq!(bucket.tokens(), 0);
    }

    #[test]
    fn test_capacity_overflow_prevention() {
        let bucket = TokenBucket::new(&settings(1, 3, Duration::from_secs(60)));
        assert!(!bucket.add_token());
        bucket.remove_token();
        assert!(bucket.add_token());
        assert!(!bucket.add_token());
        assert_eq!(bucket.tokens(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_still_refreshes_expiry() {
        let interval = Duration::from_secs(1);
        let bucket = TokenBucket::new(&settings(1, 1, interval));
        assert!(bucket.remove_token().is_admitted());

        tokio::time::advance(Duration::from_millis(700)).await;
        assert_eq!(bucket.remove_token(), Admission::Rejected);
        assert_eq!(bucket.expiry(), Instant::now() + interval);

        tokio::time::advance(Duration::from_millis(700)).await;
        assert!(!bucket.is_expired());

        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(bucket.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_tick_stops_idle_bucket() {
        let bucket = TokenBucket::new(&settings(2, 2, Duration::from_secs(1)));
        bucket.remove_token();

        assert!(bucket.refill_tick(Instant::now()));
        assert_eq!(bucket.tokens(), 2);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!bucket.refill_tick(Instant::now()));
        assert!(bucket.is_stopped());
    }

    #[test]
    fn test_stop_reports_first_call_only() {
        let bucket = TokenBucket::new(&settings(1, 1, Duration::from_secs(1)));
        assert!(bucket.stop());
        assert!(!bucket.stop());
        assert!(!bucket.refill_tick(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_bucket_refuses_removal_and_keeps_expiry() {
        let bucket = TokenBucket::new(&settings(1, 3, Duration::from_secs(1)));
        let expiry = bucket.expiry();
        bucket.stop();

        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(bucket.try_remove_token(), None);
        assert_eq!(bucket.remove_token(), Admission::Rejected);
        assert_eq!(bucket.tokens(), 3);
        assert_eq!(bucket.expiry(), expiry);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_if_idle_spares_live_bucket() {
        let bucket = TokenBucket::new(&settings(1, 1, Duration::from_secs(1)));

        tokio::time::advance(Duration::from_millis(900)).await;
        bucket.remove_token();
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(!bucket.stop_if_idle(Instant::now()));
        assert!(!bucket.is_stopped());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(bucket.stop_if_idle(Instant::now()));
        assert_eq!(bucket.try_remove_token(), None);
    }

    #[test]
    fn test_concurrent_removal_admits_exactly_burst() {
        let burst = 16;
        let bucket = TokenBucket::new(&settings(1, burst, Duration::from_secs(3600)));
        let admitted = AtomicU32::new(0);

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..burst {
                        if bucket.remove_token().is_admitted() {
                            admitted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.load(Ordering::Relaxed), burst);
        assert_eq!(bucket.tokens(), 0);
    }

    #[test]
    fn test_concurrent_refill_and_removal_stay_in_bounds() {
        let bucket = TokenBucket::new(&settings(1, 4, Duration::from_secs(3600)));

        thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..10_000 {
                    bucket.add_token();
                    assert!(bucket.tokens() <= bucket.capacity());
                }
            });
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..5_000 {
                        bucket.remove_token();
                        assert!(bucket.tokens() <= bucket.capacity());
                    }
                });
            }
        });

        assert!(bucket.tokens() <= bucket.capacity());
    }
}
