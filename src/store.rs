//! Self-cleaning keyed store built from two time-sliced generations.
//!
//! Lookups hit two hash maps, so every operation is O(1). Instead of
//! sweeping entries, whole generations are discarded once they age out:
//! `current` expires first, `next` exactly one lifespan later. Reclamation
//! is lazy: each public operation checks the generation clock before
//! touching the maps, so an idle store does no background work.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Value with an absolute expiry, storable in a [`GenerationalStore`].
pub trait Expirable {
    fn expiry(&self) -> Instant;

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expiry()
    }

    /// Called when the value is evicted from the store.
    fn retire(&self) {}

    /// Called for values of a discarded generation. Implementors shared
    /// across threads should check and retire atomically.
    fn retire_if_expired(&self, now: Instant) {
        if now >= self.expiry() {
            self.retire();
        }
    }
}

impl<T: Expirable + ?Sized> Expirable for Arc<T> {
    fn expiry(&self) -> Instant {
        (**self).expiry()
    }

    fn is_expired(&self) -> bool {
        (**self).is_expired()
    }

    fn retire(&self) {
        (**self).retire()
    }

    fn retire_if_expired(&self, now: Instant) {
        (**self).retire_if_expired(now)
    }
}

struct Generation<V: Expirable> {
    expiry: Instant,
    entries: Mutex<HashMap<String, V>>,
}

impl<V: Expirable> Generation<V> {
    fn new(expiry: Instant) -> Arc<Self> {
        Arc::new(Self {
            expiry,
            entries: Mutex::new(HashMap::new()),
        })
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expiry
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl<V: Expirable> Drop for Generation<V> {
    // Values still alive may have been re-homed into the surviving
    // generation, so only the idle ones are retired here.
    fn drop(&mut self) {
        let now = Instant::now();
        for value in self.entries.get_mut().values() {
            value.retire_if_expired(now);
        }
    }
}

struct Generations<V: Expirable> {
    current: Arc<Generation<V>>,
    next: Arc<Generation<V>>,
}

pub struct GenerationalStore<V: Expirable + Clone> {
    lifespan: Duration,
    generations: Mutex<Generations<V>>,
}

impl<V: Expirable + Clone> GenerationalStore<V> {
    pub fn new(lifespan: Duration) -> Self {
        let (current, next) = Self::fresh(lifespan, Instant::now());
        Self {
            lifespan,
            generations: Mutex::new(Generations { current, next }),
        }
    }

    pub fn lifespan(&self) -> Duration {
        self.lifespan
    }

    pub fn has(&self, key: &str) -> bool {
        let (current, next) = self.snapshot();
        let found =
            next.entries.lock().contains_key(key) || current.entries.lock().contains_key(key);
        found
    }

    /// `next` always takes precedence over `current`.
    pub fn get(&self, key: &str) -> Option<V> {
        let (current, next) = self.snapshot();
        if let Some(value) = next.entries.lock().get(key) {
            return Some(value.clone());
        }
        let found = current.entries.lock().get(key).cloned();
        found
    }

    /// Store `value` in the oldest generation that outlives it.
    pub fn set(&self, key: &str, value: V) {
        let (current, next) = self.snapshot();

        if value.expiry() < current.expiry {
            // A stale copy in `next` would shadow the one written here.
            next.entries.lock().remove(key);
            current.entries.lock().insert(key.to_string(), value);
        } else {
            next.entries.lock().insert(key.to_string(), value);
        }
    }

    pub fn delete(&self, key: &str) {
        let (current, next) = self.snapshot();
        let removed = [
            current.entries.lock().remove(key),
            next.entries.lock().remove(key),
        ];
        for value in removed.iter().flatten() {
            value.retire();
        }
    }

    /// Entry counts of the `(current, next)` generations.
    pub fn generation_sizes(&self) -> (usize, usize) {
        let (current, next) = self.snapshot();
        (current.len(), next.len())
    }

    fn fresh(lifespan: Duration, now: Instant) -> (Arc<Generation<V>>, Arc<Generation<V>>) {
        let current_expiry = now + lifespan;
        (
            Generation::new(current_expiry),
            Generation::new(current_expiry + lifespan),
        )
    }

    /// Roll generations over if needed and hand out both of them.
    ///
    /// Only the pointer swap happens under the store lock. Discarded
    /// generations are dropped after it is released.
    fn snapshot(&self) -> (Arc<Generation<V>>, Arc<Generation<V>>) {
        let now = Instant::now();
        let mut retired = Vec::new();

        let pair = {
            let mut gens = self.generations.lock();
            if gens.current.is_expired(now) {
                if gens.next.is_expired(now) {
                    let (current, next) = Self::fresh(self.lifespan, now);
                    retired.push(std::mem::replace(&mut gens.current, current));
                    retired.push(std::mem::replace(&mut gens.next, next));
                    debug!(lifespan = ?self.lifespan, "Store generations reset");
                } else {
                    let next = Generation::new(gens.next.expiry + self.lifespan);
                    let promoted = std::mem::replace(&mut gens.next, next);
                    retired.push(std::mem::replace(&mut gens.current, promoted));
                    debug!(lifespan = ?self.lifespan, "Store generations rolled over");
                }
            }
            (Arc::clone(&gens.current), Arc::clone(&gens.next))
        };

        drop(retired);
        pair
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    const LIFESPAN: Duration = Duration::from_secs(10);

    #[derive(Clone, Debug)]
    struct Stamp {
        expiry: Instant,
        retired: Arc<AtomicBool>,
    }

    impl Stamp {
        fn after(offset: Duration) -> Self {
            Self {
                expiry: Instant::now() + offset,
                retired: Arc::new(AtomicBool::new(false)),
            }
        }

        fn is_retired(&self) -> bool {
            self.retired.load(Ordering::SeqCst)
        }
    }

    impl Expirable for Stamp {
        fn expiry(&self) -> Instant {
            self.expiry
        }

        fn retire(&self) {
            self.retired.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_key_is_absent() {
        let store: GenerationalStore<Stamp> = GenerationalStore::new(LIFESPAN);
        assert!(!store.has("nobody"));
        assert!(store.get("nobody").is_none());
        store.delete("nobody");
    }

    #[tokio::test(start_paused = true)]
    async fn test_placement_by_expiry() {
        let store = GenerationalStore::new(LIFESPAN);

        store.set("short", Stamp::after(Duration::from_secs(5)));
        store.set("long", Stamp::after(Duration::from_secs(15)));
        store.set("edge", Stamp::after(LIFESPAN));

        assert_eq!(store.generation_sizes(), (1, 2));
        assert!(store.has("short"));
        assert!(store.has("long"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_is_idempotent() {
        let store = GenerationalStore::new(LIFESPAN);
        let stamp = Stamp::after(Duration::from_secs(15));

        store.set("k", stamp.clone());
        store.set("k", stamp.clone());

        assert_eq!(store.generation_sizes(), (0, 1));
        assert_eq!(store.get("k").unwrap().expiry, stamp.expiry);
    }

    #[tokio::test(start_paused = true)]
    async fn test_curtailed_value_evicts_stale_next_copy() {
        let store = GenerationalStore::new(LIFESPAN);
        let long = Stamp::after(Duration::from_secs(15));
        let short = Stamp::after(Duration::from_secs(5));

        store.set("k", long);
        store.set("k", short.clone());

        assert_eq!(store.generation_sizes(), (1, 0));
        assert_eq!(store.get("k").unwrap().expiry, short.expiry);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_takes_precedence() {
        let store = GenerationalStore::new(LIFESPAN);
        let short = Stamp::after(Duration::from_secs(5));
        let long = Stamp::after(Duration::from_secs(15));

        store.set("k", short);
        store.set("k", long.clone());

        assert_eq!(store.generation_sizes(), (1, 1));
        assert_eq!(store.get("k").unwrap().expiry, long.expiry);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollover_keeps_live_values() {
        let store = GenerationalStore::new(LIFESPAN);
        store.set("active", Stamp::after(Duration::from_secs(15)));
        store.set("idle", Stamp::after(Duration::from_secs(3)));

        tokio::time::advance(LIFESPAN).await;

        let active = store.get("active").expect("active client survives rollover");
        assert!(!active.is_expired());
        assert!(!store.has("idle"));
        assert_eq!(store.generation_sizes(), (1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollover_preserves_generation_spacing() {
        let store = GenerationalStore::new(LIFESPAN);

        // Late in the second generation: a rollover, not a reset. The new
        // `next` must expire at 30s (promoted expiry + lifespan), not at
        // access time + two lifespans.
        tokio::time::advance(Duration::from_secs(19)).await;
        store.set("k", Stamp::after(Duration::from_secs(6)));
        assert_eq!(store.generation_sizes(), (0, 1));

        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(store.generation_sizes(), (1, 0));
        assert!(store.has("k"));

        tokio::time::advance(Duration::from_millis(9_500)).await;
        assert!(!store.has("k"));
        assert_eq!(store.generation_sizes(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_when_both_generations_expired() {
        let store = GenerationalStore::new(LIFESPAN);
        store.set("a", Stamp::after(Duration::from_secs(5)));
        store.set("b", Stamp::after(Duration::from_secs(15)));

        tokio::time::advance(LIFESPAN * 3).await;

        assert!(!store.has("a"));
        assert!(!store.has("b"));
        assert_eq!(store.generation_sizes(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discarded_generation_retires_idle_values() {
        let store = GenerationalStore::new(LIFESPAN);
        let idle = Stamp::after(Duration::from_secs(3));
        let live = Stamp::after(Duration::from_secs(25));
        store.set("idle", idle.clone());
        store.set("live", live.clone());

        tokio::time::advance(LIFESPAN).await;
        store.has("idle");
        assert!(idle.is_retired());
        assert!(!live.is_retired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_removes_from_both_generations() {
        let store = GenerationalStore::new(LIFESPAN);
        let short = Stamp::after(Duration::from_secs(5));
        let long = Stamp::after(Duration::from_secs(15));
        store.set("k", short.clone());
        store.set("k", long.clone());

        store.delete("k");

        assert!(!store.has("k"));
        assert!(store.get("k").is_none());
        assert!(short.is_retired());
        assert!(long.is_retired());
    }
}
