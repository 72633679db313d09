//! Shared refill worker for every live token bucket.
//!
//! One tokio task owns a min-heap of `(due, bucket)` entries. Buckets are
//! held weakly: a bucket dropped by the store simply falls out of the heap
//! on its next tick.

use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::trace;

use crate::token_bucket::TokenBucket;

struct Entry {
    due: Instant,
    seq: u64,
    bucket: Weak<TokenBucket>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Reverse<Entry>>,
    seq: u64,
}

impl Queue {
    /// Returns `true` when the new entry became the earliest one.
    fn push(&mut self, due: Instant, bucket: Weak<TokenBucket>) -> bool {
        let earliest = self
            .heap
            .peek()
            .map_or(true, |Reverse(head)| due < head.due);
        self.seq = self.seq.wrapping_add(1);
        self.heap.push(Reverse(Entry {
            due,
            seq: self.seq,
            bucket,
        }));
        earliest
    }

    fn pop_due(&mut self, now: Instant) -> Vec<Entry> {
        let mut due = Vec::new();
        while self.heap.peek().is_some_and(|Reverse(head)| head.due <= now) {
            if let Some(Reverse(entry)) = self.heap.pop() {
                due.push(entry);
            }
        }
        due
    }

    fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(head)| head.due)
    }
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    wake: Notify,
}

impl Shared {
    /// Tick every due bucket and return the next deadline.
    fn fire_due(&self, now: Instant) -> Option<Instant> {
        let due = self.queue.lock().pop_due(now);

        let mut survivors = Vec::with_capacity(due.len());
        for entry in due {
            let Some(bucket) = entry.bucket.upgrade() else {
                continue;
            };
            if !bucket.refill_tick(now) {
                trace!("Bucket left refill schedule");
                continue;
            }
            // Missed ticks are skipped rather than replayed.
            let mut next = entry.due + bucket.refill_period();
            if next <= now {
                next = now + bucket.refill_period();
            }
            survivors.push((next, entry.bucket));
        }

        let mut queue = self.queue.lock();
        for (next, bucket) in survivors {
            queue.push(next, bucket);
        }
        queue.next_due()
    }
}

/// Drives the periodic refill of every scheduled [`TokenBucket`].
pub struct RefillScheduler {
    shared: Arc<Shared>,
    worker: JoinHandle<()>,
}

impl RefillScheduler {
    /// Start the worker on the current tokio runtime.
    pub fn spawn() -> Self {
        let shared = Arc::new(Shared::default());
        let worker = tokio::spawn(run(Arc::clone(&shared)));
        Self { shared, worker }
    }

    /// First tick happens one refill period from now.
    pub fn schedule(&self, bucket: &Arc<TokenBucket>) {
        let due = Instant::now() + bucket.refill_period();
        let earliest = self.shared.queue.lock().push(due, Arc::downgrade(bucket));
        if earliest {
            self.shared.wake.notify_one();
        }
    }

    /// Number of buckets currently on the refill schedule.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().heap.len()
    }
}

impl Drop for RefillScheduler {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run(shared: Arc<Shared>) {
    loop {
        match shared.fire_due(Instant::now()) {
            Some(deadline) => {
                tokio::select! {
                    _ = time::sleep_until(deadline) => {}
                    _ = shared.wake.notified() => {}
                }
            }
            None => shared.wake.notified().await,
        }
    }
}
