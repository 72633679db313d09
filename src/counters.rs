//! Per-content view/click counters and their periodic upload.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub const CONTENT_TYPES: [&str; 4] = ["sports", "entertainment", "business", "education"];

#[derive(Debug, Default)]
struct Counters {
    views: AtomicU64,
    clicks: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountersValue {
    pub views: u64,
    pub clicks: u64,
}

/// Snapshot of one `content:minute` bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyCounters {
    pub key: String,
    #[serde(flatten)]
    pub counters: CountersValue,
}

/// Live counters, keyed by content type and the minute they were recorded in.
#[derive(Debug, Default)]
pub struct ContentCounters {
    data: Mutex<HashMap<String, Arc<Counters>>>,
}

impl ContentCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_view(&self, content: &str) {
        self.counters_at(content, Utc::now())
            .views
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_click(&self, content: &str) {
        self.counters_at(content, Utc::now())
            .clicks
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot every key, optionally clearing the live counters.
    pub fn drain(&self, clear: bool) -> Vec<KeyCounters> {
        let mut data = self.data.lock();
        let snapshot = data
            .iter()
            .map(|(key, counters)| KeyCounters {
                key: key.clone(),
                counters: CountersValue {
                    views: counters.views.load(Ordering::Relaxed),
                    clicks: counters.clicks.load(Ordering::Relaxed),
                },
            })
            .collect();

        if clear {
            data.clear();
        }
        snapshot
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn counters_at(&self, content: &str, at: DateTime<Utc>) -> Arc<Counters> {
        let key = Self::key(content, at);
        let mut data = self.data.lock();
        Arc::clone(data.entry(key).or_default())
    }

    fn key(content: &str, at: DateTime<Utc>) -> String {
        format!("{}:{}", content, at.format("%Y-%m-%d %H:%M"))
    }
}

/// Append-only sink that receives uploaded counter snapshots.
#[derive(Debug, Default)]
pub struct CountersStore {
    records: Mutex<Vec<KeyCounters>>,
}

impl CountersStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upload(&self, record: KeyCounters) {
        self.records.lock().push(record);
    }

    pub fn records(&self) -> Vec<KeyCounters> {
        self.records.lock().clone()
    }

    pub fn write_all<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
        for record in self.records.lock().iter() {
            writeln!(
                w,
                "Key: {}, Views: {}, Clicks: {}",
                record.key, record.counters.views, record.counters.clicks
            )?;
        }
        Ok(())
    }
}

/// Move the live counters into `store`, clearing them.
pub fn flush(counters: &ContentCounters, store: &CountersStore) -> usize {
    let records = counters.drain(true);
    let uploaded = records.len();
    for record in records {
        store.upload(record);
    }
    uploaded
}

/// Flush `counters` into `store` every `every`. Abort the handle to stop.
pub fn spawn_uploader(
    counters: Arc<ContentCounters>,
    store: Arc<CountersStore>,
    every: Duration,
) -> JoinHandle<()> {
    info!(interval = ?every, "Starting counters uploader");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let uploaded = flush(&counters, &store);
            if uploaded > 0 {
                debug!(uploaded, "Uploaded content counters");
            }
        }
    })
}
