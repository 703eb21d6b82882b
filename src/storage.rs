//! Local key/value storage with replica expiration and periodic republishing.
//!
//! Two maps are kept:
//!
//! - **original**: values this node published itself. They never expire and
//!   are re-announced to the network on every republish cycle.
//! - **replica**: values served to lookups, each with an expiry instant. Local
//!   publishes land here too, next to copies accepted from other publishers.
//!
//! A background task owned by [`Storage`] republishes originals and then
//! sweeps expired replicas on a fixed period. Republishing goes through the
//! injected [`Republisher`], which keeps storage free of any knowledge about
//! routing or the network.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::Key;

/// Callback used to push an original value back out to the network.
#[async_trait]
pub trait Republisher: Send + Sync + 'static {
    /// Re-announce a single key/value pair.
    async fn republish(&self, key: Key, value: String) -> Result<()>;
}

/// A cached copy of a value and the instant it stops being served.
#[derive(Clone, Debug)]
struct ReplicaEntry {
    value: String,
    expires_at: Instant,
}

impl ReplicaEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Default)]
struct StorageState {
    original: HashMap<Key, String>,
    replica: HashMap<Key, ReplicaEntry>,
}

/// Outcome of one republish pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RepublishReport {
    /// Number of original entries handed to the republisher.
    pub attempted: usize,
    /// Number of those that failed.
    pub failed: usize,
}

/// A replica as shown to operators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReplicaView {
    pub value: String,
    /// Remaining lifetime; zero once the entry has expired but not yet been swept.
    pub expires_in_ms: u64,
}

/// Point-in-time copy of both maps, ordered by key.
#[derive(Clone, Debug, Default, Serialize)]
pub struct StorageSnapshot {
    pub original: BTreeMap<Key, String>,
    pub replica: BTreeMap<Key, ReplicaView>,
}

/// Original and replica stores plus their maintenance task.
pub struct Storage {
    state: Mutex<StorageState>,
    replica_ttl: Duration,
    republish_interval: Duration,
    republisher: Arc<dyn Republisher>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Storage {
    /// Create an empty store. The maintenance task is not running yet.
    pub fn new(
        replica_ttl: Duration,
        republish_interval: Duration,
        republisher: Arc<dyn Republisher>,
    ) -> Self {
        Self {
            state: Mutex::new(StorageState::default()),
            replica_ttl,
            republish_interval,
            republisher,
            task: Mutex::new(None),
        }
    }

    /// Record a value published by this node, and serve it locally.
    pub async fn set_original(&self, key: Key, value: String) {
        let mut state = self.state.lock().await;
        state.original.insert(key, value.clone());
        Self::insert_replica(&mut state, key, value, self.replica_ttl);
    }

    /// Insert or refresh a replica; the expiry restarts from now.
    pub async fn set_replica(&self, key: Key, value: String) {
        let mut state = self.state.lock().await;
        Self::insert_replica(&mut state, key, value, self.replica_ttl);
    }

    fn insert_replica(state: &mut StorageState, key: Key, value: String, ttl: Duration) {
        state.replica.insert(
            key,
            ReplicaEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Read a replica. Expired entries are removed on the spot.
    pub async fn get(&self, key: &Key) -> Option<String> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let entry = state.replica.get(key)?;
        if !entry.is_expired(now) {
            return Some(entry.value.clone());
        }
        state.replica.remove(key);
        debug!(key = %key, "replica expired on read");
        None
    }

    /// Whether the maintenance task is currently scheduled.
    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }

    /// Start the periodic republish + garbage-collect task. No-op if running.
    ///
    /// The task only holds a weak reference, so dropping the last handle to
    /// the storage also ends it at the next tick.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        let period = self.republish_interval;
        let storage: Weak<Storage> = Arc::downgrade(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(storage) = storage.upgrade() else {
                    break;
                };
                storage.run_maintenance().await;
            }
        }));
        info!(interval_ms = period.as_millis() as u64, "storage maintenance started");
    }

    /// Stop the maintenance task. Once this returns the task will not fire again.
    pub async fn stop(&self) {
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            info!("storage maintenance stopped");
        }
    }

    /// Run a republish pass immediately, outside the timer.
    pub async fn force_republish(&self) -> RepublishReport {
        self.republish_all().await
    }

    async fn run_maintenance(&self) {
        let report = self.republish_all().await;
        let removed = self.collect_garbage().await;
        debug!(
            republished = report.attempted,
            failed = report.failed,
            expired = removed,
            "storage maintenance pass"
        );
    }

    /// Re-announce every original entry concurrently.
    ///
    /// The local replica copy of each original is refreshed first. A failing
    /// key is logged and counted; it never stops the others.
    async fn republish_all(&self) -> RepublishReport {
        let entries: Vec<(Key, String)> = {
            let mut state = self.state.lock().await;
            let entries: Vec<(Key, String)> = state
                .original
                .iter()
                .map(|(key, value)| (*key, value.clone()))
                .collect();
            for (key, value) in &entries {
                Self::insert_replica(&mut state, *key, value.clone(), self.replica_ttl);
            }
            entries
        };

        if entries.is_empty() {
            return RepublishReport::default();
        }

        let attempted = entries.len();
        let results = join_all(entries.into_iter().map(|(key, value)| {
            let republisher = self.republisher.clone();
            async move { (key, republisher.republish(key, value).await) }
        }))
        .await;

        let mut failed = 0;
        for (key, result) in results {
            if let Err(err) = result {
                failed += 1;
                warn!(key = %key, "republish failed: {err:#}");
            }
        }
        RepublishReport { attempted, failed }
    }

    /// Delete every expired replica. Returns how many were removed.
    pub async fn collect_garbage(&self) -> usize {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let before = state.replica.len();
        state.replica.retain(|_, entry| !entry.is_expired(now));
        before - state.replica.len()
    }

    /// Copy both maps for inspection without expiring anything.
    pub async fn snapshot(&self) -> StorageSnapshot {
        let state = self.state.lock().await;
        let now = Instant::now();
        StorageSnapshot {
            original: state
                .original
                .iter()
                .map(|(key, value)| (*key, value.clone()))
                .collect(),
            replica: state
                .replica
                .iter()
                .map(|(key, entry)| {
                    let remaining = entry.expires_at.saturating_duration_since(now);
                    (
                        *key,
                        ReplicaView {
                            value: entry.value.clone(),
                            expires_in_ms: remaining.as_millis() as u64,
                        },
                    )
                })
                .collect(),
        }
    }
}
