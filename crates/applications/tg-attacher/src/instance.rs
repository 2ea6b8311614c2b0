//! Instance records and the local instance cache
//!
//! The watch source hands us [`InstanceNotification`]s. Each one updates the
//! [`InstanceStore`] and produces an [`InstanceEvent`] for the work queue.
//! The queue only carries keys and kinds; workers always read the latest
//! snapshot back out of the store.
//!
//! ## Tombstones
//!
//! When an instance is deleted its last known snapshot is kept as a
//! tombstone until the delete has been reconciled (or the tombstone ages
//! out). Without it the delete path would have no IP or annotations left to
//! deregister.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Lifecycle notification type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Instance first observed
    Create,
    /// Instance changed (or periodic resync)
    Update,
    /// Instance removed
    Delete,
}

/// A queued lifecycle event for one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceEvent {
    /// Instance key (`namespace/name`)
    pub key: String,

    /// What happened
    pub kind: EventKind,

    /// When the notification was observed
    pub observed_at: DateTime<Utc>,
}

impl InstanceEvent {
    /// Create an event observed now
    pub fn new(key: impl Into<String>, kind: EventKind) -> Self {
        Self {
            key: key.into(),
            kind,
            observed_at: Utc::now(),
        }
    }
}

/// Point-in-time view of a workload instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    /// Instance key (`namespace/name`)
    pub key: String,

    /// Assigned IP address (empty until the instance is scheduled)
    #[serde(default)]
    pub ip_address: String,

    /// Instance annotations
    #[serde(default)]
    pub annotations: HashMap<String, String>,

    /// Instance labels (used for upstream selection only)
    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// Whether deletion has been requested
    #[serde(default)]
    pub deletion_requested: bool,

    /// When the instance was created
    pub creation_time: DateTime<Utc>,
}

impl InstanceSnapshot {
    /// Create a snapshot with no annotations
    pub fn new(key: impl Into<String>, ip_address: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ip_address: ip_address.into(),
            annotations: HashMap::new(),
            labels: HashMap::new(),
            deletion_requested: false,
            creation_time: Utc::now(),
        }
    }

    /// Add an annotation
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Mark the instance as pending deletion
    pub fn marked_for_deletion(mut self) -> Self {
        self.deletion_requested = true;
        self
    }

    /// Namespace part of the key (empty for cluster-scoped keys)
    pub fn namespace(&self) -> &str {
        self.key.split_once('/').map(|(ns, _)| ns).unwrap_or("")
    }

    /// Whether the instance has an IP yet
    pub fn has_ip(&self) -> bool {
        !self.ip_address.is_empty()
    }
}

/// A notification from the instance record source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceNotification {
    /// What happened
    pub kind: EventKind,

    /// State of the instance (final known state for deletes)
    pub snapshot: InstanceSnapshot,
}

#[derive(Debug, Clone)]
struct Tombstone {
    snapshot: InstanceSnapshot,
    deleted_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct StoreState {
    live: HashMap<String, InstanceSnapshot>,
    tombstones: HashMap<String, Tombstone>,
}

/// Local cache of instance snapshots, shared between ingestion, workers and
/// the drift corrector
#[derive(Debug, Clone, Default)]
pub struct InstanceStore {
    state: Arc<RwLock<StoreState>>,
}

impl InstanceStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a live snapshot
    ///
    /// A tombstone for the same key is dropped when it holds the same IP (or
    /// none). A tombstone with a different IP belongs to a replaced instance
    /// whose registrations are still outstanding, so it is kept.
    pub async fn apply(&self, snapshot: InstanceSnapshot) {
        let mut state = self.state.write().await;
        let superseded = state.tombstones.get(&snapshot.key).is_some_and(|t| {
            !t.snapshot.has_ip() || t.snapshot.ip_address == snapshot.ip_address
        });
        if superseded {
            state.tombstones.remove(&snapshot.key);
        }
        state.live.insert(snapshot.key.clone(), snapshot);
    }

    /// Remove a live snapshot and keep it as a tombstone
    ///
    /// `final_state` is used when the store never saw the instance (or lost
    /// it), so a delete observed without a prior create still has something
    /// to deregister.
    pub async fn remove(&self, key: &str, final_state: Option<InstanceSnapshot>) {
        let mut state = self.state.write().await;
        let last_known = state.live.remove(key).or(final_state);
        match last_known {
            Some(snapshot) => {
                state.tombstones.insert(
                    key.to_string(),
                    Tombstone {
                        snapshot,
                        deleted_at: Utc::now(),
                    },
                );
            }
            None => debug!(key = %key, "Delete for unknown instance, no tombstone kept"),
        }
    }

    /// Live snapshot for a key
    pub async fn get(&self, key: &str) -> Option<InstanceSnapshot> {
        self.state.read().await.live.get(key).cloned()
    }

    /// Last known snapshot of a deleted instance
    pub async fn tombstone(&self, key: &str) -> Option<InstanceSnapshot> {
        self.state
            .read()
            .await
            .tombstones
            .get(key)
            .map(|t| t.snapshot.clone())
    }

    /// Drop a tombstone once its delete has been handled
    pub async fn forget_tombstone(&self, key: &str) {
        self.state.write().await.tombstones.remove(key);
    }

    /// All live snapshots
    pub async fn list(&self) -> Vec<InstanceSnapshot> {
        self.state.read().await.live.values().cloned().collect()
    }

    /// Drop tombstones older than `ttl`, returning how many were dropped
    pub async fn prune_tombstones(&self, ttl: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        else {
            return 0;
        };
        let mut state = self.state.write().await;
        let before = state.tombstones.len();
        state.tombstones.retain(|_, t| t.deleted_at > cutoff);
        before - state.tombstones.len()
    }

    /// Number of live snapshots
    pub async fn len(&self) -> usize {
        self.state.read().await.live.len()
    }

    /// Whether there are no live snapshots
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.live.is_empty()
    }
}
