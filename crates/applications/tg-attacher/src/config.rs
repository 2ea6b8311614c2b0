//! Attacher configuration

use crate::annotation::DEFAULT_ANNOTATION_KEY;
use crate::client::DEFAULT_CALL_TIMEOUT;
use crate::error::{AttacherError, Result};
use crate::queue::{DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP, DEFAULT_MAX_RETRIES, ExponentialBackoff};
use std::time::Duration;

/// Default label selecting instances for attachment
pub const DEFAULT_ENABLE_LABEL: &str = "nlb-attacher.bird.co/enabled";

/// Default lifetime of a delete tombstone
pub const DEFAULT_TOMBSTONE_TTL: Duration = Duration::from_secs(3600);

/// Configuration for the attacher
#[derive(Debug, Clone)]
pub struct AttacherConfig {
    /// Annotation holding target-group memberships
    pub annotation_key: String,

    /// Label an instance must carry (value `true`) to be observed
    pub enable_label: String,

    /// Restrict to one namespace
    pub namespace: Option<String>,

    /// Number of reconciliation workers
    pub workers: usize,

    /// Retries before an item is dropped
    pub max_retries: u32,

    /// Per-key backoff policy
    pub backoff: ExponentialBackoff,

    /// Only register instances created after startup
    pub only_new_instances: bool,

    /// Drift correction interval (`None` disables the sweep)
    pub drift_interval: Option<Duration>,

    /// Target groups the drift sweep may touch (empty means all referenced)
    pub drift_target_groups: Vec<String>,

    /// Timeout for a single backend call
    pub call_timeout: Duration,

    /// How long a delete tombstone is kept before it is pruned
    pub tombstone_ttl: Duration,
}

impl Default for AttacherConfig {
    fn default() -> Self {
        Self {
            annotation_key: DEFAULT_ANNOTATION_KEY.to_string(),
            enable_label: DEFAULT_ENABLE_LABEL.to_string(),
            namespace: None,
            workers: 1,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: ExponentialBackoff::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP),
            only_new_instances: false,
            drift_interval: None,
            drift_target_groups: Vec::new(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            tombstone_ttl: DEFAULT_TOMBSTONE_TTL,
        }
    }
}

impl AttacherConfig {
    /// Set the worker count
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the backoff policy
    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Only register instances created after startup
    pub fn with_only_new_instances(mut self, only_new: bool) -> Self {
        self.only_new_instances = only_new;
        self
    }

    /// Enable the drift sweep
    pub fn with_drift_interval(mut self, interval: Duration) -> Self {
        self.drift_interval = Some(interval);
        self
    }

    /// Set how long delete tombstones are kept
    pub fn with_tombstone_ttl(mut self, ttl: Duration) -> Self {
        self.tombstone_ttl = ttl;
        self
    }

    /// Restrict to a namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(AttacherError::config("at least one worker is required"));
        }
        if self.annotation_key.trim().is_empty() {
            return Err(AttacherError::config("annotation key must not be empty"));
        }
        if self.backoff.base.is_zero() || self.backoff.cap < self.backoff.base {
            return Err(AttacherError::config(
                "backoff base must be non-zero and not exceed the cap",
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(AttacherError::config("call timeout must be non-zero"));
        }
        if self.tombstone_ttl.is_zero() {
            return Err(AttacherError::config("tombstone TTL must be non-zero"));
        }
        if matches!(self.drift_interval, Some(interval) if interval.is_zero()) {
            return Err(AttacherError::config("drift interval must be non-zero"));
        }
        Ok(())
    }
}
