//! Periodic drift correction
//!
//! Heals target groups that missed a registration because a watch event was
//! lost. Each pass compares the membership implied by the store with the
//! backend's live targets and registers whatever is missing.
//!
//! The sweep never deregisters. Removing targets stays with the event path,
//! so a target group can hold members this controller does not manage.

use crate::annotation::AnnotationDecoder;
use crate::client::TargetGroupClient;
use crate::config::DEFAULT_TOMBSTONE_TTL;
use crate::instance::InstanceStore;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Summary of one drift pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriftReport {
    /// Target groups compared against the backend
    pub groups_checked: usize,
    /// IPs registered because they were missing
    pub targets_registered: usize,
    /// Target groups whose describe or register failed
    pub groups_failed: usize,
    /// Expired delete tombstones dropped
    pub tombstones_pruned: usize,
}

/// Registers desired targets missing from their target groups
pub struct DriftCorrector {
    store: InstanceStore,
    decoder: AnnotationDecoder,
    client: TargetGroupClient,
    allowed: BTreeSet<String>,
    tombstone_ttl: Duration,
}

impl DriftCorrector {
    /// Create a corrector over every referenced target group
    pub fn new(store: InstanceStore, decoder: AnnotationDecoder, client: TargetGroupClient) -> Self {
        Self {
            store,
            decoder,
            client,
            allowed: BTreeSet::new(),
            tombstone_ttl: DEFAULT_TOMBSTONE_TTL,
        }
    }

    /// Only correct these target groups
    pub fn with_allowed_target_groups<I, S>(mut self, arns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed = arns.into_iter().map(Into::into).collect();
        self
    }

    /// Set how long delete tombstones survive
    pub fn with_tombstone_ttl(mut self, ttl: Duration) -> Self {
        self.tombstone_ttl = ttl;
        self
    }

    /// Desired IPs per target group, from every live instance with an IP
    /// that is not being deleted
    pub async fn desired_membership(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut desired: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for snapshot in self.store.list().await {
            if !snapshot.has_ip() || snapshot.deletion_requested {
                continue;
            }
            let assignments = match self.decoder.decode(&snapshot) {
                Ok(assignments) => assignments,
                Err(e) => {
                    debug!(key = %snapshot.key, error = %e, "Skipping undecodable instance");
                    continue;
                }
            };
            for assignment in assignments {
                if !self.allowed.is_empty() && !self.allowed.contains(&assignment.target_group_arn) {
                    continue;
                }
                desired
                    .entry(assignment.target_group_arn)
                    .or_default()
                    .insert(assignment.pod_ip);
            }
        }

        desired
    }

    /// Run one pass
    pub async fn correct_once(&self) -> DriftReport {
        let mut report = DriftReport {
            tombstones_pruned: self.store.prune_tombstones(self.tombstone_ttl).await,
            ..Default::default()
        };

        for (arn, ips) in self.desired_membership().await {
            report.groups_checked += 1;
            match self.client.ensure_registered(&arn, &ips).await {
                Ok(added) if added.is_empty() => {}
                Ok(added) => {
                    info!(target_group = %arn, ips = ?added, "Registered drifted targets");
                    report.targets_registered += added.len();
                }
                Err(e) => {
                    warn!(target_group = %arn, error = %e, "Drift check failed");
                    report.groups_failed += 1;
                }
            }
        }

        report
    }

    /// Run passes every `interval` until cancelled
    ///
    /// The first pass runs one interval after start, once the store has had
    /// time to fill.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = interval.as_secs(), "Drift corrector started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.correct_once().await;
                    debug!(
                        groups_checked = report.groups_checked,
                        targets_registered = report.targets_registered,
                        groups_failed = report.groups_failed,
                        tombstones_pruned = report.tombstones_pruned,
                        "Drift pass complete"
                    );
                }
            }
        }

        info!("Drift corrector stopped");
    }
}
