//! Per-item reconciliation
//!
//! Turns one [`InstanceEvent`] into target-group calls:
//!
//! ```text
//! Fetched ──► Decoded ──► Diffed ──► Applied
//!    │           │           │
//!    └───────────┴───────────┴─────► Skipped
//!                            └─────► Failed (client error, retried by the queue)
//! ```
//!
//! Desired state is always re-derived from the store and re-asserted in full.
//! Registration is idempotent on the backend, so duplicate deliveries and
//! periodic resyncs are harmless.
//!
//! An instance deleted and recreated under the same key with a new IP leaves
//! a tombstone behind. Whichever event for the key runs next detaches the
//! old IP before handling the live instance.

use crate::annotation::{AnnotationDecoder, TargetGroupAssignment, group_by_arn};
use crate::client::TargetGroupClient;
use crate::error::Result;
use crate::instance::{EventKind, InstanceEvent, InstanceSnapshot, InstanceStore};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

/// Why an item resolved without calling the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Instance no longer in the store
    InstanceGone,
    /// Instance declares no target groups
    NoAssignments,
    /// Target-group annotation could not be decoded
    MalformedAnnotation,
    /// Instance has no IP yet
    NoIpYet,
    /// Create seen for an instance already being deleted
    DeletionRequested,
    /// Instance predates process start and only new instances are handled
    PredatesStart,
    /// Delete arrived after the key was recreated
    StaleDelete,
    /// Delete with no last known state to deregister
    UnknownOnDelete,
}

/// Result of a successful reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Instance IP asserted in this many target groups
    Registered {
        /// Distinct target groups registered with
        target_groups: usize,
    },
    /// This many ARN/IP pairs deregistered
    Deregistered {
        /// ARN/IP pairs deregistered
        targets: usize,
    },
    /// Nothing to do
    Skipped(SkipReason),
}

/// Reconciles instance events against the target-group backend
pub struct Reconciler {
    store: InstanceStore,
    decoder: AnnotationDecoder,
    client: TargetGroupClient,
    /// Set when only instances created after this instant are registered
    new_instances_since: Option<DateTime<Utc>>,
}

impl Reconciler {
    /// Create a reconciler
    pub fn new(store: InstanceStore, decoder: AnnotationDecoder, client: TargetGroupClient) -> Self {
        Self {
            store,
            decoder,
            client,
            new_instances_since: None,
        }
    }

    /// Ignore creates for instances that existed before `started_at`
    pub fn with_only_new_instances(mut self, started_at: DateTime<Utc>) -> Self {
        self.new_instances_since = Some(started_at);
        self
    }

    /// Reconcile one event
    pub async fn reconcile(&self, event: &InstanceEvent) -> Result<Outcome> {
        debug!(key = %event.key, kind = ?event.kind, "Handle event");

        if event.kind == EventKind::Delete {
            return self.reconcile_delete(&event.key).await;
        }

        let Some(snapshot) = self.store.get(&event.key).await else {
            debug!(key = %event.key, "Instance gone before processing, nothing to do");
            return Ok(Outcome::Skipped(SkipReason::InstanceGone));
        };

        let retired = self.retire_replaced(&snapshot).await?;

        let outcome = match self.assignments(&snapshot) {
            Ok(assignments) if event.kind == EventKind::Create => {
                self.reconcile_create(&snapshot, &assignments).await?
            }
            Ok(assignments) => self.reconcile_update(&snapshot, &assignments).await?,
            Err(reason) => Outcome::Skipped(reason),
        };

        Ok(match outcome {
            Outcome::Skipped(_) if retired > 0 => Outcome::Deregistered { targets: retired },
            outcome => outcome,
        })
    }

    async fn reconcile_create(
        &self,
        snapshot: &InstanceSnapshot,
        assignments: &[TargetGroupAssignment],
    ) -> Result<Outcome> {
        if snapshot.deletion_requested {
            info!(key = %snapshot.key, "Instance already marked for deletion, skipping");
            return Ok(Outcome::Skipped(SkipReason::DeletionRequested));
        }

        if !snapshot.has_ip() {
            info!(key = %snapshot.key, "Instance has no IP address yet, skipping");
            return Ok(Outcome::Skipped(SkipReason::NoIpYet));
        }

        if let Some(started_at) = self.new_instances_since {
            if snapshot.creation_time < started_at {
                debug!(key = %snapshot.key, "Instance predates startup, skipping");
                return Ok(Outcome::Skipped(SkipReason::PredatesStart));
            }
        }

        self.register_all(assignments).await
    }

    async fn reconcile_update(
        &self,
        snapshot: &InstanceSnapshot,
        assignments: &[TargetGroupAssignment],
    ) -> Result<Outcome> {
        if !snapshot.has_ip() {
            debug!(key = %snapshot.key, "Instance has no IP address yet, skipping");
            return Ok(Outcome::Skipped(SkipReason::NoIpYet));
        }

        if snapshot.deletion_requested {
            info!(key = %snapshot.key, "Instance marked for deletion, removing from target groups");
            return self.deregister_all(assignments).await;
        }

        info!(key = %snapshot.key, "Ensuring instance is attached to its target groups");
        self.register_all(assignments).await
    }

    async fn reconcile_delete(&self, key: &str) -> Result<Outcome> {
        if let Some(live) = self.store.get(key).await {
            let retired = self.retire_replaced(&live).await?;
            if retired > 0 {
                return Ok(Outcome::Deregistered { targets: retired });
            }
            debug!(key = %key, "Instance recreated since delete, ignoring stale delete");
            return Ok(Outcome::Skipped(SkipReason::StaleDelete));
        }

        let Some(snapshot) = self.store.tombstone(key).await else {
            warn!(
                key = %key,
                "No last known state for deleted instance, target group membership may be stale"
            );
            return Ok(Outcome::Skipped(SkipReason::UnknownOnDelete));
        };

        let outcome = match self.assignments(&snapshot) {
            Err(reason) => Outcome::Skipped(reason),
            Ok(_) if !snapshot.has_ip() => Outcome::Skipped(SkipReason::NoIpYet),
            Ok(assignments) => self.deregister_all(&assignments).await?,
        };

        self.store.forget_tombstone(key).await;
        Ok(outcome)
    }

    /// Detach the IP of a deleted predecessor the live instance no longer
    /// uses; returns the number of ARN/IP pairs deregistered
    async fn retire_replaced(&self, live: &InstanceSnapshot) -> Result<usize> {
        let Some(previous) = self.store.tombstone(&live.key).await else {
            return Ok(0);
        };
        if !previous.has_ip() || previous.ip_address == live.ip_address {
            self.store.forget_tombstone(&live.key).await;
            return Ok(0);
        }

        let retired = match self.decoder.decode(&previous) {
            Ok(assignments) if assignments.is_empty() => 0,
            Ok(assignments) => {
                info!(
                    key = %live.key,
                    old_ip = %previous.ip_address,
                    new_ip = %live.ip_address,
                    "Instance replaced under the same key, detaching previous IP"
                );
                self.deregister_all(&assignments).await?;
                assignments.len()
            }
            Err(e) => {
                warn!(key = %live.key, error = %e, "Cannot decode previous instance's target groups");
                0
            }
        };

        self.store.forget_tombstone(&live.key).await;
        Ok(retired)
    }

    /// Decode assignments, mapping "nothing to do" cases to a skip reason
    fn assignments(
        &self,
        snapshot: &InstanceSnapshot,
    ) -> std::result::Result<Vec<TargetGroupAssignment>, SkipReason> {
        match self.decoder.decode(snapshot) {
            Ok(assignments) if assignments.is_empty() => Err(SkipReason::NoAssignments),
            Ok(assignments) => Ok(assignments),
            Err(e) => {
                error!(key = %snapshot.key, error = %e, "Failed to decode target group annotation, skipping");
                Err(SkipReason::MalformedAnnotation)
            }
        }
    }

    /// One register call per ARN; every ARN is attempted
    async fn register_all(&self, assignments: &[TargetGroupAssignment]) -> Result<Outcome> {
        let groups = group_by_arn(assignments);
        let mut first_error = None;

        for (arn, ips) in &groups {
            if let Err(e) = self.client.register(arn, ips).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(Outcome::Registered {
                target_groups: groups.len(),
            }),
        }
    }

    /// One deregister call per ARN/IP pair; every pair is attempted
    async fn deregister_all(&self, assignments: &[TargetGroupAssignment]) -> Result<Outcome> {
        let mut first_error = None;

        for assignment in assignments {
            if let Err(e) = self
                .client
                .deregister(&assignment.target_group_arn, &assignment.pod_ip)
                .await
            {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(Outcome::Deregistered {
                targets: assignments.len(),
            }),
        }
    }
}
