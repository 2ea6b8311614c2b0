//! Serialized access to the target-group backend
//!
//! Every call against a target group goes through [`TargetGroupClient`],
//! which holds that group's lock for the duration of the call. A register
//! and a deregister for the same ARN are therefore never in flight at the
//! same time, while calls for unrelated ARNs proceed in parallel.
//!
//! The client also owns the caller-side error policy:
//!
//! | Operation  | Code                     | Outcome                  |
//! |------------|--------------------------|--------------------------|
//! | deregister | `InvalidTarget`          | warn, treated as success |
//! | any        | other classified code    | error log, failure       |
//! | any        | call timeout             | error log, failure       |

use crate::backend::{TargetGroupBackend, TargetHealth};
use crate::error::{AttacherError, BackendErrorCode, Result};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

/// Default timeout for a single backend call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Lock table keyed by target group ARN
///
/// An entry lives only while some call holds or waits for it.
#[derive(Debug, Default)]
struct ArnLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ArnLocks {
    fn table(&self) -> MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn lock(&self, target_group_arn: &str) -> ArnGuard<'_> {
        let lock = self
            .table()
            .entry(target_group_arn.to_string())
            .or_default()
            .clone();
        ArnGuard {
            guard: Some(lock.lock_owned().await),
            locks: self,
            target_group_arn: target_group_arn.to_string(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table().len()
    }
}

/// Held lock for one ARN; drops the table entry when nobody else wants it
struct ArnGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a ArnLocks,
    target_group_arn: String,
}

impl Drop for ArnGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut table = self.locks.table();
        // Waiters clone the Arc under the table lock, so a count of one
        // means the table holds the only reference.
        if table
            .get(&self.target_group_arn)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            table.remove(&self.target_group_arn);
        }
    }
}

/// Target-group client with per-ARN serialization
#[derive(Clone)]
pub struct TargetGroupClient {
    backend: Arc<dyn TargetGroupBackend>,
    locks: Arc<ArnLocks>,
    call_timeout: Duration,
}

impl TargetGroupClient {
    /// Wrap a backend with the default call timeout
    pub fn new(backend: Arc<dyn TargetGroupBackend>) -> Self {
        Self::with_timeout(backend, DEFAULT_CALL_TIMEOUT)
    }

    /// Wrap a backend with a custom call timeout
    pub fn with_timeout(backend: Arc<dyn TargetGroupBackend>, call_timeout: Duration) -> Self {
        Self {
            backend,
            locks: Arc::new(ArnLocks::default()),
            call_timeout,
        }
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.call_timeout, call)
            .await
            .map_err(|_| AttacherError::Timeout(self.call_timeout))?
    }

    /// Register IPs with a target group
    pub async fn register(&self, target_group_arn: &str, ips: &[String]) -> Result<()> {
        if ips.is_empty() {
            return Ok(());
        }

        let _guard = self.locks.lock(target_group_arn).await;
        self.register_locked(target_group_arn, ips).await
    }

    async fn register_locked(&self, target_group_arn: &str, ips: &[String]) -> Result<()> {
        match self
            .bounded(self.backend.register_targets(target_group_arn, ips))
            .await
        {
            Ok(()) => {
                info!(target_group = %target_group_arn, ips = ?ips, "Successfully attached");
                Ok(())
            }
            Err(e) => {
                log_failure("register", target_group_arn, &e);
                Err(e)
            }
        }
    }

    /// Deregister one IP from a target group
    ///
    /// Deregistering a target the group does not know about is not an error.
    pub async fn deregister(&self, target_group_arn: &str, ip: &str) -> Result<()> {
        let _guard = self.locks.lock(target_group_arn).await;

        match self
            .bounded(self.backend.deregister_target(target_group_arn, ip))
            .await
        {
            Ok(()) => {
                info!(target_group = %target_group_arn, ip = %ip, "Successfully detached");
                Ok(())
            }
            Err(e) if e.backend_code() == Some(&BackendErrorCode::InvalidTarget) => {
                warn!(
                    target_group = %target_group_arn,
                    ip = %ip,
                    code = %BackendErrorCode::InvalidTarget,
                    "Target not registered, nothing to detach"
                );
                Ok(())
            }
            Err(e) => {
                log_failure("deregister", target_group_arn, &e);
                Err(e)
            }
        }
    }

    /// Describe registered targets of a target group
    pub async fn describe_health(&self, target_group_arn: &str) -> Result<Vec<TargetHealth>> {
        let _guard = self.locks.lock(target_group_arn).await;
        self.describe_locked(target_group_arn).await
    }

    async fn describe_locked(&self, target_group_arn: &str) -> Result<Vec<TargetHealth>> {
        self.bounded(self.backend.describe_target_health(target_group_arn))
            .await
            .inspect_err(|e| log_failure("describe", target_group_arn, e))
    }

    /// Register every desired IP the target group does not already have
    ///
    /// The group's lock is held across the describe and the register, so no
    /// other call for the group can land in between. Returns the IPs that
    /// were registered.
    pub async fn ensure_registered(
        &self,
        target_group_arn: &str,
        desired: &BTreeSet<String>,
    ) -> Result<Vec<String>> {
        let _guard = self.locks.lock(target_group_arn).await;

        let live = self.describe_locked(target_group_arn).await?;
        let missing: Vec<String> = desired
            .iter()
            .filter(|ip| !live.iter().any(|t| &t.ip == *ip))
            .cloned()
            .collect();

        if missing.is_empty() {
            debug!(target_group = %target_group_arn, "All desired targets present");
            return Ok(missing);
        }

        self.register_locked(target_group_arn, &missing).await?;
        Ok(missing)
    }
}

fn log_failure(operation: &str, target_group_arn: &str, err: &AttacherError) {
    match err.backend_code() {
        Some(code) => error!(
            target_group = %target_group_arn,
            operation = operation,
            code = %code,
            error = %err,
            "Target group call failed"
        ),
        None => error!(
            target_group = %target_group_arn,
            operation = operation,
            error = %err,
            "Target group call failed"
        ),
    }
}
