//! In-memory target-group backend for tests

use crate::backend::{TargetGroupBackend, TargetHealth, TargetState};
use crate::error::{AttacherError, BackendErrorCode, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A recorded backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Register(String, Vec<String>),
    Deregister(String, String),
    Describe(String),
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<Call>,
    targets: BTreeMap<String, BTreeMap<String, TargetState>>,
    failure: Option<BackendErrorCode>,
    /// `None` fails forever once `failure` is set
    failures_left: Option<usize>,
    latency: Duration,
    in_flight: HashMap<String, usize>,
    overlaps: usize,
}

/// Records every call, keeps registrations in memory, and counts calls
/// that enter while another call for the same ARN is in flight
#[derive(Debug, Default)]
pub(crate) struct RecordingBackend {
    state: Mutex<State>,
}

struct InFlight<'a> {
    backend: &'a RecordingBackend,
    arn: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.backend.state();
        if let Some(count) = state.in_flight.get_mut(&self.arn) {
            *count = count.saturating_sub(1);
        }
    }
}

impl RecordingBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Fail every call with `code`
    pub(crate) fn fail_with(&self, code: BackendErrorCode) {
        let mut state = self.state();
        state.failure = Some(code);
        state.failures_left = None;
    }

    /// Fail the next `times` calls with `code`
    pub(crate) fn fail_times(&self, code: BackendErrorCode, times: usize) {
        let mut state = self.state();
        state.failure = Some(code);
        state.failures_left = Some(times);
    }

    pub(crate) fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Pre-register a target
    pub(crate) fn seed(&self, arn: &str, ip: &str, target_state: TargetState) {
        self.state()
            .targets
            .entry(arn.to_string())
            .or_default()
            .insert(ip.to_string(), target_state);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub(crate) fn register_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Register(..)))
            .collect()
    }

    pub(crate) fn deregister_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Deregister(..)))
            .collect()
    }

    /// Registered IPs of a target group, sorted
    pub(crate) fn registered(&self, arn: &str) -> Vec<String> {
        self.state()
            .targets
            .get(arn)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn overlaps(&self) -> usize {
        self.state().overlaps
    }

    fn enter(&self, arn: &str, call: Call) -> (InFlight<'_>, Duration) {
        let mut state = self.state();
        state.calls.push(call);
        let count = state.in_flight.entry(arn.to_string()).or_insert(0);
        *count += 1;
        if *count > 1 {
            state.overlaps += 1;
        }
        let latency = state.latency;
        (
            InFlight {
                backend: self,
                arn: arn.to_string(),
            },
            latency,
        )
    }

    fn take_failure(&self, operation: &'static str, arn: &str) -> Result<()> {
        let mut guard = self.state();
        let state = &mut *guard;
        let Some(code) = state.failure.clone() else {
            return Ok(());
        };
        match state.failures_left {
            Some(0) => {
                state.failure = None;
                return Ok(());
            }
            Some(ref mut left) => *left -= 1,
            None => {}
        }
        Err(AttacherError::backend(operation, arn, code, "injected failure"))
    }
}

#[async_trait]
impl TargetGroupBackend for RecordingBackend {
    async fn register_targets(&self, target_group_arn: &str, ips: &[String]) -> Result<()> {
        let (_in_flight, latency) =
            self.enter(target_group_arn, Call::Register(target_group_arn.to_string(), ips.to_vec()));
        tokio::time::sleep(latency).await;
        self.take_failure("RegisterTargets", target_group_arn)?;

        {
            let mut state = self.state();
            let targets = state.targets.entry(target_group_arn.to_string()).or_default();
            for ip in ips {
                targets.entry(ip.clone()).or_insert(TargetState::Initial);
            }
        }
        Ok(())
    }

    async fn deregister_target(&self, target_group_arn: &str, ip: &str) -> Result<()> {
        let (_in_flight, latency) = self.enter(
            target_group_arn,
            Call::Deregister(target_group_arn.to_string(), ip.to_string()),
        );
        tokio::time::sleep(latency).await;
        self.take_failure("DeregisterTargets", target_group_arn)?;

        let removed = self
            .state()
            .targets
            .get_mut(target_group_arn)
            .and_then(|t| t.remove(ip));
        match removed {
            Some(_) => Ok(()),
            None => Err(AttacherError::backend(
                "DeregisterTargets",
                target_group_arn,
                BackendErrorCode::InvalidTarget,
                "target is not registered",
            )),
        }
    }

    async fn describe_target_health(&self, target_group_arn: &str) -> Result<Vec<TargetHealth>> {
        let (_in_flight, latency) =
            self.enter(target_group_arn, Call::Describe(target_group_arn.to_string()));
        tokio::time::sleep(latency).await;
        self.take_failure("DescribeTargetHealth", target_group_arn)?;

        let targets = self
            .state()
            .targets
            .get(target_group_arn)
            .map(|t| {
                t.iter()
                    .map(|(ip, state)| TargetHealth::new(ip.clone(), *state))
                    .collect()
            })
            .unwrap_or_default();
        Ok(targets)
    }
}
