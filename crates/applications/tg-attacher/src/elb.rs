//! AWS ELBv2 target-group backend
//!
//! Registers instance IPs with ALB/NLB target groups of target type `ip`.
//! The port is not sent; the target group's default port applies.
//!
//! ## Prerequisites
//!
//! - IAM permissions for `elasticloadbalancing:RegisterTargets`,
//!   `elasticloadbalancing:DeregisterTargets` and
//!   `elasticloadbalancing:DescribeTargetHealth`

use crate::backend::{TargetGroupBackend, TargetHealth, TargetState};
use crate::error::{AttacherError, BackendErrorCode, Result};
use async_trait::async_trait;
use aws_sdk_elasticloadbalancingv2::Client as ElbClient;
use aws_sdk_elasticloadbalancingv2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_elasticloadbalancingv2::types::{TargetDescription, TargetHealthStateEnum};
use tracing::debug;

/// ELBv2-backed target-group backend
#[derive(Debug, Clone)]
pub struct ElbBackend {
    client: ElbClient,
}

impl ElbBackend {
    /// Create a backend from an existing client
    pub fn new(client: ElbClient) -> Self {
        Self { client }
    }

    /// Create from AWS config
    pub fn from_config(config: &aws_config::SdkConfig) -> Self {
        Self::new(ElbClient::new(config))
    }
}

/// Map an SDK error onto a classified backend error
fn classify<E, R>(operation: &'static str, target_group_arn: &str, err: SdkError<E, R>) -> AttacherError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let code = BackendErrorCode::from_code(err.as_service_error().and_then(|e| e.code()));
    let message = err
        .as_service_error()
        .and_then(|e| e.message())
        .map(str::to_string)
        .unwrap_or_else(|| DisplayErrorContext(&err).to_string());

    AttacherError::backend(operation, target_group_arn, code, message)
}

fn target_state(state: Option<&TargetHealthStateEnum>) -> TargetState {
    match state {
        Some(TargetHealthStateEnum::Initial) => TargetState::Initial,
        Some(TargetHealthStateEnum::Healthy) => TargetState::Healthy,
        Some(TargetHealthStateEnum::Unhealthy) => TargetState::Unhealthy,
        Some(TargetHealthStateEnum::Unused) => TargetState::Unused,
        Some(TargetHealthStateEnum::Draining) => TargetState::Draining,
        Some(TargetHealthStateEnum::Unavailable) => TargetState::Unavailable,
        _ => TargetState::Unknown,
    }
}

fn target(ip: &str) -> TargetDescription {
    TargetDescription::builder().id(ip).build()
}

#[async_trait]
impl TargetGroupBackend for ElbBackend {
    async fn register_targets(&self, target_group_arn: &str, ips: &[String]) -> Result<()> {
        let mut request = self.client.register_targets().target_group_arn(target_group_arn);
        for ip in ips {
            debug!(target_group = %target_group_arn, ip = %ip, "Attempting to attach");
            request = request.targets(target(ip));
        }

        request
            .send()
            .await
            .map_err(|e| classify("RegisterTargets", target_group_arn, e))?;

        Ok(())
    }

    async fn deregister_target(&self, target_group_arn: &str, ip: &str) -> Result<()> {
        self.client
            .deregister_targets()
            .target_group_arn(target_group_arn)
            .targets(target(ip))
            .send()
            .await
            .map_err(|e| classify("DeregisterTargets", target_group_arn, e))?;

        Ok(())
    }

    async fn describe_target_health(&self, target_group_arn: &str) -> Result<Vec<TargetHealth>> {
        let response = self
            .client
            .describe_target_health()
            .target_group_arn(target_group_arn)
            .send()
            .await
            .map_err(|e| classify("DescribeTargetHealth", target_group_arn, e))?;

        let targets = response
            .target_health_descriptions()
            .iter()
            .filter_map(|desc| {
                let ip = desc.target().and_then(|t| t.id())?;
                let state = target_state(desc.target_health().and_then(|h| h.state()));
                Some(TargetHealth::new(ip, state))
            })
            .collect();

        Ok(targets)
    }
}
