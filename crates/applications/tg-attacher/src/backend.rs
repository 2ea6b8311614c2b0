//! Target-group backend interface
//!
//! The reconciler and drift corrector work through [`TargetGroupBackend`]
//! only. [`crate::elb::ElbBackend`] is the AWS implementation.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Health state of a registered target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetState {
    /// Registration in progress, initial health checks pending
    Initial,
    /// Passing health checks
    Healthy,
    /// Failing health checks
    Unhealthy,
    /// Not used by any load balancer / AZ not enabled
    Unused,
    /// Deregistration in progress
    Draining,
    /// Health checks disabled
    Unavailable,
    /// State not reported or not recognized
    Unknown,
}

/// One registered target as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetHealth {
    /// Target IP
    pub ip: String,

    /// Health state
    pub state: TargetState,
}

impl TargetHealth {
    /// Create a target health entry
    pub fn new(ip: impl Into<String>, state: TargetState) -> Self {
        Self {
            ip: ip.into(),
            state,
        }
    }
}

/// Idempotent target-group registration operations
#[async_trait]
pub trait TargetGroupBackend: Send + Sync {
    /// Register a set of IPs with a target group
    async fn register_targets(&self, target_group_arn: &str, ips: &[String]) -> Result<()>;

    /// Deregister one IP from a target group
    async fn deregister_target(&self, target_group_arn: &str, ip: &str) -> Result<()>;

    /// Describe every target currently registered with a target group
    async fn describe_target_health(&self, target_group_arn: &str) -> Result<Vec<TargetHealth>>;
}
