//! Target-group annotation decoding
//!
//! Instances opt into target groups through a single annotation whose value
//! is a JSON array:
//!
//! ```json
//! [{"Arn": "arn:aws:elasticloadbalancing:...:targetgroup/web/abc", "PortName": "http"}]
//! ```
//!
//! `PortName` is carried through but not used for registration; the port is
//! fixed by the target group.

use crate::error::{AttacherError, Result};
use crate::instance::InstanceSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default annotation key holding target-group memberships
pub const DEFAULT_ANNOTATION_KEY: &str = "nlb-attacher.bird.co/target-groups";

/// One entry of the target-group annotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroupAnnotation {
    /// Target group ARN
    #[serde(rename = "Arn")]
    pub arn: String,

    /// Named container port (informational)
    #[serde(rename = "PortName", default)]
    pub port_name: String,
}

/// An instance IP that should be a member of a target group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetGroupAssignment {
    /// Target group ARN
    pub target_group_arn: String,

    /// IP to register
    pub pod_ip: String,
}

/// Decodes target-group assignments from instance annotations
#[derive(Debug, Clone)]
pub struct AnnotationDecoder {
    key: String,
}

impl AnnotationDecoder {
    /// Create a decoder reading the given annotation key
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    /// Annotation key this decoder reads
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Decode the raw annotation entries
    ///
    /// Returns an empty list when the annotation is absent.
    pub fn decode_annotation(&self, snapshot: &InstanceSnapshot) -> Result<Vec<TargetGroupAnnotation>> {
        let Some(value) = snapshot.annotations.get(&self.key) else {
            return Ok(Vec::new());
        };

        let entries: Vec<TargetGroupAnnotation> =
            serde_json::from_str(value).map_err(|source| AttacherError::Annotation {
                key: self.key.clone(),
                source,
            })?;

        if entries.iter().any(|e| e.arn.trim().is_empty()) {
            return Err(AttacherError::Annotation {
                key: self.key.clone(),
                source: serde::de::Error::custom("entry with empty Arn"),
            });
        }

        Ok(entries)
    }

    /// Decode the assignments for an instance
    ///
    /// Duplicate ARNs collapse into one assignment; order of first appearance
    /// is kept.
    pub fn decode(&self, snapshot: &InstanceSnapshot) -> Result<Vec<TargetGroupAssignment>> {
        let mut assignments: Vec<TargetGroupAssignment> = Vec::new();

        for entry in self.decode_annotation(snapshot)? {
            if assignments.iter().any(|a| a.target_group_arn == entry.arn) {
                continue;
            }
            assignments.push(TargetGroupAssignment {
                target_group_arn: entry.arn,
                pod_ip: snapshot.ip_address.clone(),
            });
        }

        Ok(assignments)
    }
}

impl Default for AnnotationDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_ANNOTATION_KEY)
    }
}

/// Group assignments by target group ARN, deduplicating IPs
pub fn group_by_arn(assignments: &[TargetGroupAssignment]) -> BTreeMap<String, Vec<String>> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for assignment in assignments {
        let ips = groups.entry(assignment.target_group_arn.clone()).or_default();
        if !ips.contains(&assignment.pod_ip) {
            ips.push(assignment.pod_ip.clone());
        }
    }
    groups
}
