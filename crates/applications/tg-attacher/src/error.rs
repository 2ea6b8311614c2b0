//! Error types for the attacher

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Attacher result type
pub type Result<T> = std::result::Result<T, AttacherError>;

/// Backend error codes the reconciliation path knows how to classify
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BackendErrorCode {
    /// Target group ARN does not exist (or not yet visible)
    TargetGroupNotFound,
    /// Target is not valid for the group (wrong VPC, not registered, ...)
    InvalidTarget,
    /// Target group is at its target limit
    TooManyTargets,
    /// Target is registered to too many groups
    TooManyRegistrations,
    /// Health information is temporarily unavailable
    HealthUnavailable,
    /// Request was throttled
    Throttling,
    /// Any other service code
    Other(String),
    /// No service code (timeout, dispatch or transport failure)
    Unclassified,
}

impl BackendErrorCode {
    /// Classify an ELBv2 service error code
    pub fn from_code(code: Option<&str>) -> Self {
        match code {
            Some("TargetGroupNotFound") => Self::TargetGroupNotFound,
            Some("InvalidTarget") => Self::InvalidTarget,
            Some("TooManyTargets") => Self::TooManyTargets,
            Some("TooManyRegistrationsForTargetId") => Self::TooManyRegistrations,
            Some("HealthUnavailable") => Self::HealthUnavailable,
            Some("Throttling") | Some("ThrottlingException") => Self::Throttling,
            Some(other) => Self::Other(other.to_string()),
            None => Self::Unclassified,
        }
    }
}

impl fmt::Display for BackendErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TargetGroupNotFound => f.write_str("TargetGroupNotFound"),
            Self::InvalidTarget => f.write_str("InvalidTarget"),
            Self::TooManyTargets => f.write_str("TooManyTargets"),
            Self::TooManyRegistrations => f.write_str("TooManyRegistrationsForTargetId"),
            Self::HealthUnavailable => f.write_str("HealthUnavailable"),
            Self::Throttling => f.write_str("Throttling"),
            Self::Other(code) => f.write_str(code),
            Self::Unclassified => f.write_str("Unclassified"),
        }
    }
}

/// Errors that can occur in the attacher
#[derive(Error, Debug)]
pub enum AttacherError {
    /// Target-group backend call failed
    #[error("{operation} on {target_group_arn} failed ({code}): {message}")]
    Backend {
        /// Backend operation name, e.g. `RegisterTargets`
        operation: &'static str,
        /// Target group the call was made against
        target_group_arn: String,
        /// Classified error code
        code: BackendErrorCode,
        /// Message returned by the backend
        message: String,
    },

    /// Target-group annotation could not be decoded
    #[error("malformed annotation {key}: {source}")]
    Annotation {
        /// Annotation key that was read
        key: String,
        /// Underlying JSON error
        #[source]
        source: serde_json::Error,
    },

    /// Timeout
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AttacherError {
    /// Create a backend error
    pub fn backend(
        operation: &'static str,
        target_group_arn: impl Into<String>,
        code: BackendErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self::Backend {
            operation,
            target_group_arn: target_group_arn.into(),
            code,
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Backend code, if this is a backend error
    pub fn backend_code(&self) -> Option<&BackendErrorCode> {
        match self {
            Self::Backend { code, .. } => Some(code),
            _ => None,
        }
    }
}
