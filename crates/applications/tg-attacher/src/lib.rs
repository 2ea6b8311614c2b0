//! # tg-attacher
//!
//! Keeps load-balancer target groups in step with a fleet of instances.
//!
//! ## Architecture
//!
//! ```text
//! watch feed ─► InstanceStore ─► WorkQueue ─► Reconciler ─► TargetGroupClient ─► ELBv2
//!                                                 ▲                ▲
//!                                 AnnotationDecoder        DriftCorrector
//! ```
//!
//! Instances opt in with an enable label and name their target groups in a
//! JSON annotation. Create and update events register the instance IP with
//! every named target group; delete events deregister it using the last
//! known state.
//!
//! ## Delivery
//!
//! - Events for one key are collapsed while queued and never processed
//!   concurrently.
//! - Failures are retried per key with exponential backoff, up to a fixed
//!   budget, then dropped.
//! - Calls against one target group are serialized in-process.
//!
//! See [`controller`] for how the pieces are wired together.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod annotation;
pub mod backend;
pub mod client;
pub mod config;
pub mod controller;
pub mod drift;
pub mod elb;
pub mod error;
pub mod instance;
pub mod queue;
pub mod reconcile;
pub mod source;

#[cfg(test)]
mod testing;

// ============================================================================
// Public exports
// ============================================================================

// Error handling
pub use error::{AttacherError, BackendErrorCode, Result};

// Instance model
pub use instance::{EventKind, InstanceEvent, InstanceNotification, InstanceSnapshot, InstanceStore};

// Annotation decoding
pub use annotation::{AnnotationDecoder, TargetGroupAssignment, DEFAULT_ANNOTATION_KEY};

// Target groups
pub use backend::{TargetGroupBackend, TargetHealth, TargetState};
pub use client::TargetGroupClient;
pub use elb::ElbBackend;

// Reconciliation
pub use config::{AttacherConfig, DEFAULT_ENABLE_LABEL};
pub use controller::{Controller, Disposition};
pub use drift::{DriftCorrector, DriftReport};
pub use queue::{ExponentialBackoff, WorkQueue};
pub use reconcile::{Outcome, Reconciler, SkipReason};
pub use source::{ndjson_notifications, SelectionFilter};
