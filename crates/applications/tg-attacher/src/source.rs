//! Newline-delimited JSON notification source
//!
//! Adapts any line-oriented feed (a file, a pipe from a watch process) into
//! a stream of [`InstanceNotification`]s. One notification per line:
//!
//! ```json
//! {"kind":"update","snapshot":{"key":"default/web-1","ip_address":"10.0.1.5","labels":{"nlb-attacher.bird.co/enabled":"true"},"annotations":{"nlb-attacher.bird.co/target-groups":"[{\"Arn\":\"arn:...\",\"PortName\":\"http\"}]"},"creation_time":"2024-01-17T10:30:00Z"}}
//! ```
//!
//! Selection happens here: instances without the enable label (or outside
//! the configured namespace) never reach the core.

use crate::config::DEFAULT_ENABLE_LABEL;
use crate::instance::{InstanceNotification, InstanceSnapshot};
use std::pin::Pin;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

/// Decides which instances are observed at all
#[derive(Debug, Clone)]
pub struct SelectionFilter {
    enable_label: String,
    namespace: Option<String>,
}

impl SelectionFilter {
    /// Select instances carrying `enable_label=true`
    pub fn new(enable_label: impl Into<String>) -> Self {
        Self {
            enable_label: enable_label.into(),
            namespace: None,
        }
    }

    /// Additionally restrict to one namespace
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    /// Whether an instance is selected
    pub fn admits(&self, snapshot: &InstanceSnapshot) -> bool {
        let enabled = snapshot
            .labels
            .get(&self.enable_label)
            .is_some_and(|v| v == "true");
        let in_namespace = self
            .namespace
            .as_deref()
            .is_none_or(|ns| snapshot.namespace() == ns);
        enabled && in_namespace
    }
}

impl Default for SelectionFilter {
    fn default() -> Self {
        Self::new(DEFAULT_ENABLE_LABEL)
    }
}

/// Stream notifications from newline-delimited JSON
///
/// Unparseable lines are logged and skipped. The stream ends at EOF or on a
/// read error.
pub fn ndjson_notifications<R>(
    reader: R,
    filter: SelectionFilter,
) -> Pin<Box<dyn futures::Stream<Item = InstanceNotification> + Send>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut lines = reader.lines();
        let mut line_number = 0usize;
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read notification source");
                    break;
                }
            };
            line_number += 1;

            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<InstanceNotification>(&line) {
                Ok(notification) if filter.admits(&notification.snapshot) => yield notification,
                Ok(notification) => {
                    debug!(key = %notification.snapshot.key, "Instance not selected, ignoring");
                }
                Err(e) => {
                    warn!(line = line_number, error = %e, "Skipping malformed notification");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::EventKind;
    use futures::StreamExt;

    const ENABLED: &str = r#""labels":{"nlb-attacher.bird.co/enabled":"true"}"#;

    fn line(kind: &str, key: &str, labels: &str) -> String {
        format!(
            r#"{{"kind":"{kind}","snapshot":{{"key":"{key}","ip_address":"10.0.1.5",{labels},"creation_time":"2024-01-17T10:30:00Z"}}}}"#
        )
    }

    #[test]
    fn test_filter_admits() {
        let filter = SelectionFilter::default().with_namespace(Some("prod".to_string()));

        let selected = InstanceSnapshot::new("prod/web", "").with_label(DEFAULT_ENABLE_LABEL, "true");
        let disabled = InstanceSnapshot::new("prod/web", "").with_label(DEFAULT_ENABLE_LABEL, "false");
        let elsewhere = InstanceSnapshot::new("dev/web", "").with_label(DEFAULT_ENABLE_LABEL, "true");

        assert!(filter.admits(&selected));
        assert!(!filter.admits(&disabled));
        assert!(!filter.admits(&elsewhere));
        assert!(SelectionFilter::default().admits(&elsewhere));
    }

    #[tokio::test]
    async fn test_stream_parses_and_filters() {
        let input = [
            line("create", "default/pod-a", ENABLED),
            String::new(),
            "{not json".to_string(),
            line("update", "default/pod-b", r#""labels":{}"#),
            line("delete", "default/pod-a", ENABLED),
        ]
        .join("\n");
        let input: &'static [u8] = Box::leak(input.into_bytes().into_boxed_slice());

        let notifications: Vec<_> = ndjson_notifications(input, SelectionFilter::default())
            .collect()
            .await;

        assert_eq!(notifications.len(), 2);
        assert_eq!(notifications[0].kind, EventKind::Create);
        assert_eq!(notifications[1].kind, EventKind::Delete);
        assert_eq!(notifications[1].snapshot.key, "default/pod-a");
    }
}
