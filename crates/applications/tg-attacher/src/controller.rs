//! Event ingestion and the worker pool
//!
//! ```text
//! notifications ──ingest──► InstanceStore
//!                    │
//!                    └────► WorkQueue ──► worker × N ──► Reconciler ──► TargetGroupClient
//!                                                                          ▲
//!                                  DriftCorrector (optional, periodic) ────┘
//! ```
//!
//! Everything stops on one [`CancellationToken`]. Cancelling shuts the queue
//! down; workers finish the item in hand, drain what is ready, and exit.
//! When the notification stream ends, [`run`] first waits for queued work
//! and pending retries to settle, then cancels.

use crate::annotation::AnnotationDecoder;
use crate::backend::TargetGroupBackend;
use crate::client::TargetGroupClient;
use crate::config::AttacherConfig;
use crate::drift::DriftCorrector;
use crate::error::Result;
use crate::instance::{EventKind, InstanceEvent, InstanceNotification, InstanceStore};
use crate::queue::{QueueItem, WorkQueue};
use crate::reconcile::{Outcome, Reconciler};
use chrono::Utc;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What happened to a processed item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Reconciled (or deliberately skipped); failure history cleared
    Completed(Outcome),
    /// Failed and requeued with backoff
    Requeued {
        /// Requeues so far, including this one
        requeues: u32,
    },
    /// Failed with the retry budget spent; dropped
    Dropped {
        /// Requeues spent before giving up
        requeues: u32,
    },
}

/// Drains the work queue through the reconciler
pub struct Controller {
    queue: WorkQueue,
    store: InstanceStore,
    reconciler: Reconciler,
    max_retries: u32,
}

impl Controller {
    /// Create a controller
    pub fn new(queue: WorkQueue, store: InstanceStore, reconciler: Reconciler, max_retries: u32) -> Self {
        Self {
            queue,
            store,
            reconciler,
            max_retries,
        }
    }

    /// Queue this controller drains
    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Process one item
    ///
    /// Waits for work; returns `None` once the queue is shut down and drained.
    pub async fn process_next_item(&self) -> Option<Disposition> {
        let item = self.queue.get().await?;
        let disposition = self.process_item(&item).await;
        self.queue.done(&item);
        Some(disposition)
    }

    async fn process_item(&self, item: &QueueItem) -> Disposition {
        let key = item.key();

        match self.reconciler.reconcile(&item.event).await {
            Ok(outcome) => {
                debug!(key = %key, outcome = ?outcome, "Reconciled");
                self.queue.forget(item);
                Disposition::Completed(outcome)
            }
            Err(e) => {
                let requeues = self.queue.num_requeues(item);
                if requeues < self.max_retries {
                    warn!(key = %key, error = %e, attempt = requeues + 1, "Error processing (will retry)");
                    self.queue.add_rate_limited(item);
                    Disposition::Requeued {
                        requeues: requeues + 1,
                    }
                } else {
                    error!(key = %key, error = %e, requeues, "Error processing (giving up)");
                    self.queue.forget(item);
                    if item.event.kind == EventKind::Delete {
                        self.store.forget_tombstone(key).await;
                    }
                    Disposition::Dropped { requeues }
                }
            }
        }
    }

    /// Process items until the queue shuts down
    pub async fn run_worker(&self) {
        while self.process_next_item().await.is_some() {}
    }

    /// Run `workers` workers until `cancel` fires, then drain and return
    pub async fn run(self: Arc<Self>, workers: usize, cancel: CancellationToken) {
        let mut pool = JoinSet::new();
        for worker in 0..workers {
            let controller = Arc::clone(&self);
            pool.spawn(async move {
                debug!(worker, "Worker started");
                controller.run_worker().await;
                debug!(worker, "Worker stopped");
            });
        }

        cancel.cancelled().await;
        info!("Shutting down work queue");
        self.queue.shut_down();

        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task failed");
            }
        }
    }
}

/// Apply notifications to the store and enqueue their events
///
/// Returns the number of notifications ingested when the stream ends or
/// `cancel` fires.
pub async fn ingest<S>(
    notifications: S,
    store: InstanceStore,
    queue: WorkQueue,
    cancel: CancellationToken,
) -> usize
where
    S: Stream<Item = InstanceNotification>,
{
    futures::pin_mut!(notifications);
    let mut ingested = 0;

    loop {
        let notification = tokio::select! {
            _ = cancel.cancelled() => break,
            next = notifications.next() => match next {
                Some(notification) => notification,
                None => break,
            },
        };

        let key = notification.snapshot.key.clone();
        let kind = notification.kind;
        info!(key = %key, kind = ?kind, "Processing notification");

        match kind {
            EventKind::Create | EventKind::Update => store.apply(notification.snapshot).await,
            EventKind::Delete => store.remove(&key, Some(notification.snapshot)).await,
        }
        queue.add(InstanceEvent::new(key, kind));
        ingested += 1;
    }

    ingested
}

/// Drop expired delete tombstones every `ttl` until cancelled
///
/// Used when no drift corrector is running to do the pruning.
pub async fn prune_tombstones(store: InstanceStore, ttl: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + ttl, ttl);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let pruned = store.prune_tombstones(ttl).await;
                if pruned > 0 {
                    debug!(pruned, "Pruned expired tombstones");
                }
            }
        }
    }
}

/// Run the full pipeline until `cancel` fires, or until the notification
/// stream ends and the queue has gone idle
pub async fn run<S>(
    config: &AttacherConfig,
    backend: Arc<dyn TargetGroupBackend>,
    notifications: S,
    cancel: CancellationToken,
) -> Result<()>
where
    S: Stream<Item = InstanceNotification> + Send + 'static,
{
    config.validate()?;

    let store = InstanceStore::new();
    let queue = WorkQueue::with_backoff(config.backoff);
    let decoder = AnnotationDecoder::new(config.annotation_key.clone());
    let client = TargetGroupClient::with_timeout(backend, config.call_timeout);

    let mut reconciler = Reconciler::new(store.clone(), decoder.clone(), client.clone());
    if config.only_new_instances {
        reconciler = reconciler.with_only_new_instances(Utc::now());
    }
    let controller = Arc::new(Controller::new(
        queue.clone(),
        store.clone(),
        reconciler,
        config.max_retries,
    ));

    let mut tasks = JoinSet::new();

    {
        let (store, queue, cancel) = (store.clone(), queue.clone(), cancel.clone());
        tasks.spawn(async move {
            let ingested = ingest(notifications, store, queue.clone(), cancel.clone()).await;
            info!(ingested, "Notification source finished");
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = queue.wait_idle() => {
                    info!("Queued work settled, stopping");
                    cancel.cancel();
                }
            }
        });
    }

    match config.drift_interval {
        Some(interval) => {
            let corrector = DriftCorrector::new(store.clone(), decoder, client)
                .with_allowed_target_groups(config.drift_target_groups.clone())
                .with_tombstone_ttl(config.tombstone_ttl);
            let cancel = cancel.clone();
            tasks.spawn(async move { corrector.run(interval, cancel).await });
        }
        None => {
            tasks.spawn(prune_tombstones(store.clone(), config.tombstone_ttl, cancel.clone()));
        }
    }

    tasks.spawn(Arc::clone(&controller).run(config.workers, cancel.clone()));

    info!(workers = config.workers, "Attacher synced and ready");

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Attacher task failed");
            cancel.cancel();
        }
    }

    info!("Attacher stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::DEFAULT_ANNOTATION_KEY;
    use crate::config::DEFAULT_ENABLE_LABEL;
    use crate::error::BackendErrorCode;
    use crate::instance::InstanceSnapshot;
    use crate::queue::{DEFAULT_MAX_RETRIES, ExponentialBackoff};
    use crate::reconcile::SkipReason;
    use crate::testing::{Call, RecordingBackend};
    use std::time::Duration;

    const TG1: &str = r#"[{"Arn":"arn:tg:1","PortName":"http"}]"#;

    fn pod(key: &str, ip: &str, annotation: &str) -> InstanceSnapshot {
        InstanceSnapshot::new(key, ip)
            .with_annotation(DEFAULT_ANNOTATION_KEY, annotation)
            .with_label(DEFAULT_ENABLE_LABEL, "true")
    }

    fn controller(store: &InstanceStore, backend: &Arc<RecordingBackend>) -> Controller {
        let queue = WorkQueue::with_backoff(ExponentialBackoff::new(
            Duration::from_millis(1),
            Duration::from_millis(10),
        ));
        let reconciler = Reconciler::new(
            store.clone(),
            AnnotationDecoder::default(),
            TargetGroupClient::new(backend.clone()),
        );
        Controller::new(queue, store.clone(), reconciler, DEFAULT_MAX_RETRIES)
    }

    async fn next(controller: &Controller) -> Disposition {
        tokio::time::timeout(Duration::from_secs(2), controller.process_next_item())
            .await
            .expect("timed out waiting for work")
            .expect("queue shut down")
    }

    #[tokio::test]
    async fn test_burst_reconciles_once_with_latest_state() {
        let store = InstanceStore::new();
        let backend = RecordingBackend::new();
        let controller = controller(&store, &backend);

        store.apply(pod("default/pod-a", "", TG1)).await;
        controller.queue().add(InstanceEvent::new("default/pod-a", EventKind::Create));
        store.apply(pod("default/pod-a", "10.0.1.4", TG1)).await;
        controller.queue().add(InstanceEvent::new("default/pod-a", EventKind::Update));
        store.apply(pod("default/pod-a", "10.0.1.5", TG1)).await;
        controller.queue().add(InstanceEvent::new("default/pod-a", EventKind::Update));

        let disposition = next(&controller).await;

        assert_eq!(disposition, Disposition::Completed(Outcome::Registered { target_groups: 1 }));
        assert_eq!(
            backend.calls(),
            vec![Call::Register("arn:tg:1".to_string(), vec!["10.0.1.5".to_string()])]
        );
        assert!(controller.queue().is_empty());
    }

    #[tokio::test]
    async fn test_retry_exhaustion_drops_item() {
        let store = InstanceStore::new();
        let backend = RecordingBackend::new();
        backend.fail_with(BackendErrorCode::Throttling);
        let controller = controller(&store, &backend);

        store.apply(pod("default/pod-a", "10.0.1.5", TG1)).await;
        controller.queue().add(InstanceEvent::new("default/pod-a", EventKind::Create));

        for attempt in 1..=DEFAULT_MAX_RETRIES {
            assert_eq!(next(&controller).await, Disposition::Requeued { requeues: attempt });
        }
        assert_eq!(
            next(&controller).await,
            Disposition::Dropped {
                requeues: DEFAULT_MAX_RETRIES
            }
        );

        // 1 initial attempt + 5 retries, then nothing more
        assert_eq!(backend.register_calls().len(), 6);
        let more = tokio::time::timeout(Duration::from_millis(100), controller.process_next_item()).await;
        assert!(more.is_err());
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let store = InstanceStore::new();
        let backend = RecordingBackend::new();
        backend.fail_times(BackendErrorCode::Throttling, 2);
        let controller = controller(&store, &backend);

        store.apply(pod("default/pod-a", "10.0.1.5", TG1)).await;
        controller.queue().add(InstanceEvent::new("default/pod-a", EventKind::Create));

        assert_eq!(next(&controller).await, Disposition::Requeued { requeues: 1 });
        assert_eq!(next(&controller).await, Disposition::Requeued { requeues: 2 });
        assert_eq!(
            next(&controller).await,
            Disposition::Completed(Outcome::Registered { target_groups: 1 })
        );
        assert_eq!(backend.registered("arn:tg:1"), vec!["10.0.1.5"]);
    }

    #[tokio::test]
    async fn test_malformed_annotation_is_not_retried() {
        let store = InstanceStore::new();
        let backend = RecordingBackend::new();
        let controller = controller(&store, &backend);

        store.apply(pod("default/pod-a", "10.0.1.5", "[{broken")).await;
        let event = InstanceEvent::new("default/pod-a", EventKind::Create);
        controller.queue().add(event.clone());

        assert_eq!(
            next(&controller).await,
            Disposition::Completed(Outcome::Skipped(SkipReason::MalformedAnnotation))
        );

        let item = QueueItem { event, retry_count: 0 };
        assert_eq!(controller.queue().num_requeues(&item), 0);
        assert!(controller.queue().is_empty());
        let more = tokio::time::timeout(Duration::from_millis(50), controller.process_next_item()).await;
        assert!(more.is_err());
    }

    #[tokio::test]
    async fn test_ingest_applies_and_enqueues() {
        let store = InstanceStore::new();
        let queue = WorkQueue::new();
        let notifications = futures::stream::iter(vec![
            InstanceNotification {
                kind: EventKind::Create,
                snapshot: pod("default/pod-a", "10.0.1.5", TG1),
            },
            InstanceNotification {
                kind: EventKind::Delete,
                snapshot: pod("default/pod-b", "10.0.1.6", TG1),
            },
        ]);

        let ingested = ingest(notifications, store.clone(), queue.clone(), CancellationToken::new()).await;

        assert_eq!(ingested, 2);
        assert_eq!(queue.len(), 2);
        assert!(store.get("default/pod-a").await.is_some());
        assert_eq!(
            store.tombstone("default/pod-b").await.unwrap().ip_address,
            "10.0.1.6"
        );
    }

    #[tokio::test]
    async fn test_pipeline_create_then_delete() {
        let backend = RecordingBackend::new();
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let notifications = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|n| (n, rx))
        });
        let config = AttacherConfig::default()
            .with_workers(2)
            .with_backoff(ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(10)));
        let cancel = CancellationToken::new();

        let running = tokio::spawn({
            let backend: Arc<dyn TargetGroupBackend> = backend.clone();
            let cancel = cancel.clone();
            async move { run(&config, backend, notifications, cancel).await }
        });

        tx.send(InstanceNotification {
            kind: EventKind::Create,
            snapshot: pod("default/pod-a", "10.0.1.5", TG1),
        })
        .await
        .unwrap();
        wait_for(|| backend.registered("arn:tg:1") == vec!["10.0.1.5"]).await;

        tx.send(InstanceNotification {
            kind: EventKind::Delete,
            snapshot: pod("default/pod-a", "10.0.1.5", TG1),
        })
        .await
        .unwrap();
        wait_for(|| backend.registered("arn:tg:1").is_empty()).await;

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(
            backend.deregister_calls(),
            vec![Call::Deregister("arn:tg:1".to_string(), "10.0.1.5".to_string())]
        );
    }

    #[tokio::test]
    async fn test_run_rejects_invalid_config() {
        let backend = RecordingBackend::new();
        let config = AttacherConfig::default().with_workers(0);

        let result = run(
            &config,
            backend,
            futures::stream::empty::<InstanceNotification>(),
            CancellationToken::new(),
        )
        .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_pod_replaced_under_same_key() {
        let store = InstanceStore::new();
        let backend = RecordingBackend::new();
        let controller = controller(&store, &backend);
        let feed = |items: Vec<(EventKind, &'static str)>| {
            futures::stream::iter(items.into_iter().map(|(kind, ip)| InstanceNotification {
                kind,
                snapshot: pod("default/web-0", ip, TG1),
            }))
        };

        ingest(
            feed(vec![(EventKind::Create, "10.0.1.5")]),
            store.clone(),
            controller.queue().clone(),
            CancellationToken::new(),
        )
        .await;
        next(&controller).await;

        ingest(
            feed(vec![(EventKind::Delete, "10.0.1.5"), (EventKind::Create, "10.0.1.9")]),
            store.clone(),
            controller.queue().clone(),
            CancellationToken::new(),
        )
        .await;
        while !controller.queue().is_empty() {
            next(&controller).await;
        }

        assert_eq!(backend.registered("arn:tg:1"), vec!["10.0.1.9"]);
        assert_eq!(
            backend.deregister_calls(),
            vec![Call::Deregister("arn:tg:1".to_string(), "10.0.1.5".to_string())]
        );
    }

    fn fast_config() -> AttacherConfig {
        AttacherConfig::default().with_backoff(ExponentialBackoff::new(
            Duration::from_millis(1),
            Duration::from_millis(10),
        ))
    }

    #[tokio::test]
    async fn test_finite_feed_retries_before_stopping() {
        let backend = RecordingBackend::new();
        backend.fail_times(BackendErrorCode::Throttling, 1);
        let notifications = futures::stream::iter(vec![InstanceNotification {
            kind: EventKind::Create,
            snapshot: pod("default/pod-a", "10.0.1.5", TG1),
        }]);

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            run(&fast_config(), backend.clone(), notifications, CancellationToken::new()),
        )
        .await
        .expect("pipeline did not stop after the feed ended");

        assert!(result.is_ok());
        assert_eq!(backend.register_calls().len(), 2);
        assert_eq!(backend.registered("arn:tg:1"), vec!["10.0.1.5"]);
    }

    #[tokio::test]
    async fn test_finite_feed_exhausts_retries_before_stopping() {
        let backend = RecordingBackend::new();
        backend.fail_with(BackendErrorCode::Throttling);
        let notifications = futures::stream::iter(vec![InstanceNotification {
            kind: EventKind::Create,
            snapshot: pod("default/pod-a", "10.0.1.5", TG1),
        }]);

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            run(&fast_config(), backend.clone(), notifications, CancellationToken::new()),
        )
        .await
        .expect("pipeline did not stop after the feed ended");

        assert!(result.is_ok());
        assert_eq!(backend.register_calls().len(), 1 + DEFAULT_MAX_RETRIES as usize);
    }

    #[tokio::test]
    async fn test_prune_tombstones_without_drift() {
        let store = InstanceStore::new();
        store.apply(InstanceSnapshot::new("default/gone", "10.0.1.5")).await;
        store.remove("default/gone", None).await;
        let cancel = CancellationToken::new();

        let pruner = tokio::spawn(prune_tombstones(
            store.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        ));

        tokio::time::timeout(Duration::from_secs(2), async {
            while store.tombstone("default/gone").await.is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("tombstone was never pruned");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), pruner)
            .await
            .unwrap()
            .unwrap();
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }
}
