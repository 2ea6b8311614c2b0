//! Deduplicating, rate-limited work queue
//!
//! Events are keyed by instance key. The queue guarantees:
//!
//! - A key is handed to at most one worker at a time. Events that arrive
//!   while the key is being processed are parked and the key is requeued
//!   when the worker calls [`WorkQueue::done`].
//! - Events for a key that is already pending coalesce; the newest event
//!   (by `observed_at`) wins.
//! - Failed items are re-added after a per-key exponential backoff. The
//!   failure history is cleared with [`WorkQueue::forget`].
//! - [`WorkQueue::wait_idle`] resolves once nothing is ready, in flight or
//!   waiting out a backoff.
//!
//! ```text
//! add ──► pending ──► ready ──get──► processing ──done──┐
//!            ▲                            │             │
//!            └──── add_rate_limited ◄─────┘   (requeue if pending)
//! ```

use crate::instance::InstanceEvent;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error};

/// Default retry budget per item
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default base delay for per-key backoff
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(5);

/// Default cap for per-key backoff
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(1000);

/// Per-key exponential backoff: `base * 2^failures`, capped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    /// Delay after the first failure
    pub base: Duration,

    /// Maximum delay
    pub cap: Duration,
}

impl ExponentialBackoff {
    /// Create a backoff policy
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay for an item that has already failed `failures` times
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP)
    }
}

/// An event handed to a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    /// The event to reconcile
    pub event: InstanceEvent,

    /// How many times this key has been requeued after failure
    pub retry_count: u32,
}

impl QueueItem {
    /// Instance key of the item
    pub fn key(&self) -> &str {
        &self.event.key
    }
}

#[derive(Debug, Default)]
struct QueueState {
    /// Keys ready to be handed out, in order
    ready: VecDeque<String>,

    /// Latest event per key waiting to be processed
    pending: HashMap<String, InstanceEvent>,

    /// Keys currently held by a worker
    processing: HashSet<String>,

    /// Failure count per key
    failures: HashMap<String, u32>,

    /// Retries waiting out their backoff
    delayed: usize,

    shutting_down: bool,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.ready.is_empty()
            && self.pending.is_empty()
            && self.processing.is_empty()
            && self.delayed == 0
    }

    /// Park or enqueue an event; true when a key became ready
    fn insert(&mut self, event: InstanceEvent) -> bool {
        let key = event.key.clone();
        if let Some(existing) = self.pending.get_mut(&key) {
            if event.observed_at >= existing.observed_at {
                *existing = event;
            }
            return false;
        }

        self.pending.insert(key.clone(), event);
        if self.processing.contains(&key) {
            // Requeued by `done`
            return false;
        }

        self.ready.push_back(key);
        true
    }
}

#[derive(Debug)]
struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
    idle: Notify,
    backoff: ExponentialBackoff,
}

/// Cloneable handle to a shared work queue
#[derive(Debug, Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    /// Create a queue with default backoff
    pub fn new() -> Self {
        Self::with_backoff(ExponentialBackoff::default())
    }

    /// Create a queue with a custom backoff policy
    pub fn with_backoff(backoff: ExponentialBackoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                idle: Notify::new(),
                backoff,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        // State stays consistent across a panicking holder; every mutation
        // is a single map/set operation.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add an event
    ///
    /// Ignored after shutdown. An event older than the one already pending
    /// for the same key is dropped.
    pub fn add(&self, event: InstanceEvent) {
        let mut state = self.state();
        if state.shutting_down {
            debug!(key = %event.key, "Queue shutting down, dropping event");
            return;
        }

        if state.insert(event) {
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Wait for the next item
    ///
    /// Returns `None` once the queue has been shut down and every ready item
    /// has been handed out.
    pub async fn get(&self) -> Option<QueueItem> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                while let Some(key) = state.ready.pop_front() {
                    let Some(event) = state.pending.remove(&key) else {
                        continue;
                    };
                    state.processing.insert(key.clone());
                    let retry_count = state.failures.get(&key).copied().unwrap_or(0);
                    return Some(QueueItem { event, retry_count });
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark a key as no longer being processed
    ///
    /// If events arrived for the key while it was processed, it goes back on
    /// the ready queue.
    pub fn done(&self, item: &QueueItem) {
        let mut state = self.state();
        state.processing.remove(item.key());
        if state.pending.contains_key(item.key()) {
            state.ready.push_back(item.key().to_string());
            drop(state);
            self.inner.notify.notify_one();
        } else if state.is_idle() {
            drop(state);
            self.inner.idle.notify_waiters();
        }
    }

    /// Clear the failure history of a key
    pub fn forget(&self, item: &QueueItem) {
        self.state().failures.remove(item.key());
    }

    /// Number of times a key has been requeued after failure
    pub fn num_requeues(&self, item: &QueueItem) -> u32 {
        self.state().failures.get(item.key()).copied().unwrap_or(0)
    }

    /// Re-add an item after its backoff delay
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_rate_limited(&self, item: &QueueItem) {
        let delay = {
            let mut state = self.state();
            if state.shutting_down {
                error!(key = %item.key(), "Queue shutting down, dropping retry");
                return;
            }
            let failures = state.failures.entry(item.key().to_string()).or_insert(0);
            let delay = self.inner.backoff.delay(*failures);
            *failures += 1;
            state.delayed += 1;
            delay
        };

        debug!(key = %item.key(), delay_ms = delay.as_millis() as u64, "Requeueing with backoff");

        let queue = self.clone();
        let event = item.event.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.requeue(event);
        });
    }

    fn requeue(&self, event: InstanceEvent) {
        let mut state = self.state();
        state.delayed = state.delayed.saturating_sub(1);
        if state.shutting_down {
            error!(key = %event.key, "Queue shut down during backoff, dropping retry");
            return;
        }
        if state.insert(event) {
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Wait until no work is ready, in flight or scheduled for retry
    ///
    /// Also returns once the queue is shut down.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state();
                if state.shutting_down || state.is_idle() {
                    return;
                }
            }

            notified.await;
        }
    }

    /// Stop accepting events and release idle workers
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.inner.notify.notify_waiters();
        self.inner.idle.notify_waiters();
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.state().ready.len()
    }

    /// Whether no keys are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}
