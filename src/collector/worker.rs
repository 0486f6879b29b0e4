//! Per-assignment task worker
//!
//! One worker per delivered assignment. It waits for the task window to
//! open, then polls each source at the refresh period until the window
//! closes or the dispatcher tells it to stop. Entries are tracked in a
//! local seen set so a healthy run submits each entry once; a failed
//! submit leaves the entry unmarked and the next cycle retries it. The
//! dispatcher's dedup index remains the authority, so the local set being
//! lost (restart, failover) can only cause duplicate acks, never duplicate
//! records.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::models::TaskAssignment;

use super::client::DispatcherClient;
use super::sources::FeedPoller;

/// Sleep bound: long waits are chopped so cancellation and clock changes
/// are observed promptly.
const MAX_SLEEP: Duration = Duration::from_secs(30);

// ============================================================================
// Handle
// ============================================================================

/// Control handle for a spawned worker.
pub struct WorkerHandle {
    cancel: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Ask the worker to stop at the next opportunity.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Whether the worker has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancel and wait for the worker to exit.
    pub async fn shutdown(self) {
        let _ = self.cancel.send(true);
        let _ = self.join.await;
    }
}

// ============================================================================
// Worker
// ============================================================================

/// State for one running assignment.
pub struct TaskWorker {
    assignment: TaskAssignment,
    client: Arc<DispatcherClient>,
    poller: Arc<FeedPoller>,
    refresh: Duration,

    /// source_id -> entry ids already acked by the dispatcher
    seen: HashMap<String, HashSet<String>>,

    cancelled: watch::Receiver<bool>,
}

impl TaskWorker {
    /// Spawn a worker for a delivered assignment.
    pub fn spawn(
        assignment: TaskAssignment,
        client: Arc<DispatcherClient>,
        poller: Arc<FeedPoller>,
        refresh: Duration,
    ) -> WorkerHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let worker = Self {
            assignment,
            client,
            poller,
            refresh,
            seen: HashMap::new(),
            cancelled: cancel_rx,
        };

        let join = tokio::spawn(worker.run());
        WorkerHandle {
            cancel: cancel_tx,
            join,
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Sleep for `duration` (bounded), returning false if cancelled.
    async fn sleep_or_cancel(&mut self, duration: Duration) -> bool {
        let duration = duration.min(MAX_SLEEP);
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancelled.changed() => false,
        }
    }

    async fn run(mut self) {
        let task_id = self.assignment.task_id.clone();
        let window = self.assignment.window();
        tracing::info!(
            task = %task_id,
            sources = self.assignment.sources.len(),
            start = %window.start,
            end = %window.end,
            "Worker started"
        );

        // Wait for the window to open, re-checking the clock each chunk
        while window.is_before(Utc::now()) {
            let remaining = (window.start - Utc::now())
                .to_std()
                .unwrap_or(Duration::from_millis(100))
                .max(Duration::from_millis(100));
            if !self.sleep_or_cancel(remaining).await {
                tracing::info!(task = %task_id, "Worker cancelled before window opened");
                return;
            }
        }

        // Collection loop
        while !window.is_closed(Utc::now()) && !self.is_cancelled() {
            if !self.collect_cycle().await {
                break;
            }

            let remaining = (window.end - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                break;
            }
            if !self.sleep_or_cancel(self.refresh.min(remaining)).await {
                break;
            }
        }

        tracing::info!(task = %task_id, "Worker finished");
    }

    /// Poll every source once and submit unseen matching entries.
    ///
    /// Returns false when the dispatcher signalled the task is over.
    async fn collect_cycle(&mut self) -> bool {
        let sources = self.assignment.sources.clone();
        for source in &sources {
            if self.is_cancelled() {
                return false;
            }

            let entries = match self.poller.poll(source).await {
                Ok(entries) => entries,
                Err(e) => {
                    // One bad source poll never kills the task
                    tracing::warn!(
                        task = %self.assignment.task_id,
                        source = %source.id,
                        error = %e,
                        "Source poll failed; skipping this cycle"
                    );
                    continue;
                }
            };

            for entry in entries {
                if self.is_cancelled() {
                    return false;
                }
                if !entry.matches_keywords(&self.assignment.keywords) {
                    continue;
                }

                let seen = self.seen.entry(source.id.clone()).or_default();
                if seen.contains(&entry.id) {
                    continue;
                }

                let ack = self
                    .client
                    .submit_result(
                        &self.assignment.task_id,
                        &source.id,
                        &entry.id,
                        entry.payload(source),
                        Utc::now(),
                    )
                    .await;

                match ack {
                    Ok(ack) if ack.status.is_settled() => {
                        seen.insert(entry.id);
                    }
                    Ok(ack) if ack.status.is_terminal() => {
                        tracing::info!(
                            task = %self.assignment.task_id,
                            status = ?ack.status,
                            "Dispatcher closed the task; stopping worker"
                        );
                        return false;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // Entry stays unmarked; retried next cycle
                        tracing::warn!(
                            task = %self.assignment.task_id,
                            source = %source.id,
                            entry = %entry.id,
                            error = %e,
                            "Submit failed; will retry"
                        );
                    }
                }
            }
        }
        true
    }
}

// ============================================================================
// Tests
// ============================================================================
