//! Result router
//!
//! Single authority for result acceptance. Validates the submitting
//! collector's ownership, deduplicates on the `(task_id, source_id,
//! entry_id)` triple, stores accepted records and fans them out to client
//! subscriptions through bounded ring buffers. Also owns the completion
//! sweep that closes tasks whose window has ended.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};

use crate::models::{ResultRecord, SubmitRequest, TaskId};

use super::registry::CollectorRegistry;
use super::store::{TaskStatus, TaskStore};

// ============================================================================
// Errors
// ============================================================================

/// Result submission errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// Token does not map to a live collector session
    InvalidToken,

    /// No task with that id
    UnknownTask(TaskId),

    /// Task finished or its window closed
    TaskClosed(TaskId),

    /// Submitting collector does not own the task
    NotAssigned(TaskId),
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidToken => write!(f, "Invalid collector token"),
            Self::UnknownTask(id) => write!(f, "Unknown task: {id}"),
            Self::TaskClosed(id) => write!(f, "Task is closed: {id}"),
            Self::NotAssigned(id) => write!(f, "Task is not assigned to this collector: {id}"),
        }
    }
}

impl std::error::Error for SubmitError {}

// ============================================================================
// Subscriptions
// ============================================================================

/// Shared state behind one client subscription.
struct SubState {
    queue: Mutex<VecQueue>,
    notify: Notify,
    closed: AtomicBool,
}

struct VecQueue {
    items: std::collections::VecDeque<ResultRecord>,
    capacity: usize,
    dropped: u64,
}

/// Consumer handle for one result stream.
///
/// `next()` yields records in arrival order and returns `None` once the task
/// completed and the buffer is drained.
pub struct SubscriptionHandle {
    state: Arc<SubState>,
}

impl SubscriptionHandle {
    /// Next record, waiting if the buffer is empty and the task is open.
    ///
    /// There is one consumer per handle, so the producer side signals with
    /// `notify_one`; its stored permit means a notification between the
    /// queue check and the await is not lost.
    pub async fn next(&mut self) -> Option<ResultRecord> {
        loop {
            {
                let mut queue = self.state.queue.lock().await;
                if let Some(record) = queue.items.pop_front() {
                    return Some(record);
                }
            }
            if self.state.closed.load(Ordering::Acquire) {
                return None;
            }
            self.state.notify.notified().await;
        }
    }

    /// Records dropped from this buffer because the consumer fell behind.
    pub async fn dropped(&self) -> u64 {
        self.state.queue.lock().await.dropped
    }
}

// ============================================================================
// Outcome
// ============================================================================

/// What happened to a submitted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Stored and forwarded
    Accepted,

    /// Known triple; acknowledged, not re-forwarded
    Duplicate,
}

/// Router counters for the stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RouterStats {
    pub records_accepted: u64,
    pub duplicates_ignored: u64,
    pub records_dropped_slow_consumer: u64,
    pub tasks_completed: u64,
}

// ============================================================================
// Router
// ============================================================================

#[derive(Default)]
struct TaskChannel {
    /// `(source_id, entry_id)` pairs seen for this task, forever
    seen: HashSet<(String, String)>,

    /// Accepted records, in arrival order
    records: Vec<ResultRecord>,

    subscribers: Vec<Arc<SubState>>,
}

/// Result acceptance, dedup and fan-out.
pub struct ResultRouter {
    registry: Arc<CollectorRegistry>,
    store: Arc<TaskStore>,
    channels: RwLock<HashMap<TaskId, TaskChannel>>,
    subscriber_capacity: usize,
    accepted: AtomicU64,
    duplicates: AtomicU64,
    dropped: AtomicU64,
    completed: AtomicU64,
}

impl ResultRouter {
    pub fn new(
        registry: Arc<CollectorRegistry>,
        store: Arc<TaskStore>,
        subscriber_capacity: usize,
    ) -> Self {
        Self {
            registry,
            store,
            channels: RwLock::new(HashMap::new()),
            subscriber_capacity: subscriber_capacity.max(1),
            accepted: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    /// Validate and ingest one submitted record.
    ///
    /// Duplicates are acknowledged as success so the collector marks the
    /// entry handled and stops retrying it.
    pub async fn submit(
        &self,
        request: SubmitRequest,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome, SubmitError> {
        let collector = self
            .registry
            .resolve_token(&request.token)
            .await
            .map_err(|_| SubmitError::InvalidToken)?;

        let task = self
            .store
            .get(&request.task_id)
            .await
            .map_err(|_| SubmitError::UnknownTask(request.task_id.clone()))?;

        if task.status.is_terminal() {
            return Err(SubmitError::TaskClosed(task.id));
        }
        if task.assigned_collector != Some(collector) {
            return Err(SubmitError::NotAssigned(task.id));
        }
        if task.window().is_closed(now) {
            return Err(SubmitError::TaskClosed(task.id));
        }

        // First result can arrive before the delivery ack raced through
        if task.status == TaskStatus::Assigned {
            let _ = self
                .store
                .set_status(&task.id, TaskStatus::Running, Some(collector), now)
                .await;
        }

        let record = ResultRecord {
            task_id: request.task_id.clone(),
            source_id: request.source_id.clone(),
            entry_id: request.entry_id.clone(),
            payload: request.payload,
            observed_at: request.timestamp,
        };

        let mut channels = self.channels.write().await;
        let channel = channels.entry(request.task_id.clone()).or_default();

        let key = (request.source_id, request.entry_id);
        if !channel.seen.insert(key) {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            return Ok(SubmitOutcome::Duplicate);
        }

        channel.records.push(record.clone());
        for sub in &channel.subscribers {
            self.push_to_subscriber(sub, record.clone()).await;
        }
        drop(channels);

        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.registry.record_result_submitted(collector).await;
        Ok(SubmitOutcome::Accepted)
    }

    /// Enqueue for one subscriber, dropping the oldest buffered record if
    /// the consumer fell behind.
    async fn push_to_subscriber(&self, sub: &Arc<SubState>, record: ResultRecord) {
        let mut queue = sub.queue.lock().await;
        if queue.items.len() >= queue.capacity {
            queue.items.pop_front();
            queue.dropped += 1;
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(task = %record.task_id, "Slow result consumer; dropped oldest record");
        }
        queue.items.push_back(record);
        drop(queue);
        sub.notify.notify_one();
    }

    /// Open a result stream for a task.
    ///
    /// The stream starts at subscription time; earlier records are available
    /// via [`records`](Self::records). Subscribing to a finished task yields
    /// an immediately-ended stream.
    ///
    /// The status check and the subscriber insertion happen under the
    /// channels lock: the completion sweep needs that lock to close
    /// subscribers, so it cannot finish the task between the two and strand
    /// a never-notified handle.
    pub async fn subscribe(&self, task_id: &str) -> Result<SubscriptionHandle, SubmitError> {
        let mut channels = self.channels.write().await;

        let task = self
            .store
            .get(task_id)
            .await
            .map_err(|_| SubmitError::UnknownTask(task_id.to_string()))?;

        let state = Arc::new(SubState {
            queue: Mutex::new(VecQueue {
                items: std::collections::VecDeque::new(),
                capacity: self.subscriber_capacity,
                dropped: 0,
            }),
            notify: Notify::new(),
            closed: AtomicBool::new(task.status.is_terminal()),
        });

        if !task.status.is_terminal() {
            channels
                .entry(task_id.to_string())
                .or_default()
                .subscribers
                .push(state.clone());
        }

        Ok(SubscriptionHandle { state })
    }

    /// Accepted records so far, in arrival order.
    pub async fn records(&self, task_id: &str) -> Vec<ResultRecord> {
        self.channels
            .read()
            .await
            .get(task_id)
            .map(|c| c.records.clone())
            .unwrap_or_default()
    }

    /// Completion sweep: every live task whose window has ended becomes
    /// Completed exactly once and its subscribers get end-of-stream.
    ///
    /// Streams of tasks the assignment engine failed (window expired before
    /// any collector took them) are ended here too.
    pub async fn complete_expired(&self, now: DateTime<Utc>) {
        for status in [TaskStatus::Assigned, TaskStatus::Running] {
            for task in self.store.list_by_status(status).await {
                if !task.window().is_closed(now) {
                    continue;
                }
                if self
                    .store
                    .set_status(&task.id, TaskStatus::Completed, None, now)
                    .await
                    .is_err()
                {
                    continue;
                }
                tracing::info!(task = %task.id, "Task window ended; completed");
                self.completed.fetch_add(1, Ordering::Relaxed);
                self.close_subscribers(&task.id).await;
            }
        }

        for task in self.store.list_by_status(TaskStatus::Failed).await {
            self.close_subscribers(&task.id).await;
        }
    }

    /// End every open stream for a task.
    async fn close_subscribers(&self, task_id: &str) {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get_mut(task_id) {
            for sub in channel.subscribers.drain(..) {
                sub.closed.store(true, Ordering::Release);
                sub.notify.notify_one();
            }
        }
    }

    /// Current counters.
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            records_accepted: self.accepted.load(Ordering::Relaxed),
            duplicates_ignored: self.duplicates.load(Ordering::Relaxed),
            records_dropped_slow_consumer: self.dropped.load(Ordering::Relaxed),
            tasks_completed: self.completed.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::store::NewTask;
    use crate::models::CollectorId;
    use chrono::TimeZone;
    use std::time::Duration as StdDuration;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    struct Fixture {
        registry: Arc<CollectorRegistry>,
        store: Arc<TaskStore>,
        router: ResultRouter,
    }

    fn fixture(capacity: usize) -> Fixture {
        let (registry, _events) = CollectorRegistry::new(StdDuration::from_secs(60));
        let registry = Arc::new(registry);
        let store = Arc::new(TaskStore::new());
        let router = ResultRouter::new(registry.clone(), store.clone(), capacity);
        Fixture {
            registry,
            store,
            router,
        }
    }

    async fn running_task(fx: &Fixture, name: &str) -> (TaskId, CollectorId, String) {
        let id = fx
            .registry
            .register(name, "s", &[], &[], ts(0))
            .await
            .unwrap();
        let token = fx.registry.login(name, "s", ts(0)).await.unwrap();

        let task_id = fx
            .store
            .create(
                NewTask {
                    owner: "alice".to_string(),
                    keywords: "quake".to_string(),
                    category: String::new(),
                    location: String::new(),
                    start_time: ts(10),
                    end_time: ts(100),
                    sources: Vec::new(),
                },
                ts(0),
            )
            .await
            .unwrap();
        fx.store
            .set_status(&task_id, TaskStatus::Assigned, Some(id), ts(1))
            .await
            .unwrap();
        fx.store
            .set_status(&task_id, TaskStatus::Running, Some(id), ts(2))
            .await
            .unwrap();

        (task_id, id, token)
    }

    fn submit(token: &str, task_id: &str, source: &str, entry: &str, at: i64) -> SubmitRequest {
        SubmitRequest {
            token: token.to_string(),
            task_id: task_id.to_string(),
            source_id: source.to_string(),
            entry_id: entry.to_string(),
            payload: serde_json::json!({"title": entry}),
            timestamp: ts(at),
        }
    }

    #[tokio::test]
    async fn test_accept_then_duplicate() {
        let fx = fixture(16);
        let (task_id, _c, token) = running_task(&fx, "c1").await;

        let first = fx
            .router
            .submit(submit(&token, &task_id, "src", "e1", 20), ts(20))
            .await
            .unwrap();
        assert_eq!(first, SubmitOutcome::Accepted);

        let second = fx
            .router
            .submit(submit(&token, &task_id, "src", "e1", 21), ts(21))
            .await
            .unwrap();
        assert_eq!(second, SubmitOutcome::Duplicate);

        assert_eq!(fx.router.records(&task_id).await.len(), 1);
        let stats = fx.router.stats();
        assert_eq!(stats.records_accepted, 1);
        assert_eq!(stats.duplicates_ignored, 1);
    }

    #[tokio::test]
    async fn test_invalid_token_rejected() {
        let fx = fixture(16);
        let (task_id, _c, _token) = running_task(&fx, "c1").await;

        let result = fx
            .router
            .submit(submit("bogus", &task_id, "src", "e1", 20), ts(20))
            .await;
        assert_eq!(result, Err(SubmitError::InvalidToken));
    }

    #[tokio::test]
    async fn test_unknown_task_rejected() {
        let fx = fixture(16);
        let (_task_id, _c, token) = running_task(&fx, "c1").await;

        let result = fx
            .router
            .submit(submit(&token, "nope", "src", "e1", 20), ts(20))
            .await;
        assert!(matches!(result, Err(SubmitError::UnknownTask(_))));
    }

    #[tokio::test]
    async fn test_non_owner_rejected() {
        let fx = fixture(16);
        let (task_id, _c, _token) = running_task(&fx, "c1").await;

        fx.registry.register("c2", "s", &[], &[], ts(0)).await.unwrap();
        let other_token = fx.registry.login("c2", "s", ts(0)).await.unwrap();

        let result = fx
            .router
            .submit(submit(&other_token, &task_id, "src", "e1", 20), ts(20))
            .await;
        assert!(matches!(result, Err(SubmitError::NotAssigned(_))));
    }

    #[tokio::test]
    async fn test_closed_window_rejected() {
        let fx = fixture(16);
        let (task_id, _c, token) = running_task(&fx, "c1").await;

        let result = fx
            .router
            .submit(submit(&token, &task_id, "src", "e1", 100), ts(100))
            .await;
        assert!(matches!(result, Err(SubmitError::TaskClosed(_))));
    }

    #[tokio::test]
    async fn test_fan_out_to_multiple_subscribers() {
        let fx = fixture(16);
        let (task_id, _c, token) = running_task(&fx, "c1").await;

        let mut sub_a = fx.router.subscribe(&task_id).await.unwrap();
        let mut sub_b = fx.router.subscribe(&task_id).await.unwrap();

        fx.router
            .submit(submit(&token, &task_id, "src", "e1", 20), ts(20))
            .await
            .unwrap();

        assert_eq!(sub_a.next().await.unwrap().entry_id, "e1");
        assert_eq!(sub_b.next().await.unwrap().entry_id, "e1");
    }

    #[tokio::test]
    async fn test_duplicate_not_forwarded() {
        let fx = fixture(16);
        let (task_id, _c, token) = running_task(&fx, "c1").await;
        let mut sub = fx.router.subscribe(&task_id).await.unwrap();

        fx.router
            .submit(submit(&token, &task_id, "src", "e1", 20), ts(20))
            .await
            .unwrap();
        fx.router
            .submit(submit(&token, &task_id, "src", "e1", 21), ts(21))
            .await
            .unwrap();
        fx.router
            .submit(submit(&token, &task_id, "src", "e2", 22), ts(22))
            .await
            .unwrap();

        assert_eq!(sub.next().await.unwrap().entry_id, "e1");
        assert_eq!(sub.next().await.unwrap().entry_id, "e2");
    }

    #[tokio::test]
    async fn test_slow_consumer_drops_oldest() {
        let fx = fixture(2);
        let (task_id, _c, token) = running_task(&fx, "c1").await;
        let mut sub = fx.router.subscribe(&task_id).await.unwrap();

        for i in 0..4 {
            fx.router
                .submit(submit(&token, &task_id, "src", &format!("e{i}"), 20 + i), ts(20 + i))
                .await
                .unwrap();
        }

        // Oldest two were pushed out; stream resumes from e2
        assert_eq!(sub.next().await.unwrap().entry_id, "e2");
        assert_eq!(sub.next().await.unwrap().entry_id, "e3");
        assert_eq!(sub.dropped().await, 2);
        assert_eq!(fx.router.stats().records_dropped_slow_consumer, 2);

        // All four records were still accepted and retained
        assert_eq!(fx.router.records(&task_id).await.len(), 4);
    }

    #[tokio::test]
    async fn test_completion_closes_streams_exactly_once() {
        let fx = fixture(16);
        let (task_id, _c, token) = running_task(&fx, "c1").await;
        let mut sub = fx.router.subscribe(&task_id).await.unwrap();

        fx.router
            .submit(submit(&token, &task_id, "src", "e1", 20), ts(20))
            .await
            .unwrap();

        fx.router.complete_expired(ts(100)).await;
        assert_eq!(
            fx.store.get(&task_id).await.unwrap().status,
            TaskStatus::Completed
        );

        // Buffered record still delivered, then end-of-stream
        assert_eq!(sub.next().await.unwrap().entry_id, "e1");
        assert!(sub.next().await.is_none());

        // Second sweep is a no-op
        fx.router.complete_expired(ts(200)).await;
        assert_eq!(fx.router.stats().tasks_completed, 1);
    }

    #[tokio::test]
    async fn test_completion_ignores_open_windows() {
        let fx = fixture(16);
        let (task_id, _c, _token) = running_task(&fx, "c1").await;

        fx.router.complete_expired(ts(50)).await;
        assert_eq!(
            fx.store.get(&task_id).await.unwrap().status,
            TaskStatus::Running
        );
    }

    #[tokio::test]
    async fn test_failed_task_stream_is_closed() {
        let fx = fixture(16);
        let task_id = fx
            .store
            .create(
                NewTask {
                    owner: "alice".to_string(),
                    keywords: "quake".to_string(),
                    category: String::new(),
                    location: String::new(),
                    start_time: ts(10),
                    end_time: ts(100),
                    sources: Vec::new(),
                },
                ts(0),
            )
            .await
            .unwrap();
        let mut sub = fx.router.subscribe(&task_id).await.unwrap();

        // Window expired before any collector took the task
        fx.store
            .set_status(&task_id, TaskStatus::Failed, None, ts(100))
            .await
            .unwrap();
        fx.router.complete_expired(ts(100)).await;

        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_racing_completion_never_hangs() {
        for _ in 0..50 {
            let fx = fixture(16);
            let (task_id, _c, _token) = running_task(&fx, "c1").await;

            let (_, sub) = tokio::join!(
                fx.router.complete_expired(ts(100)),
                fx.router.subscribe(&task_id),
            );

            let mut sub = sub.unwrap();
            let next = tokio::time::timeout(StdDuration::from_secs(1), sub.next())
                .await
                .expect("stream for a completed task must terminate");
            assert!(next.is_none());
        }
    }

    #[tokio::test]
    async fn test_subscribe_to_finished_task_ends_immediately() {
        let fx = fixture(16);
        let (task_id, _c, _token) = running_task(&fx, "c1").await;
        fx.router.complete_expired(ts(100)).await;

        let mut sub = fx.router.subscribe(&task_id).await.unwrap();
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_submit_to_terminal_task_rejected() {
        let fx = fixture(16);
        let (task_id, _c, token) = running_task(&fx, "c1").await;
        fx.router.complete_expired(ts(100)).await;

        let result = fx
            .router
            .submit(submit(&token, &task_id, "src", "e9", 99), ts(99))
            .await;
        assert!(matches!(result, Err(SubmitError::TaskClosed(_))));
    }

    #[tokio::test]
    async fn test_dedup_survives_reassignment() {
        let fx = fixture(16);
        let (task_id, _c1, token1) = running_task(&fx, "c1").await;

        fx.router
            .submit(submit(&token1, &task_id, "src", "e1", 20), ts(20))
            .await
            .unwrap();

        // Failover: rebind the task to a second collector
        let c2 = fx.registry.register("c2", "s", &[], &[], ts(0)).await.unwrap();
        let token2 = fx.registry.login("c2", "s", ts(0)).await.unwrap();
        fx.store
            .set_status(&task_id, TaskStatus::Pending, None, ts(30))
            .await
            .unwrap();
        fx.store
            .set_status(&task_id, TaskStatus::Assigned, Some(c2), ts(31))
            .await
            .unwrap();

        // Old owner is refused
        let stale = fx
            .router
            .submit(submit(&token1, &task_id, "src", "e2", 32), ts(32))
            .await;
        assert!(matches!(stale, Err(SubmitError::NotAssigned(_))));

        // New owner re-observing e1 gets a duplicate ack, not a double record
        let replay = fx
            .router
            .submit(submit(&token2, &task_id, "src", "e1", 33), ts(33))
            .await
            .unwrap();
        assert_eq!(replay, SubmitOutcome::Duplicate);
        assert_eq!(fx.router.records(&task_id).await.len(), 1);
    }
}
