//! Task store
//!
//! Holds task records and enforces the lifecycle state machine:
//! `Pending -> Assigned -> Running -> {Completed, Failed}`, with
//! `Assigned/Running -> Pending` for failover. Illegal transitions are a
//! programming error and are rejected with a loud log rather than surfaced
//! to callers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::models::{new_task_id, CollectorId, SourceSpec, TaskId, TimeWindow};

// ============================================================================
// Status
// ============================================================================

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Awaiting an eligible collector
    Pending,

    /// Bound to a collector, assignment not yet delivered
    Assigned,

    /// Assignment delivered; collector is (or should be) working it
    Running,

    /// Window closed normally
    Completed,

    /// Window expired before any collector could take it
    Failed,
}

impl TaskStatus {
    /// Whether moving from `self` to `next` is a legal lifecycle step.
    pub fn can_transition(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Assigned)
                | (Pending, Failed)
                | (Assigned, Running)
                | (Assigned, Pending)
                | (Assigned, Completed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Pending)
        )
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Task store errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// start_time must precede end_time
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    /// No task with that id
    NotFound(TaskId),
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidWindow { start, end } => {
                write!(f, "Invalid task window: start {start} is not before end {end}")
            }
            Self::NotFound(id) => write!(f, "Task not found: {id}"),
        }
    }
}

impl std::error::Error for TaskError {}

// ============================================================================
// Records
// ============================================================================

/// Parameters for creating a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub owner: String,
    pub keywords: String,
    pub category: String,
    pub location: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,

    /// Catalog match resolved at creation time
    pub sources: Vec<SourceSpec>,
}

/// A task record (snapshot; the store owns the mutable state).
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub owner: String,
    pub keywords: String,
    pub category: String,
    pub location: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: TaskStatus,
    pub assigned_collector: Option<CollectorId>,
    pub sources: Vec<SourceSpec>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn window(&self) -> TimeWindow {
        TimeWindow {
            start: self.start_time,
            end: self.end_time,
        }
    }
}

/// Task counts for the stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub assigned: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

// ============================================================================
// Store
// ============================================================================

/// In-memory task table.
pub struct TaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Create a task in `Pending`, validating the window.
    pub async fn create(&self, spec: NewTask, now: DateTime<Utc>) -> Result<TaskId, TaskError> {
        if spec.start_time >= spec.end_time {
            return Err(TaskError::InvalidWindow {
                start: spec.start_time,
                end: spec.end_time,
            });
        }

        let id = new_task_id();
        let task = Task {
            id: id.clone(),
            owner: spec.owner,
            keywords: spec.keywords,
            category: spec.category,
            location: spec.location,
            start_time: spec.start_time,
            end_time: spec.end_time,
            status: TaskStatus::Pending,
            assigned_collector: None,
            sources: spec.sources,
            created_at: now,
            updated_at: now,
        };

        tracing::info!(task = %id, keywords = %task.keywords, "Created task");
        self.tasks.write().await.insert(id.clone(), task);
        Ok(id)
    }

    /// Snapshot of one task.
    pub async fn get(&self, id: &str) -> Result<Task, TaskError> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| TaskError::NotFound(id.to_string()))
    }

    /// Apply a lifecycle transition and update the collector binding.
    ///
    /// `assigned` replaces the binding wholesale: pass the new owner when
    /// assigning, `None` when resetting to Pending or finishing. An illegal
    /// transition is logged and dropped; the stored record is not touched.
    pub async fn set_status(
        &self,
        id: &str,
        status: TaskStatus,
        assigned: Option<CollectorId>,
        now: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;

        if task.status == status {
            return Ok(());
        }
        if !task.status.can_transition(status) {
            tracing::error!(
                task = %id,
                from = ?task.status,
                to = ?status,
                "Illegal task transition attempted"
            );
            debug_assert!(false, "illegal task transition {:?} -> {:?}", task.status, status);
            return Ok(());
        }

        tracing::debug!(task = %id, from = ?task.status, to = ?status, "Task transition");
        task.status = status;
        task.assigned_collector = assigned;
        task.updated_at = now;
        Ok(())
    }

    /// Snapshots of tasks in a given status, oldest first.
    pub async fn list_by_status(&self, status: TaskStatus) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let mut out: Vec<Task> = tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        out.sort_by_key(|t| t.created_at);
        out
    }

    /// Snapshots of tasks currently bound to a collector.
    pub async fn list_assigned_to(&self, collector: CollectorId) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let mut out: Vec<Task> = tasks
            .values()
            .filter(|t| t.assigned_collector == Some(collector) && !t.status.is_terminal())
            .cloned()
            .collect();
        out.sort_by_key(|t| t.created_at);
        out
    }

    /// Snapshots of a client's tasks, newest first.
    pub async fn list_by_owner(&self, owner: &str) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let mut out: Vec<Task> = tasks
            .values()
            .filter(|t| t.owner == owner)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    /// Number of live (Assigned or Running) tasks bound to a collector.
    pub async fn load_of(&self, collector: CollectorId) -> usize {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| {
                t.assigned_collector == Some(collector)
                    && matches!(t.status, TaskStatus::Assigned | TaskStatus::Running)
            })
            .count()
    }

    /// Counts by status.
    pub async fn stats(&self) -> TaskStats {
        let tasks = self.tasks.read().await;
        let mut stats = TaskStats {
            total: tasks.len(),
            ..Default::default()
        };
        for task in tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Assigned => stats.assigned += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn spec(start: i64, end: i64) -> NewTask {
        NewTask {
            owner: "alice".to_string(),
            keywords: "flood".to_string(),
            category: "disaster".to_string(),
            location: "asia".to_string(),
            start_time: ts(start),
            end_time: ts(end),
            sources: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_create_validates_window() {
        let store = TaskStore::new();

        assert!(store.create(spec(100, 200), ts(0)).await.is_ok());
        assert!(matches!(
            store.create(spec(200, 100), ts(0)).await,
            Err(TaskError::InvalidWindow { .. })
        ));
        assert!(matches!(
            store.create(spec(100, 100), ts(0)).await,
            Err(TaskError::InvalidWindow { .. })
        ));
    }

    #[tokio::test]
    async fn test_lifecycle_happy_path() {
        let store = TaskStore::new();
        let id = store.create(spec(100, 200), ts(0)).await.unwrap();
        let c = CollectorId(1);

        store.set_status(&id, TaskStatus::Assigned, Some(c), ts(1)).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap().assigned_collector, Some(c));

        store.set_status(&id, TaskStatus::Running, Some(c), ts(2)).await.unwrap();
        store.set_status(&id, TaskStatus::Completed, None, ts(200)).await.unwrap();

        let task = store.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.assigned_collector, None);
    }

    #[tokio::test]
    async fn test_failover_resets_to_pending() {
        let store = TaskStore::new();
        let id = store.create(spec(100, 200), ts(0)).await.unwrap();
        let c = CollectorId(1);

        store.set_status(&id, TaskStatus::Assigned, Some(c), ts(1)).await.unwrap();
        store.set_status(&id, TaskStatus::Running, Some(c), ts(2)).await.unwrap();
        store.set_status(&id, TaskStatus::Pending, None, ts(3)).await.unwrap();

        let task = store.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.assigned_collector, None);
    }

    #[tokio::test]
    #[cfg(not(debug_assertions))]
    async fn test_illegal_transition_is_dropped() {
        let store = TaskStore::new();
        let id = store.create(spec(100, 200), ts(0)).await.unwrap();

        // Pending -> Running skips Assigned
        store.set_status(&id, TaskStatus::Running, None, ts(1)).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_terminal_states_are_final() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Completed.can_transition(TaskStatus::Pending));
        assert!(!TaskStatus::Failed.can_transition(TaskStatus::Running));
    }

    #[tokio::test]
    async fn test_load_counts_live_bindings_only() {
        let store = TaskStore::new();
        let c = CollectorId(1);

        let a = store.create(spec(100, 200), ts(0)).await.unwrap();
        let b = store.create(spec(100, 200), ts(0)).await.unwrap();
        let done = store.create(spec(100, 200), ts(0)).await.unwrap();

        store.set_status(&a, TaskStatus::Assigned, Some(c), ts(1)).await.unwrap();
        store.set_status(&b, TaskStatus::Assigned, Some(c), ts(1)).await.unwrap();
        store.set_status(&b, TaskStatus::Running, Some(c), ts(2)).await.unwrap();
        store.set_status(&done, TaskStatus::Assigned, Some(c), ts(1)).await.unwrap();
        store.set_status(&done, TaskStatus::Completed, None, ts(3)).await.unwrap();

        assert_eq!(store.load_of(c).await, 2);
    }

    #[tokio::test]
    async fn test_list_by_status_ordered_by_creation() {
        let store = TaskStore::new();
        let a = store.create(spec(100, 200), ts(0)).await.unwrap();
        let b = store.create(spec(100, 200), ts(5)).await.unwrap();

        let pending = store.list_by_status(TaskStatus::Pending).await;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, a);
        assert_eq!(pending[1].id, b);
    }

    #[tokio::test]
    async fn test_list_by_owner() {
        let store = TaskStore::new();
        store.create(spec(100, 200), ts(0)).await.unwrap();

        let mut other = spec(100, 200);
        other.owner = "bob".to_string();
        store.create(other, ts(1)).await.unwrap();

        assert_eq!(store.list_by_owner("alice").await.len(), 1);
        assert_eq!(store.list_by_owner("bob").await.len(), 1);
        assert!(store.list_by_owner("carol").await.is_empty());
    }
}
