//! Assignment engine
//!
//! Matches pending tasks to live collectors and owns the durable
//! per-collector assignment queues. Selection is least-loaded first with
//! ties broken by earliest registration, so placement is deterministic.
//! On a lost collector every live binding is reset to Pending and queued
//! undelivered assignments are discarded; the result router's dedup index
//! makes the re-run safe.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::models::{CapabilityFilter, CollectorId, TaskAssignment};

use super::registry::{CollectorRegistry, RegistryEvent};
use super::store::{Task, TaskStatus, TaskStore};

// ============================================================================
// Stats
// ============================================================================

/// Engine counters for the stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AssignmentStats {
    pub assignments_made: u64,
    pub failovers: u64,
    pub tasks_expired_unassigned: u64,
}

// ============================================================================
// Engine
// ============================================================================

/// Pending-task matcher and assignment-queue owner.
pub struct AssignmentEngine {
    registry: Arc<CollectorRegistry>,
    store: Arc<TaskStore>,
    queues: RwLock<HashMap<CollectorId, VecDeque<TaskAssignment>>>,
    stats: Mutex<AssignmentStats>,
}

impl AssignmentEngine {
    pub fn new(registry: Arc<CollectorRegistry>, store: Arc<TaskStore>) -> Self {
        Self {
            registry,
            store,
            queues: RwLock::new(HashMap::new()),
            stats: Mutex::new(AssignmentStats::default()),
        }
    }

    /// One matching pass over all pending tasks, oldest first.
    ///
    /// Tasks whose window already closed are failed. Tasks with no eligible
    /// collector stay Pending for the next pass.
    pub async fn assign_pending(&self, now: DateTime<Utc>) {
        let pending = self.store.list_by_status(TaskStatus::Pending).await;

        for task in pending {
            if task.window().is_closed(now) {
                tracing::warn!(task = %task.id, "Task window expired before assignment");
                if self
                    .store
                    .set_status(&task.id, TaskStatus::Failed, None, now)
                    .await
                    .is_ok()
                {
                    self.stats.lock().await.tasks_expired_unassigned += 1;
                }
                continue;
            }

            let filter = CapabilityFilter::from_task(&task.category, &task.location);
            let Some(collector) = self.pick_collector(&filter).await else {
                tracing::debug!(task = %task.id, "No eligible collector; task stays pending");
                continue;
            };

            self.bind(&task, collector, now).await;
        }
    }

    /// Least-loaded eligible collector; ties go to the earliest registration.
    async fn pick_collector(&self, filter: &CapabilityFilter) -> Option<CollectorId> {
        let candidates = self.registry.list_online(filter).await;

        let mut best: Option<(usize, CollectorId)> = None;
        for id in candidates {
            let load = self.store.load_of(id).await;
            match best {
                // candidates are in registration order, so strict `<` keeps
                // the earliest id on ties
                Some((best_load, _)) if load >= best_load => {}
                _ => best = Some((load, id)),
            }
        }
        best.map(|(_, id)| id)
    }

    /// Bind a task to a collector and enqueue the assignment.
    async fn bind(&self, task: &Task, collector: CollectorId, now: DateTime<Utc>) {
        if self
            .store
            .set_status(&task.id, TaskStatus::Assigned, Some(collector), now)
            .await
            .is_err()
        {
            return;
        }

        let assignment = TaskAssignment {
            task_id: task.id.clone(),
            keywords: task.keywords.clone(),
            category: task.category.clone(),
            location: task.location.clone(),
            start_time: task.start_time,
            end_time: task.end_time,
            sources: task.sources.clone(),
        };

        let mut queues = self.queues.write().await;
        queues.entry(collector).or_default().push_back(assignment);
        drop(queues);

        self.stats.lock().await.assignments_made += 1;
        tracing::info!(task = %task.id, collector = %collector, "Task assigned");
    }

    /// Drain the collector's undelivered assignments.
    ///
    /// Delivery is the Running transition: each drained task that is still
    /// bound to this collector moves to Running. Entries whose binding moved
    /// elsewhere in the meantime (failover raced the poll) are dropped.
    pub async fn drain_assignments(
        &self,
        collector: CollectorId,
        now: DateTime<Utc>,
    ) -> Vec<TaskAssignment> {
        let drained: Vec<TaskAssignment> = {
            let mut queues = self.queues.write().await;
            queues
                .get_mut(&collector)
                .map(|q| q.drain(..).collect())
                .unwrap_or_default()
        };

        let mut delivered = Vec::with_capacity(drained.len());
        for assignment in drained {
            match self.store.get(&assignment.task_id).await {
                Ok(task)
                    if task.assigned_collector == Some(collector)
                        && task.status == TaskStatus::Assigned =>
                {
                    if self
                        .store
                        .set_status(&assignment.task_id, TaskStatus::Running, Some(collector), now)
                        .await
                        .is_ok()
                    {
                        delivered.push(assignment);
                    }
                }
                _ => {
                    tracing::debug!(
                        task = %assignment.task_id,
                        collector = %collector,
                        "Dropping stale queued assignment"
                    );
                }
            }
        }
        delivered
    }

    /// Fail over every live binding of a lost collector.
    pub async fn failover(&self, collector: CollectorId, now: DateTime<Utc>) {
        // Undelivered assignments for the dead collector are worthless
        self.queues.write().await.remove(&collector);

        let bound = self.store.list_assigned_to(collector).await;
        if bound.is_empty() {
            return;
        }

        tracing::warn!(
            collector = %collector,
            tasks = bound.len(),
            "Failing over tasks from lost collector"
        );

        for task in bound {
            let _ = self
                .store
                .set_status(&task.id, TaskStatus::Pending, None, now)
                .await;
        }
        self.stats.lock().await.failovers += 1;

        // Re-place immediately rather than waiting for the next tick
        self.assign_pending(now).await;
    }

    /// Queued (undelivered) assignment count for a collector.
    pub async fn queued_for(&self, collector: CollectorId) -> usize {
        self.queues
            .read()
            .await
            .get(&collector)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Current counters.
    pub async fn stats(&self) -> AssignmentStats {
        self.stats.lock().await.clone()
    }

    /// Background loop: periodic matching pass plus registry-event handling.
    pub fn start(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<RegistryEvent>,
        period: std::time::Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.assign_pending(Utc::now()).await;
                    }
                    event = events.recv() => {
                        match event {
                            Some(RegistryEvent::Lost(id)) => {
                                self.failover(id, Utc::now()).await;
                            }
                            Some(RegistryEvent::CapacityAvailable(_)) => {
                                self.assign_pending(Utc::now()).await;
                            }
                            None => break,
                        }
                    }
                }
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
