//! Collector runtime
//!
//! Process-level supervision for a collector: logs in, keeps the session
//! alive with heartbeats, polls the dispatcher for assignments and runs one
//! worker per live task. Heartbeat failures are logged, never fatal; the
//! dispatcher's liveness sweep decides when to give up on us.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::models::TaskId;

use super::client::{ClientError, DispatcherClient};
use super::config::CollectorConfig;
use super::sources::{FeedPoller, PollError};
use super::worker::{TaskWorker, WorkerHandle};

// ============================================================================
// Errors
// ============================================================================

/// Runtime startup errors
#[derive(Debug)]
pub enum RuntimeError {
    /// Configuration problem
    ConfigError(String),

    /// Could not reach or authenticate with the dispatcher
    ConnectError(ClientError),

    /// Could not initialize the feed poller
    PollerError(PollError),
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigError(msg) => write!(f, "Configuration error: {msg}"),
            Self::ConnectError(e) => write!(f, "Failed to connect to dispatcher: {e}"),
            Self::PollerError(e) => write!(f, "Failed to initialize poller: {e}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

// ============================================================================
// Runtime
// ============================================================================

/// Long-running collector process state.
pub struct CollectorRuntime {
    config: CollectorConfig,
    client: Arc<DispatcherClient>,
    poller: Arc<FeedPoller>,
    workers: Mutex<HashMap<TaskId, WorkerHandle>>,
}

impl CollectorRuntime {
    /// Build the runtime. Does not connect yet.
    pub fn new(config: CollectorConfig) -> Result<Self, RuntimeError> {
        config
            .validate()
            .map_err(|e| RuntimeError::ConfigError(e.to_string()))?;

        let client = DispatcherClient::new(&config).map_err(RuntimeError::ConnectError)?;
        let poller = FeedPoller::new(config.requests_per_minute, config.request_timeout())
            .map_err(RuntimeError::PollerError)?;

        Ok(Self {
            config,
            client: Arc::new(client),
            poller: Arc::new(poller),
            workers: Mutex::new(HashMap::new()),
        })
    }

    /// Connect, then run the heartbeat and assignment loops until the
    /// shutdown future resolves.
    pub async fn run(
        self: Arc<Self>,
        shutdown_signal: impl std::future::Future<Output = ()>,
    ) -> Result<(), RuntimeError> {
        self.connect().await?;

        let heartbeat = self.clone().start_heartbeat_loop();

        tracing::info!(
            name = %self.config.name,
            dispatcher = %self.config.dispatcher_url,
            "Collector running"
        );

        tokio::pin!(shutdown_signal);
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.poll_cycle().await;
                }
                _ = &mut shutdown_signal => break,
            }
        }

        tracing::info!("Shutting down collector");
        heartbeat.abort();
        self.stop_all_workers().await;
        Ok(())
    }

    /// Register (if configured) and log in.
    async fn connect(&self) -> Result<(), RuntimeError> {
        if self.config.register_on_start {
            self.client
                .register(&self.config)
                .await
                .map_err(RuntimeError::ConnectError)?;
        }
        self.client
            .login(&self.config)
            .await
            .map_err(RuntimeError::ConnectError)
    }

    fn start_heartbeat_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.heartbeat_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                match self.client.heartbeat(Utc::now()).await {
                    Ok(()) => {}
                    Err(e) if e.is_auth_failure() => {
                        // Session token went stale (dispatcher restart);
                        // re-login and carry on
                        tracing::warn!(error = %e, "Heartbeat rejected; re-authenticating");
                        if let Err(e) = self.client.login(&self.config).await {
                            tracing::warn!(error = %e, "Re-login failed");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Heartbeat failed");
                    }
                }
            }
        })
    }

    /// One assignment-poll cycle: reap finished workers, fetch new
    /// assignments, spawn workers.
    async fn poll_cycle(&self) {
        let mut workers = self.workers.lock().await;
        workers.retain(|task_id, handle| {
            let live = !handle.is_finished();
            if !live {
                tracing::debug!(task = %task_id, "Reaped finished worker");
            }
            live
        });
        drop(workers);

        let assignments = match self.client.poll_assignments(&self.config).await {
            Ok(assignments) => assignments,
            Err(e) if e.is_auth_failure() => {
                tracing::warn!(error = %e, "Assignment poll rejected; re-authenticating");
                if let Err(e) = self.client.login(&self.config).await {
                    tracing::warn!(error = %e, "Re-login failed");
                }
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Assignment poll failed");
                return;
            }
        };

        for assignment in assignments {
            let mut workers = self.workers.lock().await;
            if workers.contains_key(&assignment.task_id) {
                // Queue re-delivery race; the live worker keeps the task
                continue;
            }

            tracing::info!(task = %assignment.task_id, "Accepted assignment");
            let handle = TaskWorker::spawn(
                assignment.clone(),
                self.client.clone(),
                self.poller.clone(),
                self.config.refresh_period(),
            );
            workers.insert(assignment.task_id, handle);
        }
    }

    /// Cancel and join every live worker.
    async fn stop_all_workers(&self) {
        let mut workers = self.workers.lock().await;
        let drained: Vec<(TaskId, WorkerHandle)> = workers.drain().collect();
        drop(workers);

        for (task_id, handle) in drained {
            tracing::debug!(task = %task_id, "Stopping worker");
            handle.shutdown().await;
        }
    }

    /// Number of live task workers.
    pub async fn active_workers(&self) -> usize {
        self.workers.lock().await.len()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(url: &str) -> CollectorConfig {
        CollectorConfig {
            dispatcher_url: url.to_string(),
            name: "edge-1".to_string(),
            secret: "s3cret".to_string(),
            heartbeat_interval_secs: 1,
            poll_interval_secs: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let bad = CollectorConfig {
            secret: String::new(),
            ..config("http://localhost:8080")
        };
        assert!(matches!(
            CollectorRuntime::new(bad),
            Err(RuntimeError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_runtime_spawns_worker_for_assignment() {
        let mut server = mockito::Server::new_async().await;

        server
            .mock("POST", "/api/collector/register")
            .with_status(200)
            .with_body(r#"{"success": true, "data": 1}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/api/collector/login")
            .with_status(200)
            .with_body(r#"{"success": true, "data": {"token": "tok"}}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/api/collector/heartbeat")
            .with_status(200)
            .with_body(r#"{"success": true, "data": "ok"}"#)
            .create_async()
            .await;

        // One assignment with a far-future window so the worker stays alive
        let assignment_body = serde_json::json!({
            "success": true,
            "data": {
                "assignments": [{
                    "task_id": "t1",
                    "keywords": "storm",
                    "category": "",
                    "location": "",
                    "start_time": "2099-01-01T00:00:00Z",
                    "end_time": "2099-01-02T00:00:00Z",
                    "sources": []
                }]
            }
        });
        server
            .mock("POST", "/api/collector/assignments")
            .with_status(200)
            .with_body(assignment_body.to_string())
            .create_async()
            .await;

        let runtime = Arc::new(CollectorRuntime::new(config(&server.url())).unwrap());
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let run_handle = tokio::spawn(runtime.clone().run(async move {
            let _ = stop_rx.await;
        }));

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert_eq!(runtime.active_workers().await, 1);

        let _ = stop_tx.send(());
        let result = run_handle.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(runtime.active_workers().await, 0);
    }

    #[tokio::test]
    async fn test_connect_failure_reported() {
        // Nothing listening on this port
        let runtime = Arc::new(CollectorRuntime::new(config("http://127.0.0.1:1")).unwrap());
        let result = runtime.run(std::future::ready(())).await;
        assert!(matches!(result, Err(RuntimeError::ConnectError(_))));
    }
}
