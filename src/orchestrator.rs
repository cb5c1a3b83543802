//! C7: Orchestrator — the scheduling core. One long-lived assignment loop
//! plus one long-lived timeout-sweep loop, neither of which ever blocks on a
//! remote call directly (spec §4.7).

use crate::error::{OrchestratorError, Result};
use crate::human_requests::HumanRequestStore;
use crate::models::{AttemptOutcome, Task, TaskStatus};
use crate::queue::TaskQueue;
use crate::slave::SlaveManager;
use crate::worker_registry::{AssignedWork, WorkerRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

/// Resolved exactly once with either the task's result blob or a terminal
/// error (spec §6.2, §4.7).
pub type CompletionHandle = oneshot::Receiver<std::result::Result<serde_json::Value, OrchestratorError>>;

pub struct Orchestrator {
    queue: TaskQueue,
    workers: WorkerRegistry,
    slaves: Arc<SlaveManager>,
    #[allow(dead_code)]
    human_requests: Arc<HumanRequestStore>,
    completions: Arc<Mutex<HashMap<String, oneshot::Sender<std::result::Result<serde_json::Value, OrchestratorError>>>>>,
    task_timeout: chrono::Duration,
}

impl Orchestrator {
    pub fn new(
        queue: TaskQueue,
        workers: WorkerRegistry,
        slaves: Arc<SlaveManager>,
        human_requests: Arc<HumanRequestStore>,
        task_timeout: std::time::Duration,
    ) -> Self {
        Self {
            queue,
            workers,
            slaves,
            human_requests,
            completions: Arc::new(Mutex::new(HashMap::new())),
            task_timeout: chrono::Duration::from_std(task_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(300)),
        }
    }

    /// Submits a task and returns its id plus a handle resolved once the
    /// task reaches a terminal state (spec §6.2).
    pub async fn submit(&self, task: Task) -> Result<(String, CompletionHandle)> {
        let (tx, rx) = oneshot::channel();
        let id = self.queue.submit(task).await?;
        self.completions.lock().await.insert(id.clone(), tx);

        if let Some(task) = self.queue.get(&id).await {
            if task.status == TaskStatus::Failed {
                self.resolve(&id, Err(OrchestratorError::Validation("deadline already passed".to_string()))).await;
            }
        }

        Ok((id, rx))
    }

    /// Removes a slave and frees any task it currently holds back to
    /// Pending so the assignment loop can place it elsewhere (spec §4.4:
    /// "removes record and frees any task held by it").
    pub async fn remove_slave(&self, slave_id: &str) -> Result<()> {
        let held = self.queue.assigned_to(slave_id).await;
        self.slaves.remove_slave(slave_id).await?;
        for task_id in held {
            let requeue = self.should_requeue(&task_id).await;
            let applied = self
                .queue
                .mark_failed(&task_id, slave_id, "slave removed", requeue)
                .await
                .unwrap_or(false);
            if applied && !requeue {
                self.resolve(&task_id, Err(OrchestratorError::ExecutorCrashed {
                    message: "slave removed".to_string(),
                }))
                .await;
            }
        }
        Ok(())
    }

    pub async fn cancel(&self, id: &str) -> Result<bool> {
        let cancelled = self.queue.cancel(id).await?;
        if cancelled {
            self.resolve(id, Err(OrchestratorError::Cancelled { task_id: id.to_string() })).await;
        }
        Ok(cancelled)
    }

    /// Called by the worker-facing HTTP surface when a worker posts a result.
    pub async fn complete_from_worker(&self, worker_id: &str, task_id: &str, success: bool, result: Option<serde_json::Value>, error: Option<String>) -> Result<()> {
        self.workers.clear_current_task(worker_id).await?;

        if success {
            let value = result.unwrap_or(serde_json::Value::Null);
            if self.queue.mark_completed(task_id, worker_id, value.clone()).await? {
                self.resolve(task_id, Ok(value)).await;
            }
        } else {
            let message = error.unwrap_or_else(|| "worker reported failure".to_string());
            let requeue = self.should_requeue(task_id).await;
            let applied = self.queue.mark_failed(task_id, worker_id, message.clone(), requeue).await?;
            if applied && !requeue {
                self.resolve(task_id, Err(OrchestratorError::ExecutorCrashed { message })).await;
            }
        }
        Ok(())
    }

    async fn should_requeue(&self, task_id: &str) -> bool {
        self.queue
            .get(task_id)
            .await
            .map(|t| (t.attempts.len() as u32) < t.max_attempts)
            .unwrap_or(false)
    }

    async fn resolve(&self, task_id: &str, outcome: std::result::Result<serde_json::Value, OrchestratorError>) {
        if let Some(tx) = self.completions.lock().await.remove(task_id) {
            let _ = tx.send(outcome);
        }
    }

    /// Pulls the next assignable task, prefers a local worker, falls back to
    /// a slave dispatched on its own task, else leaves it Pending (spec
    /// §4.7).
    pub async fn run_assignment_loop(self: Arc<Self>) {
        loop {
            let idle_workers = self.workers.idle_capability_snapshot().await;
            let healthy_slaves = self.slaves.healthy_capability_snapshot().await;

            let task = self
                .queue
                .next_assignable(|task| {
                    idle_workers
                        .iter()
                        .any(|(kind, caps)| *kind == task.kind && task.required_capabilities.is_subset(caps))
                        || healthy_slaves
                            .iter()
                            .any(|caps| task.required_capabilities.is_subset(caps))
                })
                .await;

            let Some(task) = task else {
                tokio::time::sleep(std::time::Duration::from_millis(
                    crate::constants::ASSIGNMENT_LOOP_IDLE_SLEEP_MS,
                ))
                .await;
                continue;
            };

            if let Some(worker_id) = self.workers.find_local_worker(&task.kind, &task.required_capabilities).await {
                if let Err(e) = self.queue.mark_assigned(&task.id, &worker_id).await {
                    warn!(task_id = %task.id, error = %e, "failed to mark task assigned");
                    continue;
                }
                if let Err(e) = self
                    .workers
                    .assign(&worker_id, AssignedWork {
                        task_id: task.id.clone(),
                        kind: task.kind.clone(),
                        payload: task.payload.clone(),
                    })
                    .await
                {
                    warn!(task_id = %task.id, error = %e, "failed to hand off to worker");
                }
                continue;
            }

            if let Some(slave_id) = self.slaves.find_available_slave(&task.required_capabilities).await {
                if let Err(e) = self.queue.mark_assigned(&task.id, &slave_id).await {
                    warn!(task_id = %task.id, error = %e, "failed to mark task assigned");
                    continue;
                }
                let this = self.clone();
                let command = task.payload.as_str().map(str::to_string).unwrap_or_else(|| task.payload.to_string());
                tokio::spawn(async move {
                    this.dispatch_to_slave(task.id, slave_id, command).await;
                });
                continue;
            }

            tokio::time::sleep(std::time::Duration::from_millis(
                crate::constants::ASSIGNMENT_LOOP_NO_EXECUTOR_SLEEP_MS,
            ))
            .await;
        }
    }

    async fn dispatch_to_slave(&self, task_id: String, slave_id: String, command: String) {
        match self.slaves.execute_on_slave(&slave_id, &command, None).await {
            Ok(response) if response.success => {
                let value = serde_json::json!({"stdout": response.stdout, "exit_code": response.exit_code});
                match self.queue.mark_completed(&task_id, &slave_id, value.clone()).await {
                    Ok(true) => self.resolve(&task_id, Ok(value)).await,
                    Ok(false) => {}
                    Err(e) => warn!(task_id = %task_id, error = %e, "failed to mark slave-completed task"),
                }
            }
            Ok(response) => {
                let requeue = self.should_requeue(&task_id).await;
                let applied = self
                    .queue
                    .mark_failed(&task_id, &slave_id, response.stderr.clone(), requeue)
                    .await
                    .unwrap_or(false);
                if applied && !requeue {
                    self.resolve(&task_id, Err(OrchestratorError::ExecutorCrashed { message: response.stderr })).await;
                }
            }
            Err(e) => {
                let requeue = self.should_requeue(&task_id).await;
                let applied = self
                    .queue
                    .mark_failed(&task_id, &slave_id, e.to_string(), requeue)
                    .await
                    .unwrap_or(false);
                if applied && !requeue {
                    self.resolve(&task_id, Err(e)).await;
                }
            }
        }
    }

    /// Every 10 s, fails or requeues any task Assigned past `task_timeout`
    /// (spec §4.7).
    pub async fn run_timeout_sweep_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(
                crate::constants::TIMEOUT_SWEEP_INTERVAL_SECONDS,
            ))
            .await;

            let assigned = self.queue.assigned_tasks().await;
            let now = chrono::Utc::now();

            for task in assigned {
                let Some(attempt) = task.attempts.last() else { continue };
                if attempt.outcome != AttemptOutcome::InProgress {
                    continue;
                }
                if now - attempt.started_at <= self.task_timeout {
                    continue;
                }

                info!(task_id = %task.id, executor = %attempt.executor_id, "task timed out, sweeping");
                let _ = self.workers.clear_current_task(&attempt.executor_id).await;

                let requeue = (task.attempts.len() as u32) < task.max_attempts;
                let applied = self
                    .queue
                    .mark_failed(&task.id, &attempt.executor_id, "task timed out", requeue)
                    .await
                    .unwrap_or(false);
                if applied && !requeue {
                    self.resolve(&task.id, Err(OrchestratorError::TaskTimeout { task_id: task.id.clone() })).await;
                }
            }
        }
    }

    /// Runs once per `liveness_scan_interval`; any worker that went offline
    /// has its in-flight task requeued (spec §4.5, §8 invariant 2).
    pub async fn run_worker_liveness_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(
                crate::constants::LIVENESS_SCAN_INTERVAL_SECONDS,
            ))
            .await;

            for (worker_id, task_id) in self.workers.sweep_offline().await {
                let requeue = self.should_requeue(&task_id).await;
                let applied = self
                    .queue
                    .mark_failed(&task_id, &worker_id, "worker went offline", requeue)
                    .await
                    .unwrap_or(false);
                if applied && !requeue {
                    self.resolve(&task_id, Err(OrchestratorError::ExecutorCrashed {
                        message: "worker went offline".to_string(),
                    }))
                    .await;
                }
            }
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    pub fn slaves(&self) -> &Arc<SlaveManager> {
        &self.slaves
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{CircuitBreakerConfig, RobustTransport, TransportConfig};
    use crate::version::VersionProbe;
    use std::collections::HashSet;

    async fn test_orchestrator(dir: &std::path::Path) -> Arc<Orchestrator> {
        let transport = Arc::new(RobustTransport::new(TransportConfig::default(), CircuitBreakerConfig::default()).unwrap());
        let version_probe = Arc::new(VersionProbe::with_version("abc1234"));
        let human_requests = Arc::new(HumanRequestStore::new(dir, None).await.unwrap());
        let slaves = Arc::new(SlaveManager::new(dir, transport, version_probe, human_requests.clone()).await.unwrap());
        let queue = TaskQueue::new(100);
        let workers = WorkerRegistry::new(std::time::Duration::from_secs(60));
        Arc::new(Orchestrator::new(queue, workers, slaves, human_requests, std::time::Duration::from_secs(300)))
    }

    #[tokio::test]
    async fn submitted_task_past_deadline_resolves_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path()).await;
        let mut task = Task::new("cpu", serde_json::json!("x"), 1, HashSet::new(), None);
        task.deadline = Some(chrono::Utc::now() - chrono::Duration::seconds(10));

        let (_id, rx) = orchestrator.submit(task).await.unwrap();
        let outcome = rx.await.unwrap();
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn assignment_loop_hands_task_to_matching_local_worker() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path()).await;
        orchestrator.workers().register("w1".into(), "cpu".into(), HashSet::new()).await;

        let task = Task::new("cpu", serde_json::json!("echo"), 1, HashSet::new(), None);
        let task_id = task.id.clone();
        let (_id, _rx) = orchestrator.submit(task).await.unwrap();

        let orch = orchestrator.clone();
        let handle = tokio::spawn(async move { orch.run_assignment_loop().await });

        let work = orchestrator.workers().poll("w1", std::time::Duration::from_secs(2)).await;
        assert_eq!(work.map(|w| w.task_id), Some(task_id));
        handle.abort();
    }

    #[tokio::test]
    async fn assignment_loop_skips_an_unplaceable_task_for_a_placeable_one() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path()).await;
        orchestrator.workers().register("w1".into(), "cpu".into(), HashSet::new()).await;

        let gpu_caps: HashSet<String> = ["gpu".to_string()].into_iter().collect();
        let unplaceable = Task::new("cpu", serde_json::json!("needs-gpu"), 100, gpu_caps, None);
        let placeable = Task::new("cpu", serde_json::json!("echo"), 1, HashSet::new(), None);
        let unplaceable_id = unplaceable.id.clone();
        let placeable_id = placeable.id.clone();

        orchestrator.submit(unplaceable).await.unwrap();
        orchestrator.submit(placeable).await.unwrap();

        let orch = orchestrator.clone();
        let handle = tokio::spawn(async move { orch.run_assignment_loop().await });

        // No worker or slave offers the "gpu" capability, so the
        // higher-priority task must not starve the one w1 can actually run.
        let work = orchestrator.workers().poll("w1", std::time::Duration::from_secs(2)).await;
        assert_eq!(work.map(|w| w.task_id), Some(placeable_id));
        handle.abort();

        let stored = orchestrator.queue().get(&unplaceable_id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
    }
}
