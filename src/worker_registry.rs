//! C5: WorkerRegistry — registry + heartbeat tracking for local in-process
//! workers (spec §4.5). Runs on the master; exposes a small HTTP surface
//! (wired in [`crate::api`]) for workers that register, heartbeat, long-poll
//! for work, and report results.

use crate::error::{OrchestratorError, Result};
use crate::models::{Worker, WorkerState};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

#[derive(Debug, Clone, serde::Serialize)]
pub struct AssignedWork {
    pub task_id: String,
    pub kind: String,
    pub payload: serde_json::Value,
}

struct WorkerEntry {
    worker: Worker,
    pending_work: Option<AssignedWork>,
}

#[derive(Clone)]
pub struct WorkerRegistry {
    workers: Arc<Mutex<HashMap<String, WorkerEntry>>>,
    heartbeat_ttl: chrono::Duration,
    notify: Arc<Notify>,
}

impl WorkerRegistry {
    pub fn new(heartbeat_ttl: std::time::Duration) -> Self {
        Self {
            workers: Arc::new(Mutex::new(HashMap::new())),
            heartbeat_ttl: chrono::Duration::from_std(heartbeat_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Idempotent: replaying `register` after reconnect resumes eligibility
    /// with the prior id, clearing any stale `current_task_id` (spec §8
    /// round-trip behavior).
    pub async fn register(&self, id: String, kind: String, capabilities: HashSet<String>) {
        let mut workers = self.workers.lock().await;
        match workers.get_mut(&id) {
            Some(entry) => {
                entry.worker.kind = kind;
                entry.worker.capabilities = capabilities;
                entry.worker.state = WorkerState::Idle;
                entry.worker.current_task_id = None;
                entry.worker.last_heartbeat_at = chrono::Utc::now();
                entry.pending_work = None;
            }
            None => {
                workers.insert(
                    id.clone(),
                    WorkerEntry {
                        worker: Worker::new(id.clone(), kind, capabilities),
                        pending_work: None,
                    },
                );
            }
        }
        info!(worker_id = %id, "worker registered");
    }

    pub async fn heartbeat(&self, id: &str) -> Result<()> {
        let mut workers = self.workers.lock().await;
        let entry = workers
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
        entry.worker.last_heartbeat_at = chrono::Utc::now();
        if entry.worker.state == WorkerState::Offline {
            entry.worker.state = WorkerState::Idle;
        }
        Ok(())
    }

    /// Returns an `Idle` worker whose kind matches and whose capabilities
    /// are a superset of required; tie-break: least recently used (oldest
    /// heartbeat first, since idle workers heartbeat on a regular cadence
    /// and the oldest has been waiting longest) (spec §4.5).
    pub async fn find_local_worker(
        &self,
        kind: &str,
        required_capabilities: &HashSet<String>,
    ) -> Option<String> {
        let workers = self.workers.lock().await;
        workers
            .values()
            .filter(|e| {
                e.worker.state == WorkerState::Idle
                    && e.worker.kind == kind
                    && required_capabilities.is_subset(&e.worker.capabilities)
            })
            .min_by_key(|e| e.worker.last_heartbeat_at)
            .map(|e| e.worker.id.clone())
    }

    /// Hands off an assigned task: marks the worker Busy, sets
    /// `current_task_id`, and wakes any long-poller.
    pub async fn assign(&self, worker_id: &str, work: AssignedWork) -> Result<()> {
        let mut workers = self.workers.lock().await;
        let entry = workers
            .get_mut(worker_id)
            .ok_or_else(|| OrchestratorError::NotFound(worker_id.to_string()))?;
        entry.worker.state = WorkerState::Busy;
        entry.worker.current_task_id = Some(work.task_id.clone());
        entry.pending_work = Some(work);
        drop(workers);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Long-polls up to `poll_wait` for assigned work.
    pub async fn poll(&self, worker_id: &str, poll_wait: std::time::Duration) -> Option<AssignedWork> {
        let deadline = tokio::time::Instant::now() + poll_wait;
        loop {
            {
                let mut workers = self.workers.lock().await;
                if let Some(entry) = workers.get_mut(worker_id) {
                    if let Some(work) = entry.pending_work.take() {
                        return Some(work);
                    }
                } else {
                    return None;
                }
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(remaining) => { return None; }
            }
        }
    }

    /// Clears `current_task_id` and returns the worker to Idle after a
    /// result (or discard) is processed.
    pub async fn clear_current_task(&self, worker_id: &str) -> Result<()> {
        let mut workers = self.workers.lock().await;
        let entry = workers
            .get_mut(worker_id)
            .ok_or_else(|| OrchestratorError::NotFound(worker_id.to_string()))?;
        entry.worker.current_task_id = None;
        entry.worker.state = WorkerState::Idle;
        Ok(())
    }

    pub async fn current_task_of(&self, worker_id: &str) -> Option<String> {
        let workers = self.workers.lock().await;
        workers.get(worker_id).and_then(|e| e.worker.current_task_id.clone())
    }

    /// Background scanner (every `scan_interval`): any worker whose
    /// `last_heartbeat_at` is older than `heartbeat_ttl` is marked Offline;
    /// returns `(worker_id, task_id)` for every task that was in flight so
    /// the caller can re-enqueue it and attribute the failure to the right
    /// executor (spec §4.5).
    pub async fn sweep_offline(&self) -> Vec<(String, String)> {
        let mut workers = self.workers.lock().await;
        let now = chrono::Utc::now();
        let mut reclaimed = Vec::new();

        for entry in workers.values_mut() {
            if entry.worker.state == WorkerState::Offline {
                continue;
            }
            if now - entry.worker.last_heartbeat_at > self.heartbeat_ttl {
                warn!(worker_id = %entry.worker.id, "worker heartbeat stale, marking offline");
                entry.worker.state = WorkerState::Offline;
                if let Some(task_id) = entry.worker.current_task_id.take() {
                    reclaimed.push((entry.worker.id.clone(), task_id));
                }
                entry.pending_work = None;
            }
        }
        reclaimed
    }

    /// Snapshot of `(kind, capabilities)` for every worker currently Idle,
    /// used by the assignment loop to check whether a Pending task can be
    /// placed before pulling it off the queue (spec §4.6).
    pub async fn idle_capability_snapshot(&self) -> Vec<(String, HashSet<String>)> {
        let workers = self.workers.lock().await;
        workers
            .values()
            .filter(|e| e.worker.state == WorkerState::Idle)
            .map(|e| (e.worker.kind.clone(), e.worker.capabilities.clone()))
            .collect()
    }

    pub async fn get(&self, id: &str) -> Option<Worker> {
        let workers = self.workers.lock().await;
        workers.get(id).map(|e| e.worker.clone())
    }

    pub async fn counts_by_state(&self) -> HashMap<&'static str, usize> {
        let workers = self.workers.lock().await;
        let mut counts = HashMap::new();
        for entry in workers.values() {
            let key = match entry.worker.state {
                WorkerState::Idle => "idle",
                WorkerState::Busy => "busy",
                WorkerState::Offline => "offline",
            };
            *counts.entry(key).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_is_idempotent_and_clears_current_task() {
        let registry = WorkerRegistry::new(std::time::Duration::from_secs(60));
        registry
            .register("w1".into(), "cpu".into(), HashSet::new())
            .await;
        registry
            .assign(
                "w1",
                AssignedWork {
                    task_id: "t1".into(),
                    kind: "cpu".into(),
                    payload: serde_json::json!({}),
                },
            )
            .await
            .unwrap();
        assert_eq!(registry.current_task_of("w1").await, Some("t1".to_string()));

        registry
            .register("w1".into(), "cpu".into(), HashSet::new())
            .await;
        assert_eq!(registry.current_task_of("w1").await, None);
    }

    #[tokio::test]
    async fn find_local_worker_matches_kind_and_capabilities() {
        let registry = WorkerRegistry::new(std::time::Duration::from_secs(60));
        registry.register("w1".into(), "cpu".into(), HashSet::new()).await;
        let mut caps = HashSet::new();
        caps.insert("gpu".to_string());
        registry.register("w2".into(), "cpu".into(), caps.clone()).await;

        let required: HashSet<String> = ["gpu".to_string()].into_iter().collect();
        let found = registry.find_local_worker("cpu", &required).await;
        assert_eq!(found, Some("w2".to_string()));
    }

    #[tokio::test]
    async fn sweep_offline_reclaims_in_flight_task() {
        let registry = WorkerRegistry::new(std::time::Duration::from_millis(1));
        registry.register("w1".into(), "cpu".into(), HashSet::new()).await;
        registry
            .assign(
                "w1",
                AssignedWork {
                    task_id: "t1".into(),
                    kind: "cpu".into(),
                    payload: serde_json::json!({}),
                },
            )
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let reclaimed = registry.sweep_offline().await;
        assert_eq!(reclaimed, vec![("w1".to_string(), "t1".to_string())]);
        assert_eq!(registry.get("w1").await.unwrap().state, WorkerState::Offline);
    }
}
