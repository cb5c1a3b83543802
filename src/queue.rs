//! C6: TaskQueue — priority queue of submitted tasks, keyed primarily by
//! `-priority` then `submitted_at` (spec §4.6).

use crate::error::{OrchestratorError, Result};
use crate::models::{AttemptOutcome, Task, TaskAttempt, TaskStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub assigned: usize,
    pub completed: usize,
    pub failed: usize,
}

/// All operations are guarded by a single mutex; the queue is small enough
/// (thousands of entries) that lock granularity is not a concern (spec
/// §4.6).
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Mutex<HashMap<String, Task>>>,
    max_queue_size: usize,
}

impl TaskQueue {
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            max_queue_size,
        }
    }

    /// Rejects duplicate ids; a task whose deadline has already passed is
    /// immediately failed without ever becoming Pending (spec §8 boundary
    /// behavior).
    pub async fn submit(&self, task: Task) -> Result<String> {
        let mut queue = self.inner.lock().await;

        if let Some(existing) = queue.get(&task.id) {
            return Ok(existing.id.clone());
        }

        if queue.len() >= self.max_queue_size {
            return Err(OrchestratorError::QueueFull {
                max: self.max_queue_size,
            });
        }

        let id = task.id.clone();
        let mut task = task;
        if task.deadline_has_passed() {
            task.status = TaskStatus::Failed;
            warn!(task_id = %id, "task deadline already past at submission; failed without dispatch");
        }

        queue.insert(id.clone(), task);
        info!(task_id = %id, "task submitted");
        Ok(id)
    }

    /// Returns the highest-priority Pending task whose `kind`/capabilities
    /// can plausibly be satisfied, without removing it — the registries'
    /// check is advisory and a later placement attempt may still fail, in
    /// which case the task stays Pending (spec §4.6).
    ///
    /// `can_satisfy` should return true if at least one currently Idle
    /// worker or Healthy slave could take this kind/capability set.
    pub async fn next_assignable<F>(&self, can_satisfy: F) -> Option<Task>
    where
        F: Fn(&Task) -> bool,
    {
        let queue = self.inner.lock().await;

        queue
            .values()
            .filter(|t| t.status == TaskStatus::Pending && can_satisfy(t))
            .min_by(|a, b| {
                effective_priority(b)
                    .cmp(&effective_priority(a))
                    .then_with(|| a.submitted_at.cmp(&b.submitted_at))
            })
            .cloned()
    }

    pub async fn mark_assigned(&self, id: &str, executor_id: &str) -> Result<()> {
        let mut queue = self.inner.lock().await;
        let task = queue
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
        task.status = TaskStatus::Assigned;
        task.attempts.push(TaskAttempt {
            executor_id: executor_id.to_string(),
            started_at: chrono::Utc::now(),
            ended_at: None,
            outcome: AttemptOutcome::InProgress,
            error: None,
        });
        Ok(())
    }

    /// Applies only if the task is still `Assigned` to `executor_id`'s
    /// current attempt; otherwise the report is stale (the task was already
    /// cancelled, timed out, or reassigned) and is discarded, returning
    /// `false` (spec §4.7, §8 invariant 1).
    pub async fn mark_completed(&self, id: &str, executor_id: &str, result: serde_json::Value) -> Result<bool> {
        let mut queue = self.inner.lock().await;
        let task = queue
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;

        if !currently_assigned_to(task, executor_id) {
            warn!(task_id = %id, executor_id = %executor_id, status = ?task.status, "discarding stale completion report");
            return Ok(false);
        }

        task.status = TaskStatus::Completed;
        task.result = Some(result);
        if let Some(last) = task.attempts.last_mut() {
            last.ended_at = Some(chrono::Utc::now());
            last.outcome = AttemptOutcome::Success;
        }
        Ok(true)
    }

    /// `requeue = true` returns the task to Pending (bumping attempts);
    /// otherwise marks it terminally Failed (spec §4.6, §4.7). Same
    /// staleness guard as [`TaskQueue::mark_completed`].
    pub async fn mark_failed(&self, id: &str, executor_id: &str, error: impl Into<String>, requeue: bool) -> Result<bool> {
        let error = error.into();
        let mut queue = self.inner.lock().await;
        let task = queue
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;

        if !currently_assigned_to(task, executor_id) {
            warn!(task_id = %id, executor_id = %executor_id, status = ?task.status, "discarding stale failure report");
            return Ok(false);
        }

        if let Some(last) = task.attempts.last_mut() {
            last.ended_at = Some(chrono::Utc::now());
            last.outcome = AttemptOutcome::Failure;
            last.error = Some(error.clone());
        }

        if requeue && (task.attempts.len() as u32) < task.max_attempts {
            task.status = TaskStatus::Pending;
        } else {
            task.status = TaskStatus::Failed;
        }
        Ok(true)
    }

    pub async fn cancel(&self, id: &str) -> Result<bool> {
        let mut queue = self.inner.lock().await;
        match queue.get_mut(id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Failed;
                if let Some(last) = task.attempts.last_mut() {
                    last.outcome = AttemptOutcome::Cancelled;
                }
                Ok(true)
            }
            Some(task) if task.status == TaskStatus::Assigned => {
                task.status = TaskStatus::Failed;
                if let Some(last) = task.attempts.last_mut() {
                    last.outcome = AttemptOutcome::Cancelled;
                    last.ended_at = Some(chrono::Utc::now());
                }
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    pub async fn get(&self, id: &str) -> Option<Task> {
        let queue = self.inner.lock().await;
        queue.get(id).cloned()
    }

    pub async fn assigned_tasks(&self) -> Vec<Task> {
        let queue = self.inner.lock().await;
        queue
            .values()
            .filter(|t| t.status == TaskStatus::Assigned)
            .cloned()
            .collect()
    }

    /// Ids of `Assigned` tasks whose current (last) attempt was handed to
    /// `executor_id`. Used when a slave is removed mid-flight so its
    /// in-flight tasks can be freed back to Pending (spec §3, §4.4).
    pub async fn assigned_to(&self, executor_id: &str) -> Vec<String> {
        let queue = self.inner.lock().await;
        queue
            .values()
            .filter(|t| {
                t.status == TaskStatus::Assigned
                    && t.attempts
                        .last()
                        .map(|a| a.executor_id == executor_id)
                        .unwrap_or(false)
            })
            .map(|t| t.id.clone())
            .collect()
    }

    pub async fn stats(&self) -> QueueStats {
        let queue = self.inner.lock().await;
        let mut stats = QueueStats::default();
        for task in queue.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Assigned => stats.assigned += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

/// True if `task` is `Assigned` and its current (last) attempt belongs to
/// `executor_id` — the guard that keeps a late or duplicate result from a
/// prior attempt, or from an executor that lost the task, from mutating it.
fn currently_assigned_to(task: &Task, executor_id: &str) -> bool {
    task.status == TaskStatus::Assigned
        && task
            .attempts
            .last()
            .map(|a| a.executor_id == executor_id)
            .unwrap_or(false)
}

/// A task older than `anti_starvation_age` gains +1 priority per subsequent
/// hour of waiting, capped at +5 (spec §4.6). Computed fresh on every scan
/// from `submitted_at` rather than stored, so it never compounds.
fn effective_priority(task: &Task) -> i64 {
    let waited = chrono::Utc::now() - task.submitted_at;
    let age = crate::constants::ANTI_STARVATION_AGE_SECONDS;
    if waited.num_seconds() <= age {
        return task.priority;
    }
    let extra_hours = (waited.num_seconds() - age) / 3600 + 1;
    let boost = extra_hours.min(crate::constants::ANTI_STARVATION_MAX_BOOST);
    task.priority + boost
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn task(priority: i64) -> Task {
        Task::new("cpu", serde_json::json!("payload"), priority, HashSet::new(), None)
    }

    #[tokio::test]
    async fn submit_rejects_duplicate_ids() {
        let queue = TaskQueue::new(10);
        let t = task(1);
        let id1 = queue.submit(t.clone()).await.unwrap();
        let id2 = queue.submit(t).await.unwrap();
        assert_eq!(id1, id2);
        assert_eq!(queue.stats().await.pending, 1);
    }

    #[tokio::test]
    async fn next_assignable_prefers_higher_priority() {
        let queue = TaskQueue::new(10);
        queue.submit(task(1)).await.unwrap();
        let high = task(100);
        let high_id = high.id.clone();
        queue.submit(high).await.unwrap();

        let next = queue.next_assignable(|_| true).await.unwrap();
        assert_eq!(next.id, high_id);
    }

    #[tokio::test]
    async fn queue_full_rejects_new_submissions() {
        let queue = TaskQueue::new(1);
        queue.submit(task(1)).await.unwrap();
        let result = queue.submit(task(2)).await;
        assert!(matches!(result, Err(OrchestratorError::QueueFull { .. })));
    }

    #[tokio::test]
    async fn past_deadline_fails_immediately() {
        let queue = TaskQueue::new(10);
        let mut t = task(1);
        t.deadline = Some(chrono::Utc::now() - chrono::Duration::seconds(10));
        let id = queue.submit(t).await.unwrap();
        let stored = queue.get(&id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn mark_failed_requeues_until_max_attempts() {
        let queue = TaskQueue::new(10);
        let t = task(1);
        let id = queue.submit(t).await.unwrap();
        queue.mark_assigned(&id, "w1").await.unwrap();
        queue.mark_failed(&id, "w1", "boom", true).await.unwrap();
        let stored = queue.get(&id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.attempts.len(), 1);
    }

    #[tokio::test]
    async fn mark_completed_discards_report_from_non_current_executor() {
        let queue = TaskQueue::new(10);
        let t = task(1);
        let id = queue.submit(t).await.unwrap();
        queue.mark_assigned(&id, "w1").await.unwrap();
        queue.cancel(&id).await.unwrap();

        let applied = queue.mark_completed(&id, "w1", serde_json::json!("late")).await.unwrap();
        assert!(!applied);
        let stored = queue.get(&id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.result.is_none());
    }
}
