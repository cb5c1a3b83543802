//! C9: HumanRequestStore — durable queue of approval items a human operator
//! must act on before the orchestrator proceeds (spec §4.9).
//!
//! Persisted as a single JSON file under `data_dir/human_requests/requests.json`
//! (spec §6.4), rewritten atomically on every mutation. An optional notifier
//! is invoked on creation and on every state transition; notifier failures
//! are logged but never block the transition (spec §4.9, §6.3).

use crate::error::{OrchestratorError, Result};
use crate::models::{HumanRequest, HumanRequestState};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// Called with a snapshot of the request after creation or any transition.
pub type Notifier = Arc<dyn Fn(&HumanRequest) + Send + Sync>;

pub struct HumanRequestStore {
    requests: RwLock<HashMap<String, HumanRequest>>,
    persist_path: PathBuf,
    notifier: Option<Notifier>,
}

impl HumanRequestStore {
    pub async fn new(data_dir: &Path, notifier: Option<Notifier>) -> Result<Self> {
        let persist_path = data_dir.join("human_requests").join("requests.json");
        let requests = load_requests(&persist_path)?;

        Ok(Self {
            requests: RwLock::new(requests),
            persist_path,
            notifier,
        })
    }

    /// Inserts a new `Pending` request, persists, and fires the notifier.
    pub async fn create(&self, request: HumanRequest) -> Result<String> {
        let id = request.id.clone();
        {
            let mut requests = self.requests.write().await;
            requests.insert(id.clone(), request);
        }
        self.persist().await?;
        self.notify(&id).await;
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Option<HumanRequest> {
        let requests = self.requests.read().await;
        requests.get(id).cloned()
    }

    pub async fn list_pending(&self) -> Vec<HumanRequest> {
        self.list_by_state(HumanRequestState::Pending).await
    }

    pub async fn list_by_state(&self, state: HumanRequestState) -> Vec<HumanRequest> {
        let requests = self.requests.read().await;
        let mut items: Vec<HumanRequest> = requests
            .values()
            .filter(|r| r.state == state)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        items
    }

    pub async fn approve(&self, id: &str, notes: Option<String>) -> Result<HumanRequest> {
        self.transition(id, HumanRequestState::Approved, notes).await
    }

    pub async fn reject(&self, id: &str, notes: Option<String>) -> Result<HumanRequest> {
        self.transition(id, HumanRequestState::Rejected, notes).await
    }

    pub async fn mark_completed(&self, id: &str) -> Result<HumanRequest> {
        self.transition(id, HumanRequestState::Completed, None).await
    }

    pub async fn cancel(&self, id: &str) -> Result<HumanRequest> {
        self.transition(id, HumanRequestState::Cancelled, None).await
    }

    /// Enforces the state-machine DAG in [`HumanRequest::can_transition_to`];
    /// an invalid transition is rejected as a validation error rather than
    /// silently clamped (spec §3).
    async fn transition(
        &self,
        id: &str,
        next: HumanRequestState,
        notes: Option<String>,
    ) -> Result<HumanRequest> {
        {
            let mut requests = self.requests.write().await;
            let request = requests
                .get_mut(id)
                .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;

            if !request.can_transition_to(next) {
                return Err(OrchestratorError::Validation(format!(
                    "human request {id} cannot move from {:?} to {next:?}",
                    request.state
                )));
            }

            request.state = next;
            request.updated_at = chrono::Utc::now();
            if notes.is_some() {
                request.notes = notes;
            }
        }
        self.persist().await?;
        self.notify(id).await;
        Ok(self.get(id).await.expect("request present after transition"))
    }

    async fn notify(&self, id: &str) {
        let Some(notifier) = &self.notifier else { return };
        let Some(snapshot) = self.get(id).await else { return };
        notifier(&snapshot);
    }

    async fn persist(&self) -> Result<()> {
        let requests = self.requests.read().await;
        let values: Vec<&HumanRequest> = requests.values().collect();
        let json = serde_json::to_string_pretty(&values)?;
        drop(requests);

        if let Some(parent) = self.persist_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.persist_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.persist_path)?;
        Ok(())
    }
}

fn load_requests(path: &Path) -> Result<HashMap<String, HumanRequest>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    let requests: Vec<HumanRequest> = serde_json::from_str(&data)?;
    Ok(requests.into_iter().map(|r| (r.id.clone(), r)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample() -> HumanRequest {
        HumanRequest::new("approval", "Deploy v2", "needs sign-off", 1, None, "orchestrator")
    }

    #[tokio::test]
    async fn create_persists_and_is_listed_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store = HumanRequestStore::new(dir.path(), None).await.unwrap();
        let id = store.create(sample()).await.unwrap();

        let pending = store.list_pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
    }

    #[tokio::test]
    async fn approve_then_reject_is_rejected_as_invalid_transition() {
        let dir = tempfile::tempdir().unwrap();
        let store = HumanRequestStore::new(dir.path(), None).await.unwrap();
        let id = store.create(sample()).await.unwrap();

        store.approve(&id, None).await.unwrap();
        let result = store.reject(&id, None).await;
        assert!(matches!(result, Err(OrchestratorError::Validation(_))));
    }

    #[tokio::test]
    async fn approve_then_complete_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let store = HumanRequestStore::new(dir.path(), None).await.unwrap();
        let id = store.create(sample()).await.unwrap();

        store.approve(&id, Some("looks good".into())).await.unwrap();
        let completed = store.mark_completed(&id).await.unwrap();
        assert_eq!(completed.state, HumanRequestState::Completed);
        assert_eq!(completed.notes.as_deref(), Some("looks good"));
    }

    #[tokio::test]
    async fn notifier_fires_on_create_and_transition() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let notifier: Notifier = Arc::new(move |_req| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        let store = HumanRequestStore::new(dir.path(), Some(notifier)).await.unwrap();
        let id = store.create(sample()).await.unwrap();
        store.approve(&id, None).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reloads_persisted_requests_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let store = HumanRequestStore::new(dir.path(), None).await.unwrap();
        let id = store.create(sample()).await.unwrap();
        drop(store);

        let reloaded = HumanRequestStore::new(dir.path(), None).await.unwrap();
        assert!(reloaded.get(&id).await.is_some());
    }
}
