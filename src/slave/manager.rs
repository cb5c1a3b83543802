//! C4: SlaveManager — registry + health/version loop for remote slaves,
//! running on the master (spec §4.4).

use crate::error::{OrchestratorError, Result};
use crate::human_requests::HumanRequestStore;
use crate::models::{Slave, SlaveStatus};
use crate::transport::RobustTransport;
use crate::version::VersionProbe;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, serde::Serialize)]
pub struct ExecuteRequest<'a> {
    pub command: &'a str,
    pub working_dir: Option<&'a str>,
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct ExecuteResponse {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub method: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct HealthResponse {
    status: String,
    #[allow(dead_code)]
    version: String,
    commit: String,
}

pub struct SlaveManager {
    slaves: Arc<Mutex<HashMap<String, Slave>>>,
    persist_path: PathBuf,
    transport: Arc<RobustTransport>,
    version_probe: Arc<VersionProbe>,
    human_requests: Arc<HumanRequestStore>,
}

impl SlaveManager {
    pub async fn new(
        data_dir: &std::path::Path,
        transport: Arc<RobustTransport>,
        version_probe: Arc<VersionProbe>,
        human_requests: Arc<HumanRequestStore>,
    ) -> Result<Self> {
        let persist_path = data_dir.join("slaves").join("config.json");
        let slaves = load_slaves(&persist_path)?;

        Ok(Self {
            slaves: Arc::new(Mutex::new(slaves)),
            persist_path,
            transport,
            version_probe,
            human_requests,
        })
    }

    /// Probes `/health`; stores the record whether or not the probe
    /// succeeds, with initial `status` set from the probe result (spec
    /// §4.4). Registering the same slave twice with identical parameters is
    /// idempotent (spec §8).
    pub async fn register_slave(
        &self,
        id: String,
        host: String,
        port: u16,
        token: String,
        capabilities: HashSet<String>,
    ) -> Result<()> {
        let mut slave = Slave::new(id.clone(), host, port, token, capabilities);
        slave.status = self.probe_health(&slave).await.unwrap_or(SlaveStatus::Unknown);

        let mut slaves = self.slaves.lock().await;
        slaves.insert(id.clone(), slave);
        drop(slaves);

        self.persist().await?;
        info!(slave_id = %id, "slave registered");
        Ok(())
    }

    /// Removes the record and frees any task held by it, returning the task
    /// id so the caller (Orchestrator) can re-enqueue it (spec §4.4).
    pub async fn remove_slave(&self, id: &str) -> Result<()> {
        let mut slaves = self.slaves.lock().await;
        slaves
            .remove(id)
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
        drop(slaves);
        self.persist().await?;
        info!(slave_id = %id, "slave removed");
        Ok(())
    }

    /// Returns a slave with `status=Healthy` whose capabilities are a
    /// superset of required; tie-break: least-recently-assigned (spec
    /// §4.4).
    pub async fn find_available_slave(&self, required_capabilities: &HashSet<String>) -> Option<String> {
        let slaves = self.slaves.lock().await;
        slaves
            .values()
            .filter(|s| s.is_assignable() && required_capabilities.is_subset(&s.capabilities))
            .min_by_key(|s| s.last_assigned_at.unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC))
            .map(|s| s.id.clone())
    }

    pub async fn get(&self, id: &str) -> Option<Slave> {
        let slaves = self.slaves.lock().await;
        slaves.get(id).cloned()
    }

    /// Capabilities of every currently `Healthy` slave, used by the
    /// assignment loop to check placeability before pulling a task off the
    /// queue (spec §4.6).
    pub async fn healthy_capability_snapshot(&self) -> Vec<HashSet<String>> {
        let slaves = self.slaves.lock().await;
        slaves
            .values()
            .filter(|s| s.is_assignable())
            .map(|s| s.capabilities.clone())
            .collect()
    }

    /// Builds an execution request and calls the slave's `/execute` via C1
    /// (spec §4.4).
    pub async fn execute_on_slave(&self, slave_id: &str, command: &str, timeout: Option<u64>) -> Result<ExecuteResponse> {
        let slave = {
            let mut slaves = self.slaves.lock().await;
            let slave = slaves
                .get_mut(slave_id)
                .ok_or_else(|| OrchestratorError::NotFound(slave_id.to_string()))?;
            slave.last_assigned_at = Some(chrono::Utc::now());
            slave.clone()
        };

        let request = ExecuteRequest {
            command,
            working_dir: None,
            timeout,
        };
        let body = serde_json::to_value(&request)?;

        let url = format!("{}/execute", slave.base_url());
        let auth_header = format!("Bearer {}", slave.auth_token);
        let response = self
            .transport
            .post(
                &url,
                &[("Authorization", auth_header.as_str())],
                body,
                timeout.map(std::time::Duration::from_secs),
            )
            .await?;

        response.json::<ExecuteResponse>()
    }

    /// Probes `/health` with a 10s timeout (no retry — the loop itself
    /// provides repetition); every `health_interval`, compares the reported
    /// commit to the master's version, updates status, and fires a
    /// human-notification exactly once per transition into `Unhealthy` or
    /// `VersionMismatch` (spec §4.4).
    pub async fn run_health_loop(&self, interval: std::time::Duration) {
        loop {
            tokio::time::sleep(interval).await;
            let ids: Vec<String> = {
                let slaves = self.slaves.lock().await;
                slaves.keys().cloned().collect()
            };

            for id in ids {
                if let Err(e) = self.health_check_one(&id).await {
                    warn!(slave_id = %id, error = %e, "health check failed");
                }
            }

            if let Err(e) = self.persist().await {
                warn!(error = %e, "failed to persist slave registry");
            }
        }
    }

    async fn health_check_one(&self, id: &str) -> Result<()> {
        let slave = {
            let slaves = self.slaves.lock().await;
            slaves.get(id).cloned()
        };
        let Some(slave) = slave else { return Ok(()) };

        let probe_result = self.probe_health(&slave).await;

        let mut slaves = self.slaves.lock().await;
        let Some(slave) = slaves.get_mut(id) else { return Ok(()) };
        let previous_status = slave.status;

        match probe_result {
            Ok(status) => {
                slave.consecutive_health_failures = 0;
                slave.status = status;
                slave.last_health_at = Some(chrono::Utc::now());
            }
            Err(_) => {
                slave.consecutive_health_failures += 1;
                if slave.consecutive_health_failures >= crate::constants::UNHEALTHY_AFTER_CONSECUTIVE_FAILURES {
                    slave.status = SlaveStatus::Unhealthy;
                }
            }
        }

        let new_status = slave.status;
        let slave_id = slave.id.clone();
        drop(slaves);

        if previous_status != SlaveStatus::Unhealthy && new_status == SlaveStatus::Unhealthy {
            self.notify_quarantine(&slave_id, "slave_unhealthy", "Slave marked unhealthy").await;
        } else if previous_status != SlaveStatus::VersionMismatch && new_status == SlaveStatus::VersionMismatch {
            self.notify_quarantine(&slave_id, "version_drift", "Slave reports a commit that does not match the master").await;
        }

        Ok(())
    }

    async fn notify_quarantine(&self, slave_id: &str, kind: &str, description: &str) {
        let request = crate::models::HumanRequest::new(
            kind,
            format!("Slave {slave_id} quarantined"),
            description.to_string(),
            0,
            None,
            "slave_manager",
        );
        if let Err(e) = self.human_requests.create(request).await {
            warn!(error = %e, "failed to record human request for slave quarantine");
        }
    }

    async fn probe_health(&self, slave: &Slave) -> Result<SlaveStatus> {
        let url = format!("{}/health", slave.base_url());
        let response = self
            .transport
            .get(&url, &[])
            .await?;
        let health: HealthResponse = response.json()?;

        if health.status != "healthy" {
            return Ok(SlaveStatus::Unhealthy);
        }

        if self.version_probe.matches(&health.commit) {
            Ok(SlaveStatus::Healthy)
        } else {
            Ok(SlaveStatus::VersionMismatch)
        }
    }

    pub async fn counts_by_status(&self) -> HashMap<&'static str, usize> {
        let slaves = self.slaves.lock().await;
        let mut counts = HashMap::new();
        for slave in slaves.values() {
            let key = match slave.status {
                SlaveStatus::Healthy => "healthy",
                SlaveStatus::Unhealthy => "unhealthy",
                SlaveStatus::VersionMismatch => "version_mismatch",
                SlaveStatus::Unknown => "unknown",
            };
            *counts.entry(key).or_insert(0) += 1;
        }
        counts
    }

    async fn persist(&self) -> Result<()> {
        let slaves = self.slaves.lock().await;
        let values: Vec<&Slave> = slaves.values().collect();
        let json = serde_json::to_string_pretty(&values)?;
        drop(slaves);

        if let Some(parent) = self.persist_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.persist_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.persist_path)?;
        Ok(())
    }
}

fn load_slaves(path: &std::path::Path) -> Result<HashMap<String, Slave>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    let slaves: Vec<Slave> = serde_json::from_str(&data)?;
    Ok(slaves.into_iter().map(|s| (s.id.clone(), s)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::human_requests::HumanRequestStore;
    use crate::transport::{CircuitBreakerConfig, TransportConfig};

    async fn test_manager(data_dir: &std::path::Path) -> SlaveManager {
        let transport = Arc::new(
            RobustTransport::new(TransportConfig::default(), CircuitBreakerConfig::default()).unwrap(),
        );
        let version_probe = Arc::new(VersionProbe::with_version("abc1234"));
        let human_requests = Arc::new(HumanRequestStore::new(data_dir, None).await.unwrap());
        SlaveManager::new(data_dir, transport, version_probe, human_requests)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn register_persists_even_when_probe_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path()).await;
        manager
            .register_slave(
                "s1".into(),
                "127.0.0.1".into(),
                1, // nothing listens here
                "token".into(),
                HashSet::new(),
            )
            .await
            .unwrap();

        let slave = manager.get("s1").await.unwrap();
        assert_ne!(slave.status, SlaveStatus::Healthy);
    }

    #[tokio::test]
    async fn unhealthy_and_version_mismatch_slaves_are_not_assignable() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path()).await;
        manager
            .register_slave("s1".into(), "127.0.0.1".into(), 1, "t".into(), HashSet::new())
            .await
            .unwrap();

        assert_eq!(manager.find_available_slave(&HashSet::new()).await, None);
    }
}
