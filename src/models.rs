//! Core data model (spec §3). `TaskQueue` exclusively owns [`Task`] values;
//! every other component holds only an `id` reference, per the ownership
//! rules in §3.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// A unit of work accepted from an in-process producer.
///
/// Invariant: a task is in exactly one of [`TaskStatus`] at all times;
/// transitions are `Pending -> Assigned -> (Completed|Failed|Pending)`.
/// Re-queuing appends to `attempts` but keeps `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub priority: i64,
    pub required_capabilities: HashSet<String>,
    pub submitted_at: chrono::DateTime<chrono::Utc>,
    pub deadline: Option<chrono::DateTime<chrono::Utc>>,
    pub max_attempts: u32,
    pub status: TaskStatus,
    pub attempts: Vec<TaskAttempt>,
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Assigned,
    Completed,
    Failed,
}

/// Which executor ran the task, when, and with what outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAttempt {
    pub executor_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AttemptOutcome {
    InProgress,
    Success,
    Failure,
    TimedOut,
    Cancelled,
}

impl Task {
    pub fn new(
        kind: impl Into<String>,
        payload: serde_json::Value,
        priority: i64,
        required_capabilities: HashSet<String>,
        deadline: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            payload,
            priority,
            required_capabilities,
            submitted_at: chrono::Utc::now(),
            deadline,
            max_attempts: crate::constants::MAX_ATTEMPTS,
            status: TaskStatus::Pending,
            attempts: Vec::new(),
            result: None,
        }
    }

    /// A deadline already in the past at submission time (spec §8 boundary
    /// behavior: immediately failed without dispatch).
    pub fn deadline_has_passed(&self) -> bool {
        self.deadline
            .map(|d| d < chrono::Utc::now())
            .unwrap_or(false)
    }

    pub fn capabilities_satisfied_by(&self, available: &HashSet<String>) -> bool {
        self.required_capabilities.is_subset(available)
    }
}

/// A local, in-process long-lived executor that polls the master for tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub kind: String,
    pub capabilities: HashSet<String>,
    pub state: WorkerState,
    pub last_heartbeat_at: chrono::DateTime<chrono::Utc>,
    pub current_task_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
    Offline,
}

impl Worker {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, capabilities: HashSet<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            capabilities,
            state: WorkerState::Idle,
            last_heartbeat_at: chrono::Utc::now(),
            current_task_id: None,
        }
    }

    pub fn is_stale(&self, heartbeat_ttl: chrono::Duration) -> bool {
        chrono::Utc::now() - self.last_heartbeat_at > heartbeat_ttl
    }
}

/// A remote, HTTP-reachable executor. Created by `RegisterSlave`, deleted by
/// `RemoveSlave`; survives process restart via persistent config (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slave {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub auth_token: String,
    pub capabilities: HashSet<String>,
    pub status: SlaveStatus,
    pub last_seen_commit: Option<String>,
    pub last_health_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub last_assigned_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub consecutive_health_failures: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SlaveStatus {
    Healthy,
    Unhealthy,
    VersionMismatch,
    Unknown,
}

impl Slave {
    pub fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        auth_token: impl Into<String>,
        capabilities: HashSet<String>,
    ) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            auth_token: auth_token.into(),
            capabilities,
            status: SlaveStatus::Unknown,
            last_seen_commit: None,
            last_health_at: None,
            last_assigned_at: None,
            consecutive_health_failures: 0,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Slaves in `Unhealthy` or `VersionMismatch` must never receive new
    /// assignments (spec §3 invariant).
    pub fn is_assignable(&self) -> bool {
        self.status == SlaveStatus::Healthy
    }
}

/// Per-`(host, port)` circuit breaker state (spec §4.1, §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitState {
    pub phase: CircuitPhase,
    pub failure_count: u32,
    pub last_failure_at: Option<std::time::Instant>,
    pub open_until: Option<std::time::Instant>,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            phase: CircuitPhase::Closed,
            failure_count: 0,
            last_failure_at: None,
            open_until: None,
        }
    }
}

/// One child process owned exclusively by the [`crate::supervisor::Supervisor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisedProcessSpec {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub enabled: bool,
    #[serde(default = "default_restart_budget")]
    pub restart_budget: u32,
}

fn default_restart_budget() -> u32 {
    crate::constants::SUPERVISOR_RESTART_BUDGET
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisedProcessState {
    pub spec: SupervisedProcessSpec,
    pub pid: Option<u32>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub restart_count: u32,
    pub last_exit: Option<i32>,
    pub terminal: bool,
}

impl SupervisedProcessState {
    pub fn new(spec: SupervisedProcessSpec) -> Self {
        Self {
            spec,
            pid: None,
            started_at: None,
            restart_count: 0,
            last_exit: None,
            terminal: false,
        }
    }
}

/// A durable approval item (spec §3, §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanRequest {
    pub id: String,
    pub kind: String,
    pub title: String,
    pub description: String,
    pub priority: i64,
    pub estimated_cost: Option<f64>,
    pub created_by: String,
    pub state: HumanRequestState,
    pub notes: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HumanRequestState {
    Pending,
    Approved,
    Rejected,
    Completed,
    Cancelled,
}

impl HumanRequest {
    pub fn new(
        kind: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        priority: i64,
        estimated_cost: Option<f64>,
        created_by: impl Into<String>,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            title: title.into(),
            description: description.into(),
            priority,
            estimated_cost,
            created_by: created_by.into(),
            state: HumanRequestState::Pending,
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Valid transitions per spec §3: only `Pending -> {Approved, Rejected,
    /// Cancelled}` and `Approved -> {Completed, Cancelled}`. No back-edges.
    pub fn can_transition_to(&self, next: HumanRequestState) -> bool {
        use HumanRequestState::*;
        matches!(
            (self.state, next),
            (Pending, Approved) | (Pending, Rejected) | (Pending, Cancelled)
                | (Approved, Completed) | (Approved, Cancelled)
        )
    }
}
