use thiserror::Error;

/// Convenience alias used at every internal component boundary instead of
/// ad-hoc `Result<T, String>`.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Error taxonomy for the orchestration core (spec §7). Variants map 1:1 to
/// the "Kind" column of the error taxonomy table; a handful of ambient
/// variants (`Io`, `Serialization`, `Config`) exist for day-to-day operation
/// and are not part of that table.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("circuit open for {host}:{port}")]
    CircuitOpen { host: String, port: u16 },

    #[error("http error {status}: {body}")]
    HttpError { status: u16, body: String },

    #[error("transport exhausted after {attempts} attempts: {last_error}")]
    TransportExhausted { attempts: u32, last_error: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("slave {slave_id} is in version mismatch")]
    VersionMismatch { slave_id: String },

    #[error("task {task_id} timed out")]
    TaskTimeout { task_id: String },

    #[error("task {task_id} was cancelled")]
    Cancelled { task_id: String },

    #[error("executor crashed: {message}")]
    ExecutorCrashed { message: String },

    #[error("supervised process {name} exhausted its restart budget")]
    RestartBudgetExhausted { name: String },

    #[error("a supervisor is already running (pid {pid})")]
    DuplicateSupervisor { pid: u32 },

    #[error("human request notification failed: {0}")]
    NotificationFailed(String),

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error("queue is full (max {max})")]
    QueueFull { max: usize },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http client error: {0}")]
    Reqwest(#[from] reqwest::Error),
}

impl OrchestratorError {
    /// Whether this error, seen by [`crate::transport::RobustTransport`],
    /// warrants a retry attempt (spec §4.1: retry on connection error,
    /// timeout, and 5xx; never on 4xx).
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestratorError::Timeout | OrchestratorError::ConnectionFailed(_) => true,
            OrchestratorError::HttpError { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
