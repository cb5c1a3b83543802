//! System-wide default values. Each one is overridable by the matching
//! environment variable read in [`crate::config`].

// Worker / task timing
pub const HEARTBEAT_TTL_SECONDS: u64 = 60;
pub const LIVENESS_SCAN_INTERVAL_SECONDS: u64 = 10;
pub const WORKER_POLL_WAIT_SECONDS: u64 = 5;

// Slave health / version
pub const HEALTH_INTERVAL_SECONDS: u64 = 30;
pub const HEALTH_PROBE_TIMEOUT_SECONDS: u64 = 10;
pub const UNHEALTHY_AFTER_CONSECUTIVE_FAILURES: u32 = 2;

// Task scheduling
pub const TASK_TIMEOUT_SECONDS: u64 = 300;
pub const MAX_ATTEMPTS: u32 = 3;
pub const ASSIGNMENT_LOOP_IDLE_SLEEP_MS: u64 = 1000;
pub const ASSIGNMENT_LOOP_NO_EXECUTOR_SLEEP_MS: u64 = 2000;
pub const TIMEOUT_SWEEP_INTERVAL_SECONDS: u64 = 10;
pub const MAX_QUEUE_SIZE: usize = 1000;
pub const ANTI_STARVATION_AGE_SECONDS: i64 = 3600;
pub const ANTI_STARVATION_MAX_BOOST: i64 = 5;

// RobustTransport (C1)
pub const TRANSPORT_PER_REQUEST_TIMEOUT_SECONDS: u64 = 30;
pub const TRANSPORT_MAX_ATTEMPTS: u32 = 3;
pub const TRANSPORT_BACKOFF_BASE_SECONDS: u64 = 2;
pub const TRANSPORT_BACKOFF_CAP_SECONDS: u64 = 30;
pub const CIRCUIT_THRESHOLD: u32 = 5;
pub const CIRCUIT_COOLDOWN_SECONDS: u64 = 60;

// SlaveExecutor (C3)
pub const SLAVE_DEFAULT_HOST: &str = "0.0.0.0";
pub const SLAVE_DEFAULT_PORT: u16 = 7600;
pub const SLAVE_EXECUTE_DEFAULT_TIMEOUT_SECONDS: u64 = 300;
pub const MAX_CONCURRENT_EXECUTIONS: usize = 1;

// Master (C4/C5)
pub const MASTER_DEFAULT_HOST: &str = "0.0.0.0";
pub const MASTER_DEFAULT_PORT: u16 = 7001;

// Supervisor (C8)
pub const SUPERVISOR_RESTART_BUDGET: u32 = 5;
pub const SUPERVISOR_CHECK_INTERVAL_SECONDS: u64 = 10;
pub const SUPERVISOR_STAGGER_SECONDS: u64 = 3;
pub const SUPERVISOR_RESTART_BACKOFF_SECONDS: u64 = 5;
pub const SUPERVISOR_SHUTDOWN_GRACE_SECONDS: u64 = 10;
pub const SUPERVISOR_STDERR_TAIL_LINES: usize = 10;

// SlaveInstaller (C10)
pub const INSTALL_CLONE_TIMEOUT_SECONDS: u64 = 180;
pub const INSTALL_VENV_TIMEOUT_SECONDS: u64 = 60;
pub const INSTALL_BASELINE_DEPS_TIMEOUT_SECONDS: u64 = 120;
pub const INSTALL_REMAINING_DEPS_TIMEOUT_SECONDS: u64 = 600;
pub const INSTALL_STAGE_DELAY_SECONDS: u64 = 5;
