//! Immutable configuration snapshot, loaded once at startup (spec §9: "global
//! mutable state for version and config" is recast as an immutable snapshot
//! taken at startup and passed by reference; reloads construct a new
//! snapshot, hot swaps are out of scope).

use crate::error::{OrchestratorError, Result};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub master: MasterConfig,
    pub slave: SlaveConfig,
    pub timing: TimingConfig,
    pub circuit: CircuitConfig,
    pub supervisor: SupervisorConfig,
    pub data_dir: std::path::PathBuf,
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub host: String,
    pub port: u16,
    /// Optional bearer token guarding the master's mutating admin routes
    /// (`/slaves`, `/human-requests/*`). Unset in local/dev use; ambient
    /// addition beyond spec §6.5's enumerated variables, noted in DESIGN.md.
    pub admin_token: Option<String>,
    pub poll_wait: Duration,
}

#[derive(Debug, Clone)]
pub struct SlaveConfig {
    pub host: String,
    pub port: u16,
    /// Required only when running the `slave` subcommand.
    pub token: Option<String>,
    pub max_concurrent_executions: usize,
    pub execute_timeout: Duration,
    /// Allowlisted root for `/upload`; paths resolving outside it are rejected.
    pub upload_root: std::path::PathBuf,
    /// Working directory mounted into the container backend, and searched
    /// for a project-local virtualenv.
    pub working_root: std::path::PathBuf,
    pub container_image: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TimingConfig {
    pub heartbeat_ttl: Duration,
    pub health_interval: Duration,
    pub task_timeout: Duration,
    pub max_attempts: u32,
    pub max_queue_size: usize,
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub threshold: u32,
    pub cooldown: Duration,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub restart_budget: u32,
    pub check_interval: Duration,
}

impl Config {
    /// Loads `.env` (best effort) then reads environment variables with the
    /// defaults in spec §6.5. Fails fast on malformed values; never applies
    /// a partially-valid config.
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("loaded .env file from {:?}", path),
            Err(e) => tracing::debug!("no .env file loaded: {}", e),
        }

        let master = MasterConfig {
            host: env_or("MASTER_HOST", crate::constants::MASTER_DEFAULT_HOST),
            port: env_parse_or("MASTER_PORT", crate::constants::MASTER_DEFAULT_PORT)?,
            admin_token: env::var("MASTER_ADMIN_TOKEN").ok().filter(|s| !s.trim().is_empty()),
            poll_wait: Duration::from_secs(env_parse_or(
                "WORKER_POLL_WAIT_SECONDS",
                crate::constants::WORKER_POLL_WAIT_SECONDS,
            )?),
        };

        let data_dir = env::var("DATA_DIR")
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|_| std::path::PathBuf::from("./data"));

        let slave = SlaveConfig {
            host: env_or("SLAVE_HOST", crate::constants::SLAVE_DEFAULT_HOST),
            port: env_parse_or("SLAVE_PORT", crate::constants::SLAVE_DEFAULT_PORT)?,
            token: env::var("SLAVE_TOKEN").ok().filter(|s| !s.trim().is_empty()),
            max_concurrent_executions: env_parse_or(
                "MAX_CONCURRENT_EXECUTIONS",
                crate::constants::MAX_CONCURRENT_EXECUTIONS,
            )?,
            execute_timeout: Duration::from_secs(env_parse_or(
                "SLAVE_EXECUTE_DEFAULT_TIMEOUT_SECONDS",
                crate::constants::SLAVE_EXECUTE_DEFAULT_TIMEOUT_SECONDS,
            )?),
            upload_root: env::var("SLAVE_UPLOAD_ROOT")
                .map(std::path::PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("work")),
            working_root: env::var("SLAVE_WORKING_ROOT")
                .map(std::path::PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("work")),
            container_image: env::var("SLAVE_CONTAINER_IMAGE").ok(),
        };

        let timing = TimingConfig {
            heartbeat_ttl: Duration::from_secs(env_parse_or(
                "HEARTBEAT_TTL_SECONDS",
                crate::constants::HEARTBEAT_TTL_SECONDS,
            )?),
            health_interval: Duration::from_secs(env_parse_or(
                "HEALTH_INTERVAL_SECONDS",
                crate::constants::HEALTH_INTERVAL_SECONDS,
            )?),
            task_timeout: Duration::from_secs(env_parse_or(
                "TASK_TIMEOUT_SECONDS",
                crate::constants::TASK_TIMEOUT_SECONDS,
            )?),
            max_attempts: env_parse_or("MAX_ATTEMPTS", crate::constants::MAX_ATTEMPTS)?,
            max_queue_size: env_parse_or("MAX_QUEUE_SIZE", crate::constants::MAX_QUEUE_SIZE)?,
        };

        let circuit = CircuitConfig {
            threshold: env_parse_or("CIRCUIT_THRESHOLD", crate::constants::CIRCUIT_THRESHOLD)?,
            cooldown: Duration::from_secs(env_parse_or(
                "CIRCUIT_COOLDOWN_SECONDS",
                crate::constants::CIRCUIT_COOLDOWN_SECONDS,
            )?),
        };

        let supervisor = SupervisorConfig {
            restart_budget: env_parse_or(
                "SUPERVISOR_RESTART_BUDGET",
                crate::constants::SUPERVISOR_RESTART_BUDGET,
            )?,
            check_interval: Duration::from_secs(env_parse_or(
                "SUPERVISOR_CHECK_INTERVAL_SECONDS",
                crate::constants::SUPERVISOR_CHECK_INTERVAL_SECONDS,
            )?),
        };

        Ok(Config {
            master,
            slave,
            timing,
            circuit,
            supervisor,
            data_dir,
        })
    }

    /// Fails if the `slave` subcommand was requested but no token is
    /// configured (spec §10.3: required when running as a slave, not a
    /// runtime 401 generator).
    pub fn require_slave_token(&self) -> Result<&str> {
        self.slave.token.as_deref().ok_or_else(|| {
            OrchestratorError::Config("SLAVE_TOKEN environment variable is required".to_string())
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| OrchestratorError::Config(format!("{key} is not a valid value: {raw}"))),
        Err(_) => Ok(default),
    }
}
