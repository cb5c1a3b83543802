//! # spiral-orchestrator
//!
//! Distributed task orchestration core for autonomous agent workers and
//! slaves: a master-side task queue and scheduler, a registry of local
//! in-process workers, a registry of remote HTTP-reachable slaves, a
//! retrying/circuit-breaking HTTP transport, a process supervisor, and a
//! durable human-approval queue.
//!
//! ## Architecture
//!
//! - [`queue`] — C6 TaskQueue: priority queue of submitted tasks.
//! - [`orchestrator`] — C7 Orchestrator: the assignment and timeout-sweep loops.
//! - [`worker_registry`] — C5 WorkerRegistry: local worker liveness and dispatch.
//! - [`slave`] — C3/C4/C10: slave executor, manager, and installer.
//! - [`transport`] — C1 RobustTransport: retrying HTTP client with a per-host circuit breaker.
//! - [`version`] — C2 VersionProbe: master commit identity and peer comparison.
//! - [`supervisor`] — C8 Supervisor: lockfile, staggered start, bounded auto-restart.
//! - [`human_requests`] — C9 HumanRequestStore: durable approval queue.
//! - [`api`] — the master's HTTP surface (`/workers/*`, `/stats`, admin routes).
//!
//! Agent business logic, LLM vendor clients, and chat-bot command parsing
//! are explicitly out of scope for this core (spec.md §1).

pub mod api;
pub mod auth;
pub mod config;
pub mod constants;
pub mod error;
pub mod human_requests;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod queue;
pub mod rate_limit;
pub mod slave;
pub mod supervisor;
pub mod transport;
pub mod version;
pub mod worker_registry;

pub use error::{OrchestratorError, Result};
