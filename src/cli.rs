//! CLI surface (spec §6.6): `orchestrator`, `slave`, `supervisor`,
//! `add-slave`, `install-slave`, `status`, each accepting a global
//! `--config <path>`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "spiral-orchestrator", about = "Distributed task orchestration core", version)]
pub struct Cli {
    /// Path to a `.env`-style config file; overrides the default environment.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the master: task queue, worker registry, slave manager, the
    /// assignment/timeout-sweep/health/liveness loops, and the HTTP API.
    Orchestrator,

    /// Run the slave executor HTTP server (`/health`, `/version`,
    /// `/execute`, `/upload`).
    Slave,

    /// Run the process supervisor, which owns and auto-restarts the
    /// orchestrator (and any other configured long-lived daemons).
    Supervisor,

    /// Register a remote slave with a running master.
    AddSlave {
        /// `host:port` of the slave to register.
        host_port: String,
        /// Bearer token the master will present to the slave.
        token: String,
        #[arg(long, default_value = "http://127.0.0.1:7001")]
        master_url: String,
        #[arg(long, value_delimiter = ',')]
        capabilities: Vec<String>,
    },

    /// One-shot bootstrap of a remote slave host: clone, venv, deps, validate.
    InstallSlave {
        /// `host:port` of the slave to install onto.
        host_port: String,
        #[arg(long)]
        token: String,
        #[arg(long)]
        source: String,
    },

    /// Print queue/worker/slave counts from a running master's `/stats`.
    Status {
        #[arg(long, default_value = "http://127.0.0.1:7001")]
        master_url: String,
    },
}
