//! C8: Supervisor — process supervisor with a lockfile, staggered startup,
//! a restart-budget health scan, and signal-driven graceful shutdown (spec
//! §4.8).

use crate::error::{OrchestratorError, Result};
use crate::models::{SupervisedProcessSpec, SupervisedProcessState};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

struct RunningChild {
    state: SupervisedProcessState,
    child: Option<Child>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

pub struct Supervisor {
    lockfile_path: PathBuf,
    children: Mutex<Vec<RunningChild>>,
    restart_budget: u32,
    check_interval: std::time::Duration,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct LockfileContents {
    pid: u32,
    started_at: chrono::DateTime<chrono::Utc>,
    components: Vec<String>,
}

impl Supervisor {
    pub fn new(data_dir: &std::path::Path, specs: Vec<SupervisedProcessSpec>, restart_budget: u32, check_interval: std::time::Duration) -> Self {
        let children = specs
            .into_iter()
            .map(|spec| RunningChild {
                state: SupervisedProcessState::new(spec),
                child: None,
                stderr_tail: Arc::new(Mutex::new(VecDeque::with_capacity(
                    crate::constants::SUPERVISOR_STDERR_TAIL_LINES,
                ))),
            })
            .collect();

        Self {
            lockfile_path: data_dir.join("supervisor.lock"),
            children: Mutex::new(children),
            restart_budget,
            check_interval,
        }
    }

    /// Refuses to start if the lockfile exists and its pid is alive.
    /// Recovers (overwrites) a stale lockfile whose pid is dead (spec
    /// §4.8, §8 invariant 7).
    pub fn acquire_lockfile(&self) -> Result<()> {
        if let Ok(existing) = std::fs::read_to_string(&self.lockfile_path) {
            if let Ok(contents) = serde_json::from_str::<LockfileContents>(&existing) {
                if pid_is_alive(contents.pid) {
                    return Err(OrchestratorError::DuplicateSupervisor { pid: contents.pid });
                }
                warn!(stale_pid = contents.pid, "stale supervisor lockfile found, taking over");
            }
        }

        let contents = LockfileContents {
            pid: std::process::id(),
            started_at: chrono::Utc::now(),
            components: Vec::new(),
        };
        if let Some(parent) = self.lockfile_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.lockfile_path, serde_json::to_string_pretty(&contents)?)?;
        Ok(())
    }

    fn release_lockfile(&self) {
        if let Err(e) = std::fs::remove_file(&self.lockfile_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "failed to remove supervisor lockfile");
            }
        }
    }

    /// Spawns every enabled child, staggered by `stagger_seconds` (spec
    /// §4.8).
    pub async fn start_all(&self) {
        let stagger = std::time::Duration::from_secs(crate::constants::SUPERVISOR_STAGGER_SECONDS);
        let mut children = self.children.lock().await;
        for entry in children.iter_mut() {
            if !entry.state.spec.enabled {
                continue;
            }
            spawn_child(entry);
            tokio::time::sleep(stagger).await;
        }
    }

    /// Runs forever: restarts exited children under budget, leaves
    /// exhausted ones terminal (spec §4.8).
    pub async fn run_health_scan_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.check_interval).await;
            let mut children = self.children.lock().await;

            for entry in children.iter_mut() {
                if entry.state.terminal || !entry.state.spec.enabled {
                    continue;
                }

                let Some(child) = entry.child.as_mut() else { continue };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        let exit_code = status.code().unwrap_or(-1);
                        entry.state.last_exit = Some(exit_code);
                        entry.child = None;

                        let tail = entry.stderr_tail.lock().await;
                        let joined: String = tail.iter().cloned().collect::<Vec<_>>().join("\n");
                        drop(tail);
                        error!(
                            component = %entry.state.spec.name,
                            exit_code,
                            stderr_tail = %joined,
                            "supervised child exited"
                        );

                        if entry.state.restart_count < self.restart_budget {
                            tokio::time::sleep(std::time::Duration::from_secs(
                                crate::constants::SUPERVISOR_RESTART_BACKOFF_SECONDS,
                            ))
                            .await;
                            entry.state.restart_count += 1;
                            spawn_child(entry);
                            info!(component = %entry.state.spec.name, restart_count = entry.state.restart_count, "restarted supervised child");
                        } else {
                            entry.state.terminal = true;
                            error!(component = %entry.state.spec.name, "restart budget exhausted, leaving terminal");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(component = %entry.state.spec.name, error = %e, "failed to poll child status"),
                }
            }
        }
    }

    /// Graceful shutdown: stop watching, terminate every live child, wait up
    /// to `shutdown_grace_seconds`, force-kill stragglers, remove the
    /// lockfile (spec §4.8).
    pub async fn shutdown(&self) {
        let grace = std::time::Duration::from_secs(crate::constants::SUPERVISOR_SHUTDOWN_GRACE_SECONDS);
        let mut children = self.children.lock().await;

        for entry in children.iter_mut() {
            let Some(child) = entry.child.as_mut() else { continue };
            let Some(pid) = child.id() else { continue };

            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);

            match tokio::time::timeout(grace, child.wait()).await {
                Ok(_) => info!(component = %entry.state.spec.name, "child exited gracefully"),
                Err(_) => {
                    warn!(component = %entry.state.spec.name, "child did not exit within grace period, force-killing");
                    let _ = child.kill().await;
                }
            }
        }

        drop(children);
        self.release_lockfile();
    }

    /// Blocks until SIGINT or SIGTERM, then runs [`Supervisor::shutdown`].
    pub async fn wait_for_shutdown_signal(&self) {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }

        self.shutdown().await;
    }

    pub async fn statuses(&self) -> Vec<SupervisedProcessState> {
        let children = self.children.lock().await;
        children.iter().map(|e| e.state.clone()).collect()
    }
}

fn spawn_child(entry: &mut RunningChild) {
    let mut cmd = Command::new(&entry.state.spec.command);
    cmd.args(&entry.state.spec.args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    match cmd.spawn() {
        Ok(mut child) => {
            entry.state.pid = child.id();
            entry.state.started_at = Some(chrono::Utc::now());

            if let Some(stderr) = child.stderr.take() {
                let name = entry.state.spec.name.clone();
                let tail = entry.stderr_tail.clone();
                tokio::spawn(drain_stderr(name, stderr, tail));
            }
            if let Some(stdout) = child.stdout.take() {
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(_line)) = lines.next_line().await {
                        // discarded: captured stdout is not persisted, only stderr tail
                    }
                });
            }

            entry.child = Some(child);
        }
        Err(e) => {
            error!(component = %entry.state.spec.name, error = %e, "failed to spawn supervised child");
        }
    }
}

async fn drain_stderr(name: String, stderr: tokio::process::ChildStderr, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(component = %name, "{line}");
        let mut tail = tail.lock().await;
        if tail.len() >= crate::constants::SUPERVISOR_STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

fn pid_is_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(name: &str, command: &str, args: &[&str]) -> SupervisedProcessSpec {
        SupervisedProcessSpec {
            name: name.to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            enabled: true,
            restart_budget: 2,
        }
    }

    #[test]
    fn acquire_lockfile_refuses_while_holder_pid_is_alive() {
        let dir = tempfile::tempdir().unwrap();
        let first = Supervisor::new(dir.path(), vec![], 1, Duration::from_secs(60));
        first.acquire_lockfile().unwrap();

        let second = Supervisor::new(dir.path(), vec![], 1, Duration::from_secs(60));
        let result = second.acquire_lockfile();
        assert!(matches!(result, Err(OrchestratorError::DuplicateSupervisor { .. })));
    }

    #[test]
    fn acquire_lockfile_recovers_a_stale_lockfile() {
        let dir = tempfile::tempdir().unwrap();
        let lockfile_path = dir.path().join("supervisor.lock");
        let stale = LockfileContents {
            // pid 1 is typically init and alive in CI sandboxes, so use a pid
            // far outside any real process range to simulate a dead one.
            pid: 999_999,
            started_at: chrono::Utc::now(),
            components: Vec::new(),
        };
        std::fs::write(&lockfile_path, serde_json::to_string_pretty(&stale).unwrap()).unwrap();

        let supervisor = Supervisor::new(dir.path(), vec![], 1, Duration::from_secs(60));
        assert!(supervisor.acquire_lockfile().is_ok());
    }

    #[tokio::test]
    async fn crashing_child_restarts_up_to_budget_then_goes_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let specs = vec![spec("flaky", "sh", &["-c", "exit 1"])];
        let supervisor = Arc::new(Supervisor::new(dir.path(), specs, 1, Duration::from_millis(50)));

        supervisor.start_all().await;
        let scan = tokio::spawn(supervisor.clone().run_health_scan_loop());

        // restart_budget=1 with a 5s fixed backoff between restarts means
        // this settles well within a handful of seconds.
        tokio::time::sleep(Duration::from_secs(11)).await;
        scan.abort();

        let statuses = supervisor.statuses().await;
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].terminal);
        assert_eq!(statuses[0].restart_count, 1);
    }
}
