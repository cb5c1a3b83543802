//! Backend selection for C3 SlaveExecutor's `/execute` endpoint: container
//! -> venv -> interpreter, in that order, degrading silently to the next
//! tier when a preferred backend is unavailable (spec §4.3).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Container,
    Venv,
    Interpreter,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Container => "container",
            Backend::Venv => "venv",
            Backend::Interpreter => "interpreter",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendAvailability {
    pub container_image: Option<String>,
    pub venv_python: Option<PathBuf>,
}

impl BackendAvailability {
    /// Probed once at startup: is `docker`/`podman` on PATH and does the
    /// configured executor image exist locally? Does a project-local
    /// virtualenv exist under the working root?
    pub fn detect(working_root: &Path, container_image: Option<String>) -> Self {
        let container_image = container_image.filter(|_| which("docker") || which("podman"));

        let venv_python = ["venv", ".venv"]
            .iter()
            .map(|name| working_root.join(name).join("bin").join("python"))
            .find(|p| p.exists());

        Self {
            container_image,
            venv_python,
        }
    }

    pub fn select(&self) -> Backend {
        if self.container_image.is_some() {
            Backend::Container
        } else if self.venv_python.is_some() {
            Backend::Venv
        } else {
            Backend::Interpreter
        }
    }

    pub fn methods_map(&self) -> serde_json::Value {
        serde_json::json!({
            "container": self.container_image.is_some(),
            "venv": self.venv_python.is_some(),
            "interpreter": true,
        })
    }
}

fn which(bin: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(bin).exists())
        })
        .unwrap_or(false)
}

pub struct ExecutionOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub method: Backend,
    pub exit_code: i32,
}

/// Runs `command` on the selected backend, enforcing `timeout`. On expiry,
/// kills the child process tree and returns the documented timeout shape
/// (spec §4.3).
pub async fn execute(
    availability: &BackendAvailability,
    working_dir: &Path,
    command: &str,
    timeout: std::time::Duration,
) -> ExecutionOutcome {
    let backend = availability.select();

    let mut cmd = match backend {
        Backend::Container => container_command(availability, working_dir, command),
        Backend::Venv => venv_command(availability, working_dir, command),
        Backend::Interpreter => interpreter_command(working_dir, command),
    };

    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(error = %e, backend = backend.as_str(), "failed to spawn backend process");
            return ExecutionOutcome {
                success: false,
                stdout: String::new(),
                stderr: format!("failed to start backend: {e}"),
                method: backend,
                exit_code: -1,
            };
        }
    };

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let wait = async {
        let status = child.wait().await;
        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut pipe) = stdout_pipe.take() {
            let _ = pipe.read_to_string(&mut stdout).await;
        }
        if let Some(mut pipe) = stderr_pipe.take() {
            let _ = pipe.read_to_string(&mut stderr).await;
        }
        (status, stdout, stderr)
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok((status, stdout, stderr)) => {
            let status = status.unwrap_or_default();
            ExecutionOutcome {
                success: status.success(),
                stdout,
                stderr,
                method: backend,
                exit_code: status.code().unwrap_or(-1),
            }
        }
        Err(_) => {
            debug!(backend = backend.as_str(), "execution timed out, killing child");
            let _ = child.kill().await;
            ExecutionOutcome {
                success: false,
                stdout: String::new(),
                stderr: format!("<timeout after {} s>", timeout.as_secs()),
                method: backend,
                exit_code: -1,
            }
        }
    }
}

fn container_command(availability: &BackendAvailability, working_dir: &Path, command: &str) -> Command {
    let image = availability
        .container_image
        .clone()
        .unwrap_or_else(|| "scratch".to_string());
    let runtime = if which("docker") { "docker" } else { "podman" };

    let mut cmd = Command::new(runtime);
    cmd.arg("run")
        .arg("--rm")
        .arg("--network")
        .arg("bridge")
        .arg("-v")
        .arg(format!("{}:/workspace:rw", working_dir.display()))
        .arg("-w")
        .arg("/workspace")
        .arg(image)
        .arg("sh")
        .arg("-c")
        .arg(command);
    cmd
}

fn venv_command(availability: &BackendAvailability, working_dir: &Path, command: &str) -> Command {
    let python = availability
        .venv_python
        .clone()
        .unwrap_or_else(|| PathBuf::from("python3"));
    let mut cmd = Command::new("sh");
    cmd.current_dir(working_dir)
        .env("PATH", prepend_to_path(&python))
        .arg("-c")
        .arg(command);
    cmd
}

fn interpreter_command(working_dir: &Path, command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.current_dir(working_dir).arg("-c").arg(command);
    cmd
}

fn prepend_to_path(python: &Path) -> std::ffi::OsString {
    let bin_dir = python.parent().map(|p| p.to_path_buf());
    let existing = std::env::var_os("PATH").unwrap_or_default();
    match bin_dir {
        Some(dir) => {
            let mut paths = vec![dir];
            paths.extend(std::env::split_paths(&existing));
            std::env::join_paths(paths).unwrap_or(existing)
        }
        None => existing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_prefers_container_then_venv_then_interpreter() {
        let both = BackendAvailability {
            container_image: Some("img".into()),
            venv_python: Some("/venv/bin/python".into()),
        };
        assert_eq!(both.select(), Backend::Container);

        let venv_only = BackendAvailability {
            container_image: None,
            venv_python: Some("/venv/bin/python".into()),
        };
        assert_eq!(venv_only.select(), Backend::Venv);

        let neither = BackendAvailability {
            container_image: None,
            venv_python: None,
        };
        assert_eq!(neither.select(), Backend::Interpreter);
    }

    #[tokio::test]
    async fn interpreter_backend_runs_and_captures_stdout() {
        let availability = BackendAvailability {
            container_image: None,
            venv_python: None,
        };
        let dir = tempfile::tempdir().unwrap();
        let outcome = execute(
            &availability,
            dir.path(),
            "echo hello",
            std::time::Duration::from_secs(5),
        )
        .await;
        assert!(outcome.success);
        assert_eq!(outcome.method, Backend::Interpreter);
        assert_eq!(outcome.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn timeout_kills_child_and_reports_failure() {
        let availability = BackendAvailability {
            container_image: None,
            venv_python: None,
        };
        let dir = tempfile::tempdir().unwrap();
        let outcome = execute(
            &availability,
            dir.path(),
            "sleep 5",
            std::time::Duration::from_millis(50),
        )
        .await;
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, -1);
        assert!(outcome.stderr.contains("timeout"));
    }
}
