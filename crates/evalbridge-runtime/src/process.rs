//! Process execution collaborator.
//!
//! Children start from an empty environment. An [`EnvPolicy`] decides which
//! of the bridge's own variables are copied in: a small baseline that lets
//! ordinary commands resolve, plus whatever the configuration allows.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Component, Path};
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, warn};

const BASELINE_VARS: &[&str] = &["PATH", "HOME", "TMPDIR", "LANG", "LC_ALL", "TERM"];

const BASELINE_VARS_WINDOWS: &[&str] = &["SYSTEMROOT", "USERPROFILE", "COMSPEC", "PATHEXT"];

/// Names of this process's environment variables a child may inherit.
#[derive(Debug, Clone, Default)]
pub struct EnvPolicy {
    allowed: Vec<String>,
}

impl EnvPolicy {
    /// Baseline plus `allowed`.
    pub fn allowing(allowed: Vec<String>) -> Self {
        Self { allowed }
    }

    /// Current values of the permitted variables. Unset ones are left out.
    pub fn resolve(&self) -> BTreeMap<String, String> {
        let platform: &[&str] = if cfg!(windows) {
            BASELINE_VARS_WINDOWS
        } else {
            &[]
        };
        BASELINE_VARS
            .iter()
            .chain(platform)
            .map(|name| name.to_string())
            .chain(self.allowed.iter().cloned())
            .filter_map(|name| std::env::var(&name).ok().map(|value| (name, value)))
            .collect()
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs a command to completion.
#[async_trait]
pub trait ProcessRunner: Send + Sync + 'static {
    async fn run(&self, cmd: &str, args: &[String]) -> Result<ProcessOutput, String>;
}

/// Runs commands as local child processes under an [`EnvPolicy`].
#[derive(Debug, Clone)]
pub struct LocalProcessRunner {
    timeout: Duration,
    env: EnvPolicy,
}

impl LocalProcessRunner {
    pub fn new(timeout: Duration, allowed_env_vars: Vec<String>) -> Self {
        Self {
            timeout,
            env: EnvPolicy::allowing(allowed_env_vars),
        }
    }
}

impl Default for LocalProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Vec::new())
    }
}

/// A program must be named, and may not reach outside through `..`.
fn check_program(cmd: &str) -> Result<(), String> {
    if cmd.is_empty() {
        return Err("empty command".to_string());
    }
    if Path::new(cmd)
        .components()
        .any(|c| c == Component::ParentDir)
    {
        return Err(format!("refusing to run '{cmd}': parent-directory components"));
    }
    Ok(())
}

#[async_trait]
impl ProcessRunner for LocalProcessRunner {
    async fn run(&self, cmd: &str, args: &[String]) -> Result<ProcessOutput, String> {
        check_program(cmd)?;

        let mut command = tokio::process::Command::new(cmd);
        command
            .args(args)
            .env_clear()
            .envs(self.env.resolve())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(cmd, args = ?args, "Spawning process");
        let child = command
            .spawn()
            .map_err(|e| format!("failed to spawn '{cmd}': {e}"))?;

        // Dropping the future on timeout kills the child.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| format!("failed to wait for '{cmd}': {e}"))?,
            Err(_) => {
                warn!(cmd, timeout_secs = self.timeout.as_secs(), "Process timed out");
                return Err(format!(
                    "'{cmd}' timed out after {}s",
                    self.timeout.as_secs_f64()
                ));
            }
        };

        let result = ProcessOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(cmd, exit_code = ?result.exit_code, "Process finished");
        Ok(result)
    }
}
