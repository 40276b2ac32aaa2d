//! Sandboxed executor: the only component that mutates the workspace.
//!
//! It is handed an action together with the validator's verdict and refuses
//! anything not allowed. Commands run through `sh -c` with the workspace as
//! cwd, a scrubbed environment and a hard timeout.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, error, info, instrument, warn};

use crate::core::budget::clamp_to_budget;
use crate::core::path::confine;
use crate::core::types::{Action, ExecutionResult, Outcome, SecurityVerdict};
use crate::core::validator::has_executable_extension;
use crate::io::config::{AgentConfig, EnvLookup};
use crate::io::paths::{FsResolver, write_atomic};
use crate::io::process::run_command_with_timeout;

/// Limits applied to every executed action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub default_timeout: Duration,
    pub output_limit_bytes: usize,
    pub env_allowlist: Vec<String>,
}

impl ExecutorSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            default_timeout: config.command_timeout(),
            output_limit_bytes: config.output_limit_bytes,
            env_allowlist: config.env_allowlist.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxedExecutor {
    root: PathBuf,
    settings: ExecutorSettings,
    /// Allowlisted variables captured once at construction.
    env: Vec<(String, String)>,
}

impl SandboxedExecutor {
    /// `root` must already be canonical.
    pub fn new(root: impl Into<PathBuf>, settings: ExecutorSettings, env: EnvLookup<'_>) -> Self {
        let captured = settings
            .env_allowlist
            .iter()
            .filter(|key| key.as_str() != "HOME")
            .filter_map(|key| env(key).map(|value| (key.clone(), value)))
            .collect();
        Self {
            root: root.into(),
            settings,
            env: captured,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Apply an allowed action and report what happened.
    #[instrument(skip_all, fields(index = verdict.action.index, kind = verdict.action.kind.as_str()))]
    pub fn execute(
        &self,
        action: &Action,
        verdict: &SecurityVerdict,
        deadline: Instant,
    ) -> ExecutionResult {
        if !verdict.is_allowed() {
            error!(action = %verdict.action.target, "refusing to execute a denied action");
            return ExecutionResult::not_executed(verdict.clone(), Outcome::Denied);
        }

        let started = Instant::now();
        let (outcome, stdout, stderr) = match action {
            Action::Note { .. } => (Outcome::Noted, String::new(), String::new()),
            Action::WriteFile { path, content } => match self.write_file(path, content) {
                Ok(bytes) => (Outcome::Written { bytes }, String::new(), String::new()),
                Err(err) => {
                    warn!(path = %path, err = %format!("{err:#}"), "write failed");
                    (error_outcome(&err), String::new(), String::new())
                }
            },
            Action::RunCommand {
                command,
                workdir,
                timeout_secs,
            } => self.run_command(command, workdir.as_deref(), *timeout_secs, deadline),
        };

        ExecutionResult {
            verdict: verdict.clone(),
            outcome,
            stdout,
            stderr,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn write_file(&self, path: &str, content: &str) -> Result<u64> {
        let target = confine(&self.root, path, &FsResolver).map_err(|escape| {
            anyhow!("path '{}' escapes the workspace", escape.candidate)
        })?;
        let parent = target
            .parent()
            .with_context(|| format!("path missing parent {}", target.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
        // A symlink could have appeared since validation; check where the
        // parent really is right before writing.
        let real_parent = fs::canonicalize(parent)
            .with_context(|| format!("resolve directory {}", parent.display()))?;
        if !real_parent.starts_with(&self.root) {
            bail!(
                "directory {} resolves outside the workspace",
                parent.display()
            );
        }
        if has_executable_extension(path) {
            warn!(path = %path, "writing file with executable extension");
        }
        write_atomic(&target, content.as_bytes())?;
        debug!(path = %target.display(), bytes = content.len(), "file written");
        Ok(content.len() as u64)
    }

    fn run_command(
        &self,
        command: &str,
        workdir: Option<&str>,
        timeout_secs: Option<u64>,
        deadline: Instant,
    ) -> (Outcome, String, String) {
        let requested = timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.settings.default_timeout);
        let Ok(timeout) = clamp_to_budget(requested, deadline) else {
            info!("run deadline passed before command start");
            return (Outcome::Cancelled, String::new(), String::new());
        };

        let cwd = match self.command_dir(workdir) {
            Ok(dir) => dir,
            Err(err) => return (error_outcome(&err), String::new(), String::new()),
        };

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("HOME", &self.root);

        info!(command = %command, timeout_ms = timeout.as_millis() as u64, "running command");
        match run_command_with_timeout(cmd, timeout, self.settings.output_limit_bytes) {
            Ok(output) => {
                let outcome = if output.timed_out {
                    Outcome::TimedOut {
                        timeout_ms: timeout.as_millis() as u64,
                    }
                } else {
                    Outcome::Exited {
                        code: output.status.code(),
                    }
                };
                (outcome, output.stdout_text(), output.stderr_text())
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "command could not be run");
                (error_outcome(&err), String::new(), String::new())
            }
        }
    }

    fn command_dir(&self, workdir: Option<&str>) -> Result<PathBuf> {
        let Some(dir) = workdir else {
            return Ok(self.root.clone());
        };
        let path = confine(&self.root, dir, &FsResolver).map_err(|escape| {
            anyhow!("workdir '{}' escapes the workspace", escape.candidate)
        })?;
        if !path.is_dir() {
            bail!("workdir '{dir}' is not a directory");
        }
        Ok(path)
    }
}

fn error_outcome(err: &anyhow::Error) -> Outcome {
    Outcome::Error {
        message: format!("{err:#}"),
    }
}
