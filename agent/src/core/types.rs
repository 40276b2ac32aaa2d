//! Shared deterministic types for the agent engine.
//!
//! These types define stable contracts between the parser, validator, executor
//! and orchestrator. They must not depend on external state or I/O.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest command or note text copied into an [`ActionRef`].
const ACTION_TARGET_MAX_CHARS: usize = 200;

/// Immutable input for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Free-text description of what to build.
    pub description: String,
    /// When the task was read.
    pub created_at: DateTime<Utc>,
    /// The only directory tree the run may mutate.
    pub workspace_root: PathBuf,
}

impl Task {
    pub fn new(
        description: impl Into<String>,
        workspace_root: impl Into<PathBuf>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            description: description.into(),
            created_at,
            workspace_root: workspace_root.into(),
        }
    }
}

/// One discrete effect proposed by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Create or replace a file inside the workspace.
    WriteFile { path: String, content: String },
    /// Run a shell command inside the workspace.
    RunCommand {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workdir: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    /// Free text. Recorded, never executed.
    Note { text: String },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::WriteFile { .. } => ActionKind::WriteFile,
            Action::RunCommand { .. } => ActionKind::RunCommand,
            Action::Note { .. } => ActionKind::Note,
        }
    }

    /// Whether this action has a real-world effect once executed.
    pub fn is_effectful(&self) -> bool {
        !matches!(self, Action::Note { .. })
    }

    /// Build the log-friendly reference for the action at `index` in its plan.
    pub fn reference(&self, index: usize) -> ActionRef {
        let target = match self {
            Action::WriteFile { path, .. } => path.clone(),
            Action::RunCommand { command, .. } => truncate_chars(command, ACTION_TARGET_MAX_CHARS),
            Action::Note { text } => truncate_chars(text.trim(), ACTION_TARGET_MAX_CHARS),
        };
        ActionRef {
            index,
            kind: self.kind(),
            target,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    WriteFile,
    RunCommand,
    Note,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::WriteFile => "write_file",
            ActionKind::RunCommand => "run_command",
            ActionKind::Note => "note",
        }
    }
}

/// Stable, size-bounded pointer to an action within its round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRef {
    /// Zero-based position in the plan.
    pub index: usize,
    pub kind: ActionKind,
    /// Path for writes, (truncated) command line for commands, note excerpt for notes.
    pub target: String,
}

/// Ordered actions produced by one model response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Plan {
    pub actions: Vec<Action>,
    /// Explicit completion marker from the model.
    pub done: bool,
}

impl Plan {
    /// True when at least one action would touch the workspace.
    pub fn proposes_work(&self) -> bool {
        self.actions.iter().any(Action::is_effectful)
    }
}

/// Validator decision for one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
}

/// Why an action was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// A path resolves outside the workspace root.
    PathEscape,
    /// The executable is on the configured denylist.
    ForbiddenExecutable,
    /// `$(...)` or backtick command substitution.
    CommandSubstitution,
    /// A trailing or embedded `&` background operator.
    BackgroundExecution,
    /// Output piped into a shell or network client.
    RemotePipe,
    /// Matches a known destructive or exfiltration pattern.
    DangerousPattern,
    /// File content exceeds the configured size limit.
    PayloadTooLarge,
    /// Write targets one of the engine's own control files.
    ControlFile,
    /// Empty or unparseable command or path.
    Malformed,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::PathEscape => "path_escape",
            DenyReason::ForbiddenExecutable => "forbidden_executable",
            DenyReason::CommandSubstitution => "command_substitution",
            DenyReason::BackgroundExecution => "background_execution",
            DenyReason::RemotePipe => "remote_pipe",
            DenyReason::DangerousPattern => "dangerous_pattern",
            DenyReason::PayloadTooLarge => "payload_too_large",
            DenyReason::ControlFile => "control_file",
            DenyReason::Malformed => "malformed",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validator output. Lives only for the round that produced it (and its log).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityVerdict {
    pub action: ActionRef,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
    /// Human-readable specifics (offending token, matched pattern, sizes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl SecurityVerdict {
    pub fn allow(action: ActionRef) -> Self {
        Self {
            action,
            decision: Decision::Allow,
            reason: None,
            detail: None,
        }
    }

    pub fn deny(action: ActionRef, reason: DenyReason, detail: impl Into<String>) -> Self {
        Self {
            action,
            decision: Decision::Deny,
            reason: Some(reason),
            detail: Some(detail.into()),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }
}

/// What happened when an action was applied (or refused).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// File written successfully.
    Written { bytes: u64 },
    /// Command ran to completion. `code` is `None` when killed by a signal.
    Exited { code: Option<i32> },
    /// Command exceeded its timeout and its process tree was terminated.
    TimedOut { timeout_ms: u64 },
    /// Note recorded, nothing executed.
    Noted,
    /// Validator refused the action; nothing executed.
    Denied,
    /// Not attempted because the run deadline passed earlier in the round.
    Cancelled,
    /// The executor could not apply the action (spawn or I/O failure).
    Error { message: String },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Outcome::Written { .. } | Outcome::Exited { code: Some(0) } | Outcome::Noted
        )
    }
}

/// Per-action result, recorded in proposal order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub verdict: SecurityVerdict,
    pub outcome: Outcome,
    /// Captured stdout (bounded, with a truncation marker when cut).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    /// Captured stderr (bounded, with a truncation marker when cut).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// Result for an action that never reached the executor.
    pub fn not_executed(verdict: SecurityVerdict, outcome: Outcome) -> Self {
        Self {
            verdict,
            outcome,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
        }
    }
}

/// Token accounting reported by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// Everything that happened in one plan-validate-execute cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundLog {
    pub round: u32,
    /// RFC 3339 timestamp of round start.
    pub started_at: String,
    pub duration_ms: u64,
    /// Provider that produced the plan, if any succeeded.
    pub provider: Option<String>,
    pub model: Option<String>,
    pub usage: TokenUsage,
    /// Completion marker from the model's plan.
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
    pub results: Vec<ExecutionResult>,
}

impl RoundLog {
    pub fn denied_count(&self) -> usize {
        self.results
            .iter()
            .filter(|result| !result.verdict.is_allowed())
            .count()
    }
}

/// Lifecycle status of a run. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "Pending",
            RunStatus::Running => "Running",
            RunStatus::Succeeded => "Succeeded",
            RunStatus::Failed => "Failed",
            RunStatus::TimedOut => "TimedOut",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Truncate to at most `max` characters, appending `...` when cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push_str("...");
    out
}
