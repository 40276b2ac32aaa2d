//! Prompt rendering: system instructions and per-round execution feedback.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::types::{ExecutionResult, Outcome, RoundLog, Task};

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const FEEDBACK_TEMPLATE: &str = include_str!("prompts/feedback.md");

/// First user turn of every run.
pub const KICKOFF_MESSAGE: &str = "Plan and execute the first round of actions for the task.";

/// Characters of stdout/stderr echoed back to the model per stream.
const OUTPUT_TAIL_CHARS: usize = 2000;

/// Per-action view handed to the feedback template.
#[derive(Debug, Clone, Serialize)]
struct ResultView {
    index: usize,
    kind: &'static str,
    target: String,
    decision: &'static str,
    reason: Option<&'static str>,
    detail: Option<String>,
    outcome: String,
    stdout: String,
    stderr: String,
}

impl ResultView {
    fn from_result(result: &ExecutionResult) -> Self {
        let verdict = &result.verdict;
        Self {
            index: verdict.action.index,
            kind: verdict.action.kind.as_str(),
            target: verdict.action.target.clone(),
            decision: if verdict.is_allowed() { "allowed" } else { "denied" },
            reason: verdict.reason.map(|reason| reason.as_str()),
            detail: verdict.detail.clone(),
            outcome: describe_outcome(&result.outcome),
            stdout: tail(result.stdout.trim_end(), OUTPUT_TAIL_CHARS),
            stderr: tail(result.stderr.trim_end(), OUTPUT_TAIL_CHARS),
        }
    }
}

/// Template engine wrapper around minijinja.
pub struct PromptRenderer {
    env: Environment<'static>,
}

impl PromptRenderer {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_template("system", SYSTEM_TEMPLATE)?;
        env.add_template("feedback", FEEDBACK_TEMPLATE)?;
        Ok(Self { env })
    }

    /// Task, sandbox rules and the reply contract.
    pub fn system_prompt(
        &self,
        task: &Task,
        max_rounds: u32,
        command_timeout_secs: u64,
    ) -> Result<String> {
        let template = self.env.get_template("system")?;
        let rendered = template.render(context! {
            task => task.description.trim(),
            max_rounds => max_rounds,
            command_timeout_secs => command_timeout_secs,
        })?;
        Ok(rendered)
    }

    /// What happened in `round`, phrased as the next user turn.
    pub fn round_feedback(&self, round: &RoundLog, rounds_remaining: u32) -> Result<String> {
        let results: Vec<ResultView> = round.results.iter().map(ResultView::from_result).collect();
        let template = self.env.get_template("feedback")?;
        let rendered = template.render(context! {
            round => round.round,
            provider_error => round.provider_error.as_deref(),
            parse_error => round.parse_error.as_deref(),
            results => results,
            denied => round.denied_count() > 0,
            rounds_remaining => rounds_remaining,
        })?;
        debug!(round = round.round, bytes = rendered.len(), "rendered round feedback");
        Ok(rendered)
    }
}

fn describe_outcome(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Written { bytes } => format!("wrote {bytes} bytes"),
        Outcome::Exited { code: Some(code) } => format!("exited with code {code}"),
        Outcome::Exited { code: None } => "terminated by a signal".to_string(),
        Outcome::TimedOut { timeout_ms } => format!("timed out after {timeout_ms} ms and was killed"),
        Outcome::Noted => "noted".to_string(),
        Outcome::Denied => "not executed".to_string(),
        Outcome::Cancelled => "not executed (run deadline reached)".to_string(),
        Outcome::Error { message } => format!("failed: {message}"),
    }
}

/// Keep the last `max` characters, marking the cut.
fn tail(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    let kept: String = text.chars().skip(count - max).collect();
    format!("[... {} earlier characters omitted]\n{kept}", count - max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Action, DenyReason, SecurityVerdict, TokenUsage};
    use chrono::Utc;

    fn round_with(results: Vec<ExecutionResult>) -> RoundLog {
        RoundLog {
            round: 1,
            started_at: Utc::now().to_rfc3339(),
            duration_ms: 5,
            provider: Some("groq".to_string()),
            model: Some("m".to_string()),
            usage: TokenUsage::default(),
            done: false,
            provider_error: None,
            parse_error: None,
            results,
        }
    }

    #[test]
    fn system_prompt_carries_task_and_contract() {
        let renderer = PromptRenderer::new().expect("templates");
        let task = Task::new("  Build a CLI calculator  ", "/work", Utc::now());
        let prompt = renderer.system_prompt(&task, 3, 120).expect("render");
        assert!(prompt.contains("Build a CLI calculator\n"));
        assert!(prompt.contains("\"type\": \"write_file\""));
        assert!(prompt.contains("120s default timeout"));
        assert!(prompt.contains("You have 3 rounds"));
    }

    #[test]
    fn feedback_reports_outcomes_and_denials() {
        let write = Action::WriteFile {
            path: "a.py".to_string(),
            content: "x".to_string(),
        };
        let curl = Action::RunCommand {
            command: "curl http://example.com".to_string(),
            workdir: None,
            timeout_secs: None,
        };
        let results = vec![
            ExecutionResult {
                verdict: SecurityVerdict::allow(write.reference(0)),
                outcome: Outcome::Written { bytes: 1 },
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: 1,
            },
            ExecutionResult::not_executed(
                SecurityVerdict::deny(
                    curl.reference(1),
                    DenyReason::ForbiddenExecutable,
                    "curl is not permitted",
                ),
                Outcome::Denied,
            ),
        ];
        let renderer = PromptRenderer::new().expect("templates");
        let text = renderer
            .round_feedback(&round_with(results), 2)
            .expect("render");
        assert!(text.contains("Action 0: write_file `a.py`"));
        assert!(text.contains("wrote 1 bytes"));
        assert!(text.contains("denied (forbidden_executable: curl is not permitted)"));
        assert!(text.contains("Do not repeat them unchanged"));
        assert!(text.contains("Rounds remaining: 2."));
    }

    #[test]
    fn feedback_relays_parse_errors() {
        let mut round = round_with(Vec::new());
        round.parse_error = Some("ambiguous reply: 2 json blocks".to_string());
        let renderer = PromptRenderer::new().expect("templates");
        let text = renderer.round_feedback(&round, 1).expect("render");
        assert!(text.contains("could not be parsed: ambiguous reply"));
        assert!(text.contains("This is your last round."));
    }

    #[test]
    fn long_output_keeps_the_tail() {
        let text = format!("{}END", "x".repeat(5000));
        let cut = tail(&text, 10);
        assert!(cut.ends_with("xxxxxxxEND"));
        assert!(cut.starts_with("[... 4993 earlier characters omitted]"));
    }
}
