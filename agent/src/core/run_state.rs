//! Run lifecycle state owned by the orchestrator.
//!
//! `Pending -> Running -> {Succeeded, Failed, TimedOut}`. Startup failures may
//! also go straight from `Pending` to `Failed`. Terminal states are final.

use crate::core::types::{RunStatus, TokenUsage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    round: u32,
    max_rounds: u32,
    usage: TokenUsage,
    status: RunStatus,
    last_error: Option<String>,
}

impl RunState {
    pub fn new(max_rounds: u32) -> Self {
        Self {
            round: 0,
            max_rounds,
            usage: TokenUsage::default(),
            status: RunStatus::Pending,
            last_error: None,
        }
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn rounds_remaining(&self) -> bool {
        self.round < self.max_rounds
    }

    pub fn start(&mut self) -> Result<(), String> {
        self.transition(RunStatus::Running)
    }

    /// Advance to the next round and return its 1-based number.
    pub fn begin_round(&mut self) -> Result<u32, String> {
        if self.status != RunStatus::Running {
            return Err(format!("cannot begin a round while {}", self.status));
        }
        if !self.rounds_remaining() {
            return Err(format!("round budget of {} exhausted", self.max_rounds));
        }
        self.round += 1;
        Ok(self.round)
    }

    pub fn record_usage(&mut self, usage: TokenUsage) {
        self.usage.add(usage);
    }

    /// Remember the most recent recoverable error (parse, provider).
    pub fn note_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    pub fn succeed(&mut self) -> Result<(), String> {
        self.transition(RunStatus::Succeeded)?;
        self.last_error = None;
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), String> {
        self.transition(RunStatus::Failed)?;
        self.last_error = Some(error.into());
        Ok(())
    }

    pub fn time_out(&mut self) -> Result<(), String> {
        self.transition(RunStatus::TimedOut)?;
        self.last_error = Some("run deadline exceeded".to_string());
        Ok(())
    }

    fn transition(&mut self, next: RunStatus) -> Result<(), String> {
        let allowed = matches!(
            (self.status, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Succeeded)
                | (RunStatus::Running, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::TimedOut)
        );
        if !allowed {
            return Err(format!(
                "invalid run transition {} -> {}",
                self.status, next
            ));
        }
        self.status = next;
        Ok(())
    }
}
