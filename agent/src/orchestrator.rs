//! Orchestration for one task run: `Pending -> Running -> terminal`.
//!
//! Each round asks the provider client for a plan, screens every action with
//! the validator, executes the allowed ones in proposed order, and appends the
//! round to the run log. Terminal states write the status file and package the
//! workspace exactly once.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::remaining_budget;
use crate::core::context::PromptContext;
use crate::core::parser::parse;
use crate::core::run_state::RunState;
use crate::core::types::{Action, ExecutionResult, Outcome, RoundLog, RunStatus, TokenUsage};
use crate::core::validator::CommandValidator;
use crate::io::config::{AgentConfig, EnvLookup};
use crate::io::executor::{ExecutorSettings, SandboxedExecutor};
use crate::io::packager::package;
use crate::io::paths::{FsResolver, WorkspacePaths};
use crate::io::prompt::{KICKOFF_MESSAGE, PromptRenderer};
use crate::io::provider::{ProviderClient, ProviderError, Sleeper, ThreadSleeper, build_providers};
use crate::io::run_log::{LogEvent, RunLogWriter};
use crate::io::status::{StatusSnapshot, write_status};
use crate::io::task::read_task;

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// False when the run aborted before reaching `Running`.
    pub started: bool,
    pub rounds: u32,
    pub usage: TokenUsage,
    pub error: Option<String>,
    pub archive: Option<PathBuf>,
    pub packaging_error: Option<String>,
    pub status_path: PathBuf,
    pub log_path: PathBuf,
}

/// How a round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundEnd {
    /// The model signalled completion or proposed no further work.
    Completed,
    /// Feed the results back and plan again.
    Continue,
    /// The run deadline passed mid-round.
    DeadlineExceeded,
}

pub struct Orchestrator<'a, S> {
    config: &'a AgentConfig,
    paths: WorkspacePaths,
    client: ProviderClient<S>,
    validator: CommandValidator<FsResolver>,
    executor: SandboxedExecutor,
    renderer: PromptRenderer,
    log: RunLogWriter,
}

impl<'a, S: Sleeper> Orchestrator<'a, S> {
    /// `paths` must come from [`WorkspacePaths::prepare`].
    pub fn new(
        config: &'a AgentConfig,
        paths: WorkspacePaths,
        client: ProviderClient<S>,
        env: EnvLookup<'_>,
    ) -> Result<Self> {
        let validator = CommandValidator::new(config.validator_policy(), FsResolver);
        let executor =
            SandboxedExecutor::new(&paths.root, ExecutorSettings::from_config(config), env);
        let renderer = PromptRenderer::new().context("load prompt templates")?;
        let log = RunLogWriter::new(&paths.log_path, config.max_log_bytes, config.max_log_lines);
        Ok(Self {
            config,
            paths,
            client,
            validator,
            executor,
            renderer,
            log,
        })
    }

    /// Drive the task to a terminal state.
    ///
    /// Errors are reserved for an unusable workspace (the status file cannot
    /// be written); every other failure, including run log trouble, ends in a
    /// terminal status.
    #[instrument(skip_all, fields(root = %self.paths.root.display()))]
    pub fn run(&self) -> Result<RunOutcome> {
        let deadline = Instant::now() + self.config.run_timeout();
        let mut state = RunState::new(self.config.max_rounds);
        if let Err(err) = self.log.prune_if_needed() {
            warn!(err = %format!("{err:#}"), "run log rotation failed");
        }
        self.write_status(&state)?;

        let task = match read_task(&self.paths, self.config.security_validation) {
            Ok(task) => task,
            Err(err) => return self.abort(&mut state, format!("{err:#}")),
        };
        if !self.client.has_available_provider() {
            let envs: Vec<&str> = self
                .config
                .providers
                .iter()
                .map(|provider| provider.api_key_env.as_str())
                .collect();
            return self.abort(
                &mut state,
                format!("no provider credentials configured (set {})", envs.join(" or ")),
            );
        }

        state.start().map_err(|e| anyhow!(e))?;
        self.write_status(&state)?;
        self.record(&LogEvent::RunStarted {
            task: task.description.clone(),
            workspace: self.paths.root.clone(),
            max_rounds: self.config.max_rounds,
            providers: self
                .client
                .providers()
                .iter()
                .map(|provider| provider.name().to_string())
                .collect(),
        });
        info!(max_rounds = self.config.max_rounds, "run started");

        let system = self.renderer.system_prompt(
            &task,
            self.config.max_rounds,
            self.config.command_timeout_secs,
        )?;
        let mut context = PromptContext::new(system);
        context.push_user(KICKOFF_MESSAGE);

        loop {
            if remaining_budget(deadline).is_err() {
                state.time_out().map_err(|e| anyhow!(e))?;
                break;
            }
            if !state.rounds_remaining() {
                let message = format!(
                    "round budget of {} exhausted without completion",
                    state.max_rounds()
                );
                state.fail(message).map_err(|e| anyhow!(e))?;
                break;
            }
            let round = state.begin_round().map_err(|e| anyhow!(e))?;
            self.write_status(&state)?;

            let (round_log, end) = self.run_round(round, &mut context, &mut state, deadline);
            self.record(&LogEvent::Round(round_log.clone()));
            info!(
                round,
                actions = round_log.results.len(),
                denied = round_log.denied_count(),
                end = ?end,
                "round finished"
            );

            match end {
                RoundEnd::Completed => {
                    state.succeed().map_err(|e| anyhow!(e))?;
                    break;
                }
                RoundEnd::DeadlineExceeded => {
                    state.time_out().map_err(|e| anyhow!(e))?;
                    break;
                }
                RoundEnd::Continue => {
                    let remaining = state.max_rounds().saturating_sub(state.round());
                    if remaining > 0 {
                        let feedback = self.renderer.round_feedback(&round_log, remaining)?;
                        context.push_user(feedback);
                    }
                }
            }
        }

        self.finish(&state)
    }

    fn run_round(
        &self,
        round: u32,
        context: &mut PromptContext,
        state: &mut RunState,
        deadline: Instant,
    ) -> (RoundLog, RoundEnd) {
        let started = Instant::now();
        let mut log = RoundLog {
            round,
            started_at: Utc::now().to_rfc3339(),
            duration_ms: 0,
            provider: None,
            model: None,
            usage: TokenUsage::default(),
            done: false,
            provider_error: None,
            parse_error: None,
            results: Vec::new(),
        };

        let end = match self.client.complete(context, deadline) {
            Err(ProviderError::DeadlineExceeded) => {
                log.provider_error = Some(ProviderError::DeadlineExceeded.to_string());
                RoundEnd::DeadlineExceeded
            }
            Err(err) => {
                warn!(round, err = %err, "no plan this round");
                let message = err.to_string();
                state.note_error(message.clone());
                log.provider_error = Some(message);
                RoundEnd::Continue
            }
            Ok(response) => {
                state.record_usage(response.usage);
                log.provider = Some(response.provider);
                log.model = Some(response.model);
                log.usage = response.usage;
                context.push_assistant(response.text.clone());

                match parse(&response.text) {
                    Err(err) => {
                        warn!(round, err = %err, "reply could not be parsed");
                        state.note_error(format!("parse error: {err}"));
                        log.parse_error = Some(err.reason);
                        RoundEnd::Continue
                    }
                    Ok(plan) => {
                        log.done = plan.done;
                        log.results = self.apply_plan(&plan.actions, deadline);
                        let cancelled = log
                            .results
                            .iter()
                            .any(|result| result.outcome == Outcome::Cancelled);
                        // The last command may have been cut short by the run deadline.
                        if cancelled || remaining_budget(deadline).is_err() {
                            RoundEnd::DeadlineExceeded
                        } else if plan.done || !plan.proposes_work() {
                            RoundEnd::Completed
                        } else {
                            RoundEnd::Continue
                        }
                    }
                }
            }
        };

        log.duration_ms = started.elapsed().as_millis() as u64;
        (log, end)
    }

    /// Validate and execute every action, recording results in proposed order.
    fn apply_plan(&self, actions: &[Action], deadline: Instant) -> Vec<ExecutionResult> {
        let mut results = Vec::with_capacity(actions.len());
        for (index, action) in actions.iter().enumerate() {
            let verdict = self.validator.validate(action, index, &self.paths.root);
            if !verdict.is_allowed() {
                warn!(
                    index,
                    kind = verdict.action.kind.as_str(),
                    target = %verdict.action.target,
                    reason = ?verdict.reason,
                    detail = ?verdict.detail,
                    "action denied"
                );
                results.push(ExecutionResult::not_executed(verdict, Outcome::Denied));
                continue;
            }
            if remaining_budget(deadline).is_err() {
                debug!(index, "run deadline passed, cancelling action");
                results.push(ExecutionResult::not_executed(verdict, Outcome::Cancelled));
                continue;
            }
            results.push(self.executor.execute(action, &verdict, deadline));
        }
        results
    }

    /// Startup failure: straight to `Failed`, no packaging.
    fn abort(&self, state: &mut RunState, error: String) -> Result<RunOutcome> {
        warn!(err = %error, "run aborted before start");
        state.fail(error).map_err(|e| anyhow!(e))?;
        self.write_status(state)?;
        self.log_finished(state);
        Ok(self.outcome(state, false, None, None))
    }

    /// Terminal bookkeeping: status, run log, then the archive.
    fn finish(&self, state: &RunState) -> Result<RunOutcome> {
        info!(status = %state.status(), rounds = state.round(), "run finished");
        self.write_status(state)?;
        self.log_finished(state);

        let mut snapshot = StatusSnapshot::from_state(state);
        let (archive, packaging_error) = match package(&self.paths.root) {
            Ok(report) => {
                self.record(&LogEvent::Packaged {
                    archive: Some(report.archive.clone()),
                    entries: Some(report.entries.len()),
                    error: None,
                });
                (Some(report.archive), None)
            }
            Err(err) => {
                let message = err.to_string();
                self.record(&LogEvent::Packaged {
                    archive: None,
                    entries: None,
                    error: Some(message.clone()),
                });
                (None, Some(message))
            }
        };
        snapshot.archive = archive.clone();
        snapshot.packaging_error = packaging_error.clone();
        write_status(&self.paths.status_path, &snapshot)?;

        Ok(self.outcome(state, true, archive, packaging_error))
    }

    fn log_finished(&self, state: &RunState) {
        self.record(&LogEvent::RunFinished {
            status: state.status(),
            rounds: state.round(),
            tokens: state.usage().total(),
            error: state.last_error().map(str::to_string),
        });
    }

    /// Append to the run log. Commands can tamper with the file, so a failed
    /// append is logged and the run carries on.
    fn record(&self, event: &LogEvent) {
        if let Err(err) = self.log.append(event) {
            warn!(err = %format!("{err:#}"), "run log append failed");
        }
    }

    fn write_status(&self, state: &RunState) -> Result<()> {
        write_status(&self.paths.status_path, &StatusSnapshot::from_state(state))
    }

    fn outcome(
        &self,
        state: &RunState,
        started: bool,
        archive: Option<PathBuf>,
        packaging_error: Option<String>,
    ) -> RunOutcome {
        RunOutcome {
            status: state.status(),
            started,
            rounds: state.round(),
            usage: state.usage(),
            error: state.last_error().map(str::to_string),
            archive,
            packaging_error,
            status_path: self.paths.status_path.clone(),
            log_path: self.paths.log_path.clone(),
        }
    }
}

/// Run the task in `config.workspace_dir` against the configured providers.
pub fn run_task(config: &AgentConfig, env: EnvLookup<'_>) -> Result<RunOutcome> {
    let paths = WorkspacePaths::prepare(&config.workspace_dir)?;
    let providers = build_providers(config, env)?;
    let client = ProviderClient::new(providers, config.retry_policy(), ThreadSleeper);
    let orchestrator = Orchestrator::new(config, paths, client, env)?;
    orchestrator.run()
}
