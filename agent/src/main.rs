//! Autonomous coding agent CLI.
//!
//! Reads `task.txt` from the workspace, plans with an LLM provider, executes
//! screened actions inside the workspace and packages `output.tar.gz`.

use std::path::{Path, PathBuf};

use agent::core::types::RunStatus;
use agent::exit_codes;
use agent::io::config::{AgentConfig, load_config, process_env};
use agent::io::packager::package;
use agent::io::paths::WorkspacePaths;
use agent::io::provider::resolve_credential;
use agent::logging;
use agent::orchestrator::{RunOutcome, run_task};
use anyhow::Result;
use clap::{Parser, Subcommand};

const DEFAULT_CONFIG: &str = "agent.toml";

#[derive(Parser)]
#[command(
    name = "agent",
    version,
    about = "Autonomous coding agent: plan, screen, execute, package"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the task in `task.txt` to a terminal state and package the workspace.
    Run {
        /// Workspace directory (overrides config and WORKSPACE_DIR).
        #[arg(short, long)]
        workspace: Option<PathBuf>,
        /// TOML config file (defaults to ./agent.toml when present).
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Validate configuration and report which providers have credentials.
    Check {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Package the workspace into `output.tar.gz` without running a task.
    Package {
        #[arg(short, long)]
        workspace: Option<PathBuf>,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { workspace, config } => {
            let cfg = load(config.as_deref(), workspace)?;
            logging::init(&cfg.log_level);
            let outcome = run_task(&cfg, &process_env)?;
            print_summary(&outcome);
            if !outcome.started {
                return Ok(exit_codes::INVALID);
            }
            Ok(exit_code(outcome.status))
        }
        Command::Check { config } => {
            let cfg = load(config.as_deref(), None)?;
            Ok(cmd_check(&cfg))
        }
        Command::Package { workspace, config } => {
            let cfg = load(config.as_deref(), workspace)?;
            logging::init(&cfg.log_level);
            let paths = WorkspacePaths::prepare(&cfg.workspace_dir)?;
            let report = package(&paths.root)?;
            println!(
                "packaged {} files into {}",
                report.entries.len(),
                report.archive.display()
            );
            Ok(exit_codes::OK)
        }
    }
}

fn load(config: Option<&Path>, workspace: Option<PathBuf>) -> Result<AgentConfig> {
    let path = config.unwrap_or(Path::new(DEFAULT_CONFIG));
    let mut cfg = load_config(Some(path), &process_env)?;
    if let Some(dir) = workspace {
        cfg.workspace_dir = dir;
    }
    Ok(cfg)
}

fn cmd_check(cfg: &AgentConfig) -> i32 {
    println!("workspace:       {}", cfg.workspace_dir.display());
    println!("max rounds:      {}", cfg.max_rounds);
    println!("command timeout: {}s", cfg.command_timeout_secs);
    println!("run deadline:    {}s", cfg.run_timeout().as_secs());
    println!(
        "security:        {}",
        if cfg.security_validation { "enabled" } else { "disabled (path confinement only)" }
    );
    println!("providers:");
    let mut any_available = false;
    for provider in &cfg.providers {
        let present = resolve_credential(&provider.api_key_env, &process_env).is_some();
        any_available |= present;
        println!(
            "  {:<8} {:<28} {} ({})",
            provider.kind.as_str(),
            provider.model,
            provider.api_key_env,
            if present { "present" } else { "missing" }
        );
    }
    if any_available {
        exit_codes::OK
    } else {
        eprintln!("no provider has credentials; `agent run` would abort");
        exit_codes::INVALID
    }
}

fn print_summary(outcome: &RunOutcome) {
    println!();
    println!("status:  {}", outcome.status);
    println!("rounds:  {}", outcome.rounds);
    println!("tokens:  {}", outcome.usage.total());
    if let Some(error) = &outcome.error {
        println!("error:   {error}");
    }
    match (&outcome.archive, &outcome.packaging_error) {
        (Some(archive), _) => println!("archive: {}", archive.display()),
        (None, Some(error)) => println!("archive: not written ({error})"),
        (None, None) => {}
    }
    println!("status file: {}", outcome.status_path.display());
    println!("run log:     {}", outcome.log_path.display());
}

fn exit_code(status: RunStatus) -> i32 {
    match status {
        RunStatus::Succeeded => exit_codes::OK,
        RunStatus::TimedOut => exit_codes::TIMED_OUT,
        RunStatus::Failed | RunStatus::Pending | RunStatus::Running => exit_codes::FAILED,
    }
}
