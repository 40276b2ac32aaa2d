//! Status file storage (`status.txt`): one `key=value` per line.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use tracing::debug;

use crate::core::run_state::RunState;
use crate::core::types::RunStatus;
use crate::io::paths::write_atomic;

/// Everything recorded in the status file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub status: RunStatus,
    pub round: u32,
    pub max_rounds: u32,
    pub tokens: u64,
    /// RFC 3339 time of the write.
    pub updated_at: String,
    pub error: Option<String>,
    pub archive: Option<PathBuf>,
    pub packaging_error: Option<String>,
}

impl StatusSnapshot {
    pub fn from_state(state: &RunState) -> Self {
        Self {
            status: state.status(),
            round: state.round(),
            max_rounds: state.max_rounds(),
            tokens: state.usage().total(),
            updated_at: Utc::now().to_rfc3339(),
            error: state.last_error().map(str::to_string),
            archive: None,
            packaging_error: None,
        }
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "status={}\nround={}\nmax_rounds={}\ntokens={}\nupdated_at={}\n",
            self.status, self.round, self.max_rounds, self.tokens, self.updated_at
        );
        if let Some(error) = &self.error {
            out.push_str(&format!("error={}\n", single_line(error)));
        }
        if let Some(archive) = &self.archive {
            out.push_str(&format!("archive={}\n", archive.display()));
        }
        if let Some(error) = &self.packaging_error {
            out.push_str(&format!("packaging_error={}\n", single_line(error)));
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut status = None;
        let mut snapshot = Self {
            status: RunStatus::Pending,
            round: 0,
            max_rounds: 0,
            tokens: 0,
            updated_at: String::new(),
            error: None,
            archive: None,
            packaging_error: None,
        };
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed status line '{line}'"))?;
            match key {
                "status" => status = Some(parse_status(value)?),
                "round" => snapshot.round = parse_number(key, value)?,
                "max_rounds" => snapshot.max_rounds = parse_number(key, value)?,
                "tokens" => snapshot.tokens = parse_number(key, value)?,
                "updated_at" => snapshot.updated_at = value.to_string(),
                "error" => snapshot.error = Some(value.to_string()),
                "archive" => snapshot.archive = Some(PathBuf::from(value)),
                "packaging_error" => snapshot.packaging_error = Some(value.to_string()),
                _ => debug!(key, "ignoring unknown status key"),
            }
        }
        snapshot.status = status.ok_or_else(|| anyhow!("status file has no status line"))?;
        Ok(snapshot)
    }
}

fn parse_status(value: &str) -> Result<RunStatus> {
    let status = match value {
        "Pending" => RunStatus::Pending,
        "Running" => RunStatus::Running,
        "Succeeded" => RunStatus::Succeeded,
        "Failed" => RunStatus::Failed,
        "TimedOut" => RunStatus::TimedOut,
        other => bail!("unknown status '{other}'"),
    };
    Ok(status)
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("invalid {key} value '{value}'"))
}

fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Atomically replace the status file.
pub fn write_status(path: &Path, snapshot: &StatusSnapshot) -> Result<()> {
    debug!(path = %path.display(), status = %snapshot.status, round = snapshot.round, "writing status");
    write_atomic(path, snapshot.render().as_bytes())
        .with_context(|| format!("write status {}", path.display()))
}

pub fn read_status(path: &Path) -> Result<StatusSnapshot> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read status {}", path.display()))?;
    StatusSnapshot::parse(&contents).with_context(|| format!("parse status {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_file_is_key_value_and_reads_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("status.txt");
        let mut state = RunState::new(3);
        state.start().expect("start");
        state.begin_round().expect("round");
        state.fail("round budget exhausted\nwithout completion").expect("fail");

        let mut snapshot = StatusSnapshot::from_state(&state);
        snapshot.archive = Some(temp.path().join("output.tar.gz"));
        write_status(&path, &snapshot).expect("write");

        let contents = fs::read_to_string(&path).expect("read");
        assert!(contents.starts_with("status=Failed\nround=1\nmax_rounds=3\ntokens=0\n"));
        assert!(contents.contains("error=round budget exhausted without completion\n"));

        let loaded = read_status(&path).expect("read back");
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.archive, snapshot.archive);
        assert_eq!(loaded.updated_at, snapshot.updated_at);
    }

    #[test]
    fn missing_status_line_is_rejected() {
        assert!(StatusSnapshot::parse("round=1\n").is_err());
        assert!(StatusSnapshot::parse("status=Exploded\n").is_err());
    }
}
