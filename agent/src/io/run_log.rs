//! Append-only JSON-lines run log (`log.txt`) with oldest-entry rotation.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::types::{RoundLog, RunStatus};
use crate::io::paths::write_atomic;

/// One run log record.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LogEvent {
    RunStarted {
        task: String,
        workspace: PathBuf,
        max_rounds: u32,
        providers: Vec<String>,
    },
    Round(RoundLog),
    RunFinished {
        status: RunStatus,
        rounds: u32,
        tokens: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Packaged {
        #[serde(skip_serializing_if = "Option::is_none")]
        archive: Option<PathBuf>,
        #[serde(skip_serializing_if = "Option::is_none")]
        entries: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

#[derive(Debug, Serialize)]
struct LogRecord<'a> {
    ts: String,
    #[serde(flatten)]
    event: &'a LogEvent,
}

#[derive(Debug, Clone)]
pub struct RunLogWriter {
    path: PathBuf,
    max_bytes: u64,
    max_lines: usize,
}

impl RunLogWriter {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64, max_lines: usize) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            max_lines,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record, then rotate if the file grew past its cap.
    pub fn append(&self, event: &LogEvent) -> Result<()> {
        let record = LogRecord {
            ts: Utc::now().to_rfc3339(),
            event,
        };
        let mut line = serde_json::to_string(&record).context("serialize run log record")?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open run log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append run log {}", self.path.display()))?;
        drop(file);

        self.prune_if_needed()
    }

    /// Once the file exceeds `max_bytes`, keep the newest lines that fit in
    /// both `max_lines` and `max_bytes`.
    ///
    /// Works on raw bytes: commands run in the workspace may have left
    /// anything in the file.
    pub fn prune_if_needed(&self) -> Result<()> {
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err).with_context(|| format!("stat run log {}", self.path.display()));
            }
        };
        if size <= self.max_bytes {
            return Ok(());
        }

        let contents =
            fs::read(&self.path).with_context(|| format!("read run log {}", self.path.display()))?;
        let lines: Vec<&[u8]> = contents
            .split(|byte| *byte == b'\n')
            .filter(|line| !line.is_empty())
            .collect();

        let mut kept_bytes = 0u64;
        let kept_lines = lines
            .iter()
            .rev()
            .take(self.max_lines)
            .take_while(|line| {
                kept_bytes += line.len() as u64 + 1;
                kept_bytes <= self.max_bytes
            })
            .count();
        let dropped = lines.len() - kept_lines;
        if kept_lines == 0 {
            warn!(
                max_bytes = self.max_bytes,
                "newest run log record alone exceeds the size cap, dropping it"
            );
        }

        let mut kept = Vec::with_capacity(size.min(self.max_bytes) as usize);
        for line in &lines[dropped..] {
            kept.extend_from_slice(line);
            kept.push(b'\n');
        }
        write_atomic(&self.path, &kept)
            .with_context(|| format!("rotate run log {}", self.path.display()))?;
        info!(dropped_lines = dropped, kept_lines, "run log rotated");
        debug!(before_bytes = size, after_bytes = kept.len(), "run log size");
        Ok(())
    }
}
