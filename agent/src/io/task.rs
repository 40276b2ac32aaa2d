//! Task intake from `task.txt`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{info, warn};

use crate::core::types::{Task, truncate_chars};
use crate::core::validator::dangerous_pattern;
use crate::io::paths::{WorkspacePaths, write_atomic};

/// Written to `task.txt` when the workspace has none.
pub const DEFAULT_TASK: &str =
    "Create a simple 'Hello World' Python script that prints a greeting message.";

/// Characters of the task echoed into the log.
const TASK_PREVIEW_CHARS: usize = 200;

/// Read the task, seeding the default when the file is missing.
///
/// With `screen` set, the text is checked against the dangerous-pattern list;
/// matches are logged but never fatal.
pub fn read_task(paths: &WorkspacePaths, screen: bool) -> Result<Task> {
    let description = read_or_seed(&paths.task_path)?;
    if screen && let Some(label) = dangerous_pattern(&description) {
        warn!(pattern = label, "task text matches a dangerous pattern");
    }
    info!(task = %truncate_chars(&description, TASK_PREVIEW_CHARS), "task loaded");
    Ok(Task::new(description, &paths.root, Utc::now()))
}

fn read_or_seed(path: &Path) -> Result<String> {
    if !path.exists() {
        warn!(path = %path.display(), "task file missing, writing default task");
        write_atomic(path, format!("{DEFAULT_TASK}\n").as_bytes())
            .with_context(|| format!("write default task {}", path.display()))?;
        return Ok(DEFAULT_TASK.to_string());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read task {}", path.display()))?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        bail!("task file {} is empty", path.display());
    }
    Ok(trimmed.to_string())
}
