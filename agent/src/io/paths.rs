//! Workspace layout, filesystem-backed path resolution and atomic writes.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::core::path::{PathResolver, normalize_lexical};

pub const TASK_FILE: &str = "task.txt";
pub const STATUS_FILE: &str = "status.txt";
pub const LOG_FILE: &str = "log.txt";
pub const ARCHIVE_FILE: &str = "output.tar.gz";

/// Prefix of the temporary siblings created by [`write_atomic`].
pub const TEMP_PREFIX: &str = ".agent-tmp.";

/// Canonical paths of the engine's control files inside a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub task_path: PathBuf,
    pub status_path: PathBuf,
    pub log_path: PathBuf,
    pub archive_path: PathBuf,
}

impl WorkspacePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            task_path: root.join(TASK_FILE),
            status_path: root.join(STATUS_FILE),
            log_path: root.join(LOG_FILE),
            archive_path: root.join(ARCHIVE_FILE),
            root,
        }
    }

    /// Create (if needed) and canonicalize the workspace root.
    pub fn prepare(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("create workspace {}", dir.display()))?;
        let root = fs::canonicalize(dir)
            .with_context(|| format!("resolve workspace {}", dir.display()))?;
        if !root.is_dir() {
            bail!("workspace {} is not a directory", root.display());
        }
        debug!(root = %root.display(), "workspace ready");
        Ok(Self::new(root))
    }
}

/// Resolves symlinks the way the kernel would when the path is opened.
///
/// Existing symlinks are canonicalized; dangling ones are followed lexically
/// so a link pointing outside the workspace is still caught before the
/// target exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsResolver;

impl PathResolver for FsResolver {
    fn resolve(&self, path: &Path) -> PathBuf {
        let mut out = PathBuf::new();
        for component in path.components() {
            match component {
                Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
                Component::CurDir => {}
                Component::ParentDir => {
                    out.pop();
                }
                Component::Normal(name) => {
                    let candidate = out.join(name);
                    out = follow(candidate);
                }
            }
        }
        out
    }
}

fn follow(candidate: PathBuf) -> PathBuf {
    let is_link = fs::symlink_metadata(&candidate)
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false);
    if !is_link {
        return candidate;
    }
    if let Ok(canonical) = fs::canonicalize(&candidate) {
        return canonical;
    }
    match fs::read_link(&candidate) {
        Ok(target) => {
            let base = candidate.parent().map(Path::to_path_buf).unwrap_or_default();
            normalize_lexical(&base.join(target))
        }
        Err(_) => candidate,
    }
}

/// Write `contents` to a sibling temp file, then rename over `path`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?;
    let tmp_path = parent.join(format!(
        "{TEMP_PREFIX}{}.{}",
        file_name.to_string_lossy(),
        std::process::id()
    ));
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err).with_context(|| format!("replace {}", path.display()));
    }
    Ok(())
}
