//! Path normalization and workspace confinement.
//!
//! Symlink resolution is behind [`PathResolver`] so the confinement rule stays
//! deterministic here; the filesystem-backed resolver lives in `io::paths`.

use std::path::{Component, Path, PathBuf};

/// Resolve a path to the location it would actually reach.
pub trait PathResolver {
    /// Resolve `path` (absolute, possibly containing `.`/`..`/symlinks).
    fn resolve(&self, path: &Path) -> PathBuf;
}

/// Resolver that only normalizes `.` and `..` without touching the filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalResolver;

impl PathResolver for LexicalResolver {
    fn resolve(&self, path: &Path) -> PathBuf {
        normalize_lexical(path)
    }
}

/// Collapse `.` and `..` components. `..` at the root stays at the root.
pub fn normalize_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                } else if !path.has_root() {
                    out.push("..");
                }
            }
            Component::Normal(name) => out.push(name),
        }
    }
    out
}

/// A candidate path that resolves outside the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEscape {
    pub candidate: String,
    pub resolved: PathBuf,
}

/// Confine `candidate` (relative to `root`, or absolute) to `root`.
///
/// Returns the lexically normalized absolute path when the resolved location
/// is `root` itself or lies beneath it.
pub fn confine<R: PathResolver + ?Sized>(
    root: &Path,
    candidate: &str,
    resolver: &R,
) -> Result<PathBuf, PathEscape> {
    confine_from(root, root, candidate, resolver)
}

/// Like [`confine`], but relative candidates are joined to `base` instead of `root`.
pub fn confine_from<R: PathResolver + ?Sized>(
    root: &Path,
    base: &Path,
    candidate: &str,
    resolver: &R,
) -> Result<PathBuf, PathEscape> {
    // `~` expands to a home directory the shell picks, never the workspace.
    if candidate.starts_with('~') {
        return Err(PathEscape {
            candidate: candidate.to_string(),
            resolved: PathBuf::from(candidate),
        });
    }
    let raw = Path::new(candidate);
    let joined = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        base.join(raw)
    };
    let resolved_root = resolver.resolve(root);
    let resolved = resolver.resolve(&joined);
    if resolved.starts_with(&resolved_root) {
        Ok(normalize_lexical(&joined))
    } else {
        Err(PathEscape {
            candidate: candidate.to_string(),
            resolved,
        })
    }
}

/// Render `path` relative to `root` with `/` separators, if it is inside `root`.
pub fn relative_display(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}
