//! Command validator: static security policy for proposed actions.
//!
//! Classification only; nothing here touches the filesystem except through
//! the injected [`PathResolver`]. Path confinement applies even when security
//! validation is switched off.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::path::{
    PathEscape, PathResolver, confine, confine_from, normalize_lexical, relative_display,
};
use crate::core::shell::{self, CommandLine, Operator, Word};
use crate::core::types::{Action, DenyReason, SecurityVerdict};

/// Executables denied when security validation is enabled.
pub const DEFAULT_DENYLIST: &[&str] = &[
    "kill", "pkill", "killall", "sudo", "su", "doas", "nc", "ncat", "netcat", "telnet", "ssh",
    "scp", "sftp", "ftp", "socat", "nmap", "shutdown", "reboot", "halt", "poweroff", "mkfs", "dd",
    "curl", "wget",
];

/// Files the engine owns inside the workspace.
pub const CONTROL_FILES: &[&str] = &["task.txt", "status.txt", "log.txt", "output.tar.gz"];

const NETWORK_CLIENTS: &[&str] = &[
    "curl", "wget", "nc", "ncat", "netcat", "socat", "telnet", "ssh", "scp", "ftp",
];

const INTERPRETERS: &[&str] = &[
    "sh", "bash", "zsh", "dash", "ksh", "fish", "python", "python3", "perl", "ruby", "node",
];

const EXECUTABLE_EXTENSIONS: &[&str] = &["sh", "bat", "cmd", "exe", "scr"];

/// The only location outside the workspace a command may name.
const NULL_DEVICE: &str = "/dev/null";

/// Depth limit for `sh -c '...'` scripts screened recursively.
const MAX_NESTED_SCRIPTS: usize = 3;

static DANGEROUS_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("recursive delete from an absolute path", r"rm\s+-rf\s+/"),
        ("privileged delete", r"sudo\s+rm"),
        ("world-writable permissions", r"chmod\s+777"),
        ("download piped into a shell", r"curl.*\|\s*(bash|sh)"),
        ("download piped into a shell", r"wget.*\|\s*(bash|sh)"),
        ("eval of dynamic code", r"\beval\s+"),
        ("exec replacement of the shell", r"\bexec\s+"),
        ("raw TCP device", r"/dev/tcp"),
        ("listening netcat", r"\bnc\s+-l"),
        ("python one-liner importing os", r"python.*-c.*import.*os"),
    ]
    .into_iter()
    .map(|(label, pattern)| {
        let regex = Regex::new(&format!("(?i){pattern}")).expect("dangerous pattern compiles");
        (label, regex)
    })
    .collect()
});

/// Label of the first dangerous pattern `text` matches.
pub fn dangerous_pattern(text: &str) -> Option<&'static str> {
    DANGEROUS_PATTERNS
        .iter()
        .find(|(_, regex)| regex.is_match(text))
        .map(|(label, _)| *label)
}

/// Whether a written file name suggests it will be executed.
pub fn has_executable_extension(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            EXECUTABLE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

/// Tunable policy inputs, resolved from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorPolicy {
    pub security_enabled: bool,
    pub denylist: Vec<String>,
    pub max_write_bytes: u64,
    /// Workspace-relative paths no action may write.
    pub protected_files: Vec<String>,
}

impl Default for ValidatorPolicy {
    fn default() -> Self {
        Self {
            security_enabled: true,
            denylist: DEFAULT_DENYLIST.iter().map(|s| s.to_string()).collect(),
            max_write_bytes: 1024 * 1024,
            protected_files: CONTROL_FILES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

struct Denial {
    reason: DenyReason,
    detail: String,
}

impl Denial {
    fn new(reason: DenyReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }

    fn escape(escape: PathEscape) -> Self {
        Self::new(
            DenyReason::PathEscape,
            format!(
                "path '{}' resolves to {} outside the workspace",
                escape.candidate,
                escape.resolved.display()
            ),
        )
    }
}

/// Classifies actions against a [`ValidatorPolicy`].
#[derive(Debug, Clone)]
pub struct CommandValidator<R> {
    policy: ValidatorPolicy,
    resolver: R,
}

impl<R: PathResolver> CommandValidator<R> {
    pub fn new(policy: ValidatorPolicy, resolver: R) -> Self {
        Self { policy, resolver }
    }

    /// Verdict for the action at `index` in its plan.
    pub fn validate(&self, action: &Action, index: usize, root: &Path) -> SecurityVerdict {
        let reference = action.reference(index);
        let checked = match action {
            Action::WriteFile { path, content } => self.check_write(root, path, content),
            Action::RunCommand {
                command, workdir, ..
            } => self.check_command(root, command, workdir.as_deref()),
            Action::Note { .. } => Ok(()),
        };
        match checked {
            Ok(()) => SecurityVerdict::allow(reference),
            Err(denial) => SecurityVerdict::deny(reference, denial.reason, denial.detail),
        }
    }

    fn check_write(&self, root: &Path, path: &str, content: &str) -> Result<(), Denial> {
        if path.trim().is_empty() {
            return Err(Denial::new(DenyReason::Malformed, "empty path"));
        }
        let target = confine(root, path, &self.resolver).map_err(Denial::escape)?;
        let relative = relative_display(&normalize_lexical(root), &target).unwrap_or_default();
        if relative.is_empty() {
            return Err(Denial::new(
                DenyReason::Malformed,
                format!("path '{path}' names the workspace root"),
            ));
        }
        if self.is_protected(&relative) {
            return Err(Denial::new(
                DenyReason::ControlFile,
                format!("'{relative}' is managed by the engine"),
            ));
        }
        let size = content.len() as u64;
        if size > self.policy.max_write_bytes {
            return Err(Denial::new(
                DenyReason::PayloadTooLarge,
                format!(
                    "content is {size} bytes, limit is {}",
                    self.policy.max_write_bytes
                ),
            ));
        }
        Ok(())
    }

    fn check_command(
        &self,
        root: &Path,
        command: &str,
        workdir: Option<&str>,
    ) -> Result<(), Denial> {
        if command.trim().is_empty() {
            return Err(Denial::new(DenyReason::Malformed, "empty command"));
        }
        let base = match workdir {
            Some(dir) => confine(root, dir, &self.resolver).map_err(Denial::escape)?,
            None => normalize_lexical(root),
        };
        self.screen(root, &base, command, 0)
    }

    fn screen(&self, root: &Path, base: &Path, command: &str, depth: usize) -> Result<(), Denial> {
        let line = shell::split(command)
            .map_err(|err| Denial::new(DenyReason::Malformed, err.to_string()))?;
        if line.segments.is_empty() {
            return Err(Denial::new(DenyReason::Malformed, "no command to run"));
        }

        for segment in &line.segments {
            for word in &segment.words {
                self.check_argument(root, base, word)?;
            }
            for target in &segment.redirects {
                self.check_redirect(root, base, target)?;
            }
            if depth < MAX_NESTED_SCRIPTS
                && let Some(script) = segment.inner_script()
            {
                self.screen(root, base, script, depth + 1)?;
            }
        }

        if !self.policy.security_enabled {
            return Ok(());
        }
        if line.has_substitution {
            return Err(Denial::new(
                DenyReason::CommandSubstitution,
                "command substitution is not allowed",
            ));
        }
        if line.has_background {
            return Err(Denial::new(
                DenyReason::BackgroundExecution,
                "background jobs are not allowed",
            ));
        }
        check_remote_pipe(&line)?;
        for segment in &line.segments {
            if let Some(word) = segment.executable()
                && (word.expands || word.text.starts_with('$'))
            {
                return Err(Denial::new(
                    DenyReason::ForbiddenExecutable,
                    format!("executable '{}' is chosen by a shell expansion", word.text),
                ));
            }
            if let Some(name) = segment.executable_name()
                && self.policy.denylist.iter().any(|denied| denied == name)
            {
                return Err(Denial::new(
                    DenyReason::ForbiddenExecutable,
                    format!("'{name}' is on the denylist"),
                ));
            }
        }
        if let Some(label) = dangerous_pattern(command) {
            return Err(Denial::new(DenyReason::DangerousPattern, label));
        }
        Ok(())
    }

    fn check_argument(&self, root: &Path, base: &Path, word: &Word) -> Result<(), Denial> {
        let candidate = argument_value(&word.text);
        let relative = if looks_like_path(candidate) {
            self.check_path(root, base, candidate, word.expands)?
        } else if is_plain_word(candidate) {
            let joined = normalize_lexical(&base.join(candidate));
            relative_display(&normalize_lexical(root), &joined)
        } else {
            None
        };
        if let Some(relative) = relative
            && self.names_protected(&relative)
        {
            return Err(Denial::new(
                DenyReason::ControlFile,
                format!("'{relative}' is managed by the engine and may not be named"),
            ));
        }
        Ok(())
    }

    fn check_redirect(&self, root: &Path, base: &Path, word: &Word) -> Result<(), Denial> {
        let Some(relative) = self.check_path(root, base, &word.text, word.expands)? else {
            return Ok(());
        };
        if self.is_protected(&relative) {
            return Err(Denial::new(
                DenyReason::ControlFile,
                format!("redirect into '{relative}', which is managed by the engine"),
            ));
        }
        Ok(())
    }

    /// Confine one path operand. Returns its workspace-relative form, or
    /// `None` for the null device.
    fn check_path(
        &self,
        root: &Path,
        base: &Path,
        candidate: &str,
        expands: bool,
    ) -> Result<Option<String>, Denial> {
        if candidate == NULL_DEVICE {
            return Ok(None);
        }
        let expanded = if expands {
            expand_known_variables(candidate, root, base)?
        } else {
            candidate.to_string()
        };
        let resolved =
            confine_from(root, base, &expanded, &self.resolver).map_err(Denial::escape)?;
        Ok(relative_display(&normalize_lexical(root), &resolved))
    }

    fn is_protected(&self, relative: &str) -> bool {
        self.policy
            .protected_files
            .iter()
            .any(|protected| protected == relative)
    }

    /// Like `is_protected`, but `relative` may be a glob pattern.
    fn names_protected(&self, relative: &str) -> bool {
        self.policy
            .protected_files
            .iter()
            .any(|protected| glob_matches(relative, protected))
    }
}

/// Value part of `--flag=value` and `NAME=value` words.
fn argument_value(text: &str) -> &str {
    match text.split_once('=') {
        Some((name, value))
            if name.starts_with('-')
                || name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') =>
        {
            value
        }
        _ => text,
    }
}

fn looks_like_path(text: &str) -> bool {
    !text.is_empty()
        && !text.contains("://")
        && !text.chars().any(char::is_whitespace)
        && (text.contains('/') || text == ".." || text.starts_with('~'))
}

fn is_plain_word(text: &str) -> bool {
    !text.is_empty() && !text.contains("://") && !text.chars().any(char::is_whitespace)
}

/// Shell-style match where `*` and `?` stop at `/` and a `[...]` class
/// matches any single character.
fn glob_matches(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    glob_matches_from(&pattern, &name)
}

fn glob_matches_from(pattern: &[char], name: &[char]) -> bool {
    let Some((first, rest)) = pattern.split_first() else {
        return name.is_empty();
    };
    if *first == '*' {
        return (0..=name.len())
            .take_while(|&skip| skip == 0 || name[skip - 1] != '/')
            .any(|skip| glob_matches_from(rest, &name[skip..]));
    }
    let Some((c, tail)) = name.split_first() else {
        return false;
    };
    match first {
        '?' => *c != '/' && glob_matches_from(rest, tail),
        '[' if rest.contains(&']') => {
            let class_len = rest.iter().take_while(|ch| **ch != ']').count();
            *c != '/' && glob_matches_from(&rest[class_len + 1..], tail)
        }
        literal => c == literal && glob_matches_from(rest, tail),
    }
}

/// Substitute `$HOME` and `$PWD`, which the executor pins; any other
/// variable makes the path unknowable.
fn expand_known_variables(candidate: &str, root: &Path, base: &Path) -> Result<String, Denial> {
    let root = root.display().to_string();
    let base = base.display().to_string();
    let expanded = candidate
        .replace("${HOME}", &root)
        .replace("$HOME", &root)
        .replace("${PWD}", &base)
        .replace("$PWD", &base);
    if expanded.contains('$') {
        return Err(Denial::new(
            DenyReason::PathEscape,
            format!("path '{candidate}' depends on a variable that cannot be resolved"),
        ));
    }
    Ok(expanded)
}

fn check_remote_pipe(line: &CommandLine) -> Result<(), Denial> {
    let mut downloading = false;
    for segment in &line.segments {
        let piped = segment.joined_by == Some(Operator::Pipe);
        if !piped {
            downloading = false;
        }
        let Some(name) = segment.executable_name() else {
            continue;
        };
        let network = NETWORK_CLIENTS.contains(&name);
        if piped && network {
            return Err(Denial::new(
                DenyReason::RemotePipe,
                format!("output piped into network client '{name}'"),
            ));
        }
        if piped && downloading && INTERPRETERS.contains(&name) {
            return Err(Denial::new(
                DenyReason::RemotePipe,
                format!("network download piped into '{name}'"),
            ));
        }
        downloading |= network;
    }
    Ok(())
}
