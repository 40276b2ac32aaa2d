//! Agent configuration: optional TOML file, environment overlay, validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::backoff::RetryPolicy;
use crate::core::validator::{CONTROL_FILES, DEFAULT_DENYLIST, ValidatorPolicy};

/// Environment lookup injected wherever configuration or credentials are read.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Read from the real process environment.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

const MAX_TOKENS_RANGE: (u32, u32) = (100, 32_768);
const TEMPERATURE_RANGE: (f64, f64) = (0.0, 2.0);
const COMMAND_TIMEOUT_RANGE: (u64, u64) = (10, 3600);

/// Default run deadline as a multiple of the command timeout.
const RUN_TIMEOUT_MULTIPLIER: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Groq,
    #[serde(rename = "openai")]
    OpenAi,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Groq => "groq",
            ProviderKind::OpenAi => "openai",
        }
    }
}

/// One LLM backend, in priority order within [`AgentConfig::providers`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// OpenAI-compatible API root (e.g. `https://api.groq.com/openai/v1`).
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_context_window")]
    pub context_window_tokens: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f64 {
    0.1
}

fn default_context_window() -> usize {
    128_000
}

fn default_request_timeout() -> u64 {
    30
}

impl ProviderConfig {
    pub fn groq() -> Self {
        Self {
            kind: ProviderKind::Groq,
            base_url: "https://api.groq.com/openai/v1".to_string(),
            api_key_env: "GROQ_API_KEY".to_string(),
            model: "llama-3.3-70b-versatile".to_string(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            context_window_tokens: 131_072,
            request_timeout_secs: default_request_timeout(),
        }
    }

    pub fn openai() -> Self {
        Self {
            kind: ProviderKind::OpenAi,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            model: "gpt-4o".to_string(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            context_window_tokens: default_context_window(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per provider, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
        }
    }
}

/// Agent configuration (TOML).
///
/// Missing fields take the defaults below. Environment variables are applied
/// on top by [`load_config`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Workspace root; the only tree a run may mutate.
    pub workspace_dir: PathBuf,

    /// Plan-validate-execute rounds before the run is declared failed.
    pub max_rounds: u32,

    /// Default per-command wall-clock limit.
    pub command_timeout_secs: u64,

    /// Whole-run deadline. Defaults to ten command timeouts.
    pub run_timeout_secs: Option<u64>,

    /// Denylist, metacharacter and pattern screening. Path confinement
    /// applies regardless.
    pub security_validation: bool,

    pub log_level: String,

    /// Run log rotation threshold in bytes.
    pub max_log_bytes: u64,

    /// Lines kept when the run log is rotated.
    pub max_log_lines: usize,

    /// Captured bytes kept per stdout/stderr stream.
    pub output_limit_bytes: usize,

    /// Largest `write_file` payload accepted.
    pub max_write_bytes: u64,

    /// Variables passed through to commands (HOME is always the workspace).
    pub env_allowlist: Vec<String>,

    pub denylist: Vec<String>,

    pub retry: RetryConfig,

    pub providers: Vec<ProviderConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::from("workspace"),
            max_rounds: 3,
            command_timeout_secs: 120,
            run_timeout_secs: None,
            security_validation: true,
            log_level: "info".to_string(),
            max_log_bytes: 1_000_000,
            max_log_lines: 1000,
            output_limit_bytes: 64 * 1024,
            max_write_bytes: 1024 * 1024,
            env_allowlist: ["PATH", "LANG", "LC_ALL", "TERM", "TZ"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            denylist: DEFAULT_DENYLIST.iter().map(|s| s.to_string()).collect(),
            retry: RetryConfig::default(),
            providers: vec![ProviderConfig::groq(), ProviderConfig::openai()],
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_rounds == 0 {
            return Err(anyhow!("max_rounds must be > 0"));
        }
        let (min, max) = COMMAND_TIMEOUT_RANGE;
        if !(min..=max).contains(&self.command_timeout_secs) {
            return Err(anyhow!(
                "command_timeout_secs must be between {min} and {max}, got {}",
                self.command_timeout_secs
            ));
        }
        if self.run_timeout_secs == Some(0) {
            return Err(anyhow!("run_timeout_secs must be > 0"));
        }
        if self.max_log_bytes == 0 {
            return Err(anyhow!("max_log_bytes must be > 0"));
        }
        if self.max_log_lines == 0 {
            return Err(anyhow!("max_log_lines must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.max_write_bytes == 0 {
            return Err(anyhow!("max_write_bytes must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be > 0"));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(anyhow!(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms"
            ));
        }
        if self.providers.is_empty() {
            return Err(anyhow!("at least one provider must be configured"));
        }
        for provider in &self.providers {
            validate_provider(provider)?;
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        let secs = self
            .run_timeout_secs
            .unwrap_or(self.command_timeout_secs * RUN_TIMEOUT_MULTIPLIER);
        Duration::from_secs(secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
        }
    }

    pub fn validator_policy(&self) -> ValidatorPolicy {
        ValidatorPolicy {
            security_enabled: self.security_validation,
            denylist: self.denylist.clone(),
            max_write_bytes: self.max_write_bytes,
            protected_files: CONTROL_FILES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Overlay the environment variables the agent has always honoured.
    pub fn apply_env(&mut self, env: EnvLookup<'_>) -> Result<()> {
        if let Some(dir) = env("WORKSPACE_DIR") {
            self.workspace_dir = PathBuf::from(dir);
        }
        if let Some(bytes) = parse_env(env, "MAX_LOG_SIZE")? {
            self.max_log_bytes = bytes;
        }
        if let Some(lines) = parse_env(env, "MAX_LOG_LINES")? {
            self.max_log_lines = lines;
        }
        if let Some(secs) = parse_env(env, "COMMAND_TIMEOUT")? {
            self.command_timeout_secs = secs;
        }
        if let Some(rounds) = parse_env(env, "MAX_ROUNDS")? {
            self.max_rounds = rounds;
        }
        if let Some(value) = env("ENABLE_SECURITY_VALIDATION") {
            self.security_validation = parse_bool(&value);
        }
        if let Some(level) = env("LOG_LEVEL") {
            self.log_level = level.trim().to_ascii_lowercase();
        }
        let max_tokens: Option<u32> = parse_env(env, "MAX_TOKENS")?;
        let temperature: Option<f64> = parse_env(env, "TEMPERATURE")?;
        for provider in &mut self.providers {
            if let Some(tokens) = max_tokens {
                provider.max_tokens = tokens;
            }
            if let Some(temp) = temperature {
                provider.temperature = temp;
            }
            let prefix = provider.kind.as_str().to_ascii_uppercase();
            if let Some(url) = env(&format!("{prefix}_BASE_URL")) {
                provider.base_url = url;
            }
            if let Some(model) = env(&format!("{prefix}_MODEL")) {
                provider.model = model;
            }
        }
        Ok(())
    }
}

fn validate_provider(provider: &ProviderConfig) -> Result<()> {
    let name = provider.kind.as_str();
    if provider.base_url.trim().is_empty() {
        bail!("providers.{name}.base_url must be non-empty");
    }
    if provider.api_key_env.trim().is_empty() {
        bail!("providers.{name}.api_key_env must be non-empty");
    }
    if provider.model.trim().is_empty() {
        bail!("providers.{name}.model must be non-empty");
    }
    let (min, max) = MAX_TOKENS_RANGE;
    if !(min..=max).contains(&provider.max_tokens) {
        bail!(
            "providers.{name}.max_tokens must be between {min} and {max}, got {}",
            provider.max_tokens
        );
    }
    let (min, max) = TEMPERATURE_RANGE;
    if !(min..=max).contains(&provider.temperature) {
        bail!(
            "providers.{name}.temperature must be between {min} and {max}, got {}",
            provider.temperature
        );
    }
    if provider.context_window_tokens <= provider.max_tokens as usize {
        bail!("providers.{name}.context_window_tokens must exceed max_tokens");
    }
    if provider.request_timeout_secs == 0 {
        bail!("providers.{name}.request_timeout_secs must be > 0");
    }
    Ok(())
}

fn parse_env<T: FromStr>(env: EnvLookup<'_>, key: &str) -> Result<Option<T>> {
    match env(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("invalid {key} value '{raw}'")),
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// Load config from an optional TOML file, overlay `env`, and validate.
///
/// A missing file yields `AgentConfig::default()` before the overlay.
pub fn load_config(path: Option<&Path>, env: EnvLookup<'_>) -> Result<AgentConfig> {
    let mut cfg: AgentConfig = match path {
        Some(path) if path.exists() => {
            let contents =
                fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
            toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?
        }
        Some(path) => {
            debug!(path = %path.display(), "config file missing, using defaults");
            AgentConfig::default()
        }
        None => AgentConfig::default(),
    };
    cfg.apply_env(env)?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(Some(temp.path().join("missing.toml").as_path()), &no_env).expect("load");
        assert_eq!(cfg, AgentConfig::default());
    }

    #[test]
    fn toml_fields_override_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("agent.toml");
        fs::write(
            &path,
            r#"
max_rounds = 5
security_validation = false

[[providers]]
kind = "openai"
base_url = "http://localhost:8080/v1"
api_key_env = "LOCAL_KEY"
model = "local-model"
"#,
        )
        .expect("write config");
        let cfg = load_config(Some(path.as_path()), &no_env).expect("load");
        assert_eq!(cfg.max_rounds, 5);
        assert!(!cfg.security_validation);
        assert_eq!(cfg.providers.len(), 1);
        assert_eq!(cfg.providers[0].max_tokens, 4096);
        assert_eq!(cfg.command_timeout_secs, 120);
    }

    #[test]
    fn environment_overlays_file_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("WORKSPACE_DIR", "/tmp/ws"),
            ("COMMAND_TIMEOUT", "30"),
            ("TEMPERATURE", "0.7"),
            ("ENABLE_SECURITY_VALIDATION", "off"),
            ("GROQ_MODEL", "llama-test"),
            ("LOG_LEVEL", "DEBUG"),
        ]);
        let env = |key: &str| vars.get(key).map(|v| v.to_string());
        let cfg = load_config(None, &env).expect("load");
        assert_eq!(cfg.workspace_dir, PathBuf::from("/tmp/ws"));
        assert_eq!(cfg.command_timeout_secs, 30);
        assert!(!cfg.security_validation);
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.providers[0].model, "llama-test");
        assert_eq!(cfg.providers[1].model, "gpt-4o");
        assert!(cfg.providers.iter().all(|p| (p.temperature - 0.7).abs() < 1e-9));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let env = |key: &str| (key == "COMMAND_TIMEOUT").then(|| "5".to_string());
        let err = load_config(None, &env).unwrap_err();
        assert!(err.to_string().contains("command_timeout_secs"));

        let env = |key: &str| (key == "MAX_TOKENS").then(|| "50000".to_string());
        assert!(load_config(None, &env).is_err());

        let env = |key: &str| (key == "TEMPERATURE").then(|| "2.5".to_string());
        assert!(load_config(None, &env).is_err());
    }

    #[test]
    fn unparseable_env_value_is_an_error() {
        let env = |key: &str| (key == "MAX_LOG_LINES").then(|| "lots".to_string());
        let err = load_config(None, &env).unwrap_err();
        assert!(err.to_string().contains("MAX_LOG_LINES"));
    }

    #[test]
    fn run_timeout_defaults_to_ten_command_timeouts() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.run_timeout(), Duration::from_secs(1200));
        let cfg = AgentConfig {
            run_timeout_secs: Some(60),
            ..AgentConfig::default()
        };
        assert_eq!(cfg.run_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn security_flag_accepts_common_truthy_values() {
        for value in ["true", "1", "YES", "on"] {
            assert!(parse_bool(value), "{value}");
        }
        assert!(!parse_bool("disabled"));
    }
}
