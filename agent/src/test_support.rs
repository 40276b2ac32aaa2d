//! Test-only helpers: scripted providers, a recording sleeper and temporary workspaces.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::core::context::ChatMessage;
use crate::core::types::TokenUsage;
use crate::io::config::AgentConfig;
use crate::io::paths::WorkspacePaths;
use crate::io::provider::{ModelResponse, Provider, ProviderError, Sleeper};

/// Provider that replays a fixed script instead of calling a network API.
pub struct ScriptedProvider {
    name: String,
    available: bool,
    window: usize,
    max_tokens: usize,
    script: RefCell<VecDeque<Result<String, ProviderError>>>,
    /// Returned forever once the script runs dry.
    fallback: Option<ProviderError>,
    calls: Rc<Cell<u32>>,
    requests: Rc<RefCell<Vec<Vec<ChatMessage>>>>,
}

impl ScriptedProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            available: true,
            window: 100_000,
            max_tokens: 1000,
            script: RefCell::new(VecDeque::new()),
            fallback: None,
            calls: Rc::new(Cell::new(0)),
            requests: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Answer each call with the next reply, in order.
    pub fn replying(name: &str, replies: &[&str]) -> Self {
        replies
            .iter()
            .fold(Self::new(name), |provider, reply| provider.then_reply(*reply))
    }

    /// Fail every call with `error`.
    pub fn failing(name: &str, error: ProviderError) -> Self {
        Self {
            fallback: Some(error),
            ..Self::new(name)
        }
    }

    pub fn then_reply(self, reply: impl Into<String>) -> Self {
        self.script.borrow_mut().push_back(Ok(reply.into()));
        self
    }

    pub fn then_error(self, error: ProviderError) -> Self {
        self.script.borrow_mut().push_back(Err(error));
        self
    }

    /// Behave as if credentials were missing.
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn with_window(mut self, window: usize, max_tokens: usize) -> Self {
        self.window = window;
        self.max_tokens = max_tokens;
        self
    }

    /// Shared counter of requests received.
    pub fn calls(&self) -> Rc<Cell<u32>> {
        Rc::clone(&self.calls)
    }

    /// Shared record of every message list received.
    pub fn requests(&self) -> Rc<RefCell<Vec<Vec<ChatMessage>>>> {
        Rc::clone(&self.requests)
    }
}

impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        "scripted"
    }

    fn context_window(&self) -> usize {
        self.window
    }

    fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn complete(
        &self,
        messages: &[ChatMessage],
        _timeout: Duration,
    ) -> Result<ModelResponse, ProviderError> {
        self.calls.set(self.calls.get() + 1);
        self.requests.borrow_mut().push(messages.to_vec());
        let next = self.script.borrow_mut().pop_front();
        let text = match (next, &self.fallback) {
            (Some(step), _) => step?,
            (None, Some(error)) => return Err(error.clone()),
            (None, None) => {
                return Err(ProviderError::InvalidResponse(
                    "scripted provider ran out of replies".to_string(),
                ));
            }
        };
        Ok(ModelResponse {
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: text.len() as u64 / 4,
            },
            text,
            provider: self.name.clone(),
            model: "scripted".to_string(),
        })
    }
}

/// Sleeper that records requested delays and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: RefCell<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn recorded(&self) -> Vec<Duration> {
        self.slept.borrow().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.slept.borrow_mut().push(duration);
    }
}

/// Wrap an action document in the fenced reply format the parser expects.
pub fn json_reply(document: &serde_json::Value) -> String {
    format!("```json\n{document}\n```")
}

/// Temporary, canonicalized workspace that is removed on drop.
pub struct TestWorkspace {
    _temp: TempDir,
    paths: WorkspacePaths,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp workspace")?;
        let paths = WorkspacePaths::prepare(temp.path())?;
        Ok(Self { _temp: temp, paths })
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    pub fn paths(&self) -> &WorkspacePaths {
        &self.paths
    }

    pub fn write_task(&self, task: &str) -> Result<()> {
        fs::write(&self.paths.task_path, task)
            .with_context(|| format!("write {}", self.paths.task_path.display()))
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.root().join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root().join(rel)
    }

    /// Defaults pointed at this workspace, with short timeouts for tests.
    pub fn config(&self) -> AgentConfig {
        let mut config = AgentConfig {
            workspace_dir: self.paths.root.clone(),
            command_timeout_secs: 10,
            run_timeout_secs: Some(60),
            ..AgentConfig::default()
        };
        config.retry.initial_backoff_ms = 10;
        config.retry.max_backoff_ms = 40;
        config
    }
}

/// Environment with a PATH good enough to run coreutils in tests.
pub fn test_env(key: &str) -> Option<String> {
    (key == "PATH").then(|| "/usr/local/bin:/usr/bin:/bin".to_string())
}
