//! Autonomous coding-agent execution engine.
//!
//! One invocation takes one task, asks an LLM provider for a plan of file
//! writes and shell commands, screens every proposed action, executes the
//! allowed ones inside a confined workspace, and packages the result. The
//! architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (parsing, validation, backoff,
//!   context fitting, run-state transitions). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (configuration, provider HTTP,
//!   process execution, status/log files, packaging).
//!
//! [`orchestrator`] coordinates core logic with I/O to run a task.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
