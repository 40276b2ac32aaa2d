//! Deterministic, pure logic shared by the agent engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod backoff;
pub mod budget;
pub mod context;
pub mod parser;
pub mod path;
pub mod run_state;
pub mod shell;
pub mod types;
pub mod validator;
