//! Side-effecting operations: filesystem, processes, network.

pub mod config;
pub mod executor;
pub mod packager;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod provider;
pub mod run_log;
pub mod status;
pub mod task;
