//! Foreman Daemon Library
//!
//! Core functionality for the Foreman daemon:
//! - Per-agent job queues with gap ordering keys
//! - Work sessions over agent CLI subprocesses
//! - Architect, coder, reviewer and tester pipelines per feature
//! - SQLite storage for features, jobs, runs and thread messages
//! - HTTP API with server-sent event streams

pub mod bus;
pub mod orchestration;
pub mod pipeline;
pub mod queue;
pub mod server;
pub mod session;
pub mod storage;
pub mod thread;
