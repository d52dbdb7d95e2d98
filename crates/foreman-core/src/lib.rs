//! Foreman Core Library
//!
//! Shared functionality for Foreman components:
//! - NDJSON parsing and encoding for the agent stream-json protocol
//! - Layered configuration resolution
//! - `SQLite` pool helpers and the `define_database!` macro
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod ndjson;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
