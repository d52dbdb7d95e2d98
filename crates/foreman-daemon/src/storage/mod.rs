//! `SQLite` storage for the Foreman daemon.
//!
//! Provides persistence for features, pipeline runs, queued jobs and thread
//! messages.

mod db;
mod models;
mod queries_features;
mod queries_jobs;
mod queries_messages;
mod queries_runs;

pub use db::{Database, DatabaseError};
pub use models::*;
pub use queries_jobs::NewJobRow;
