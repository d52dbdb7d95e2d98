//! Scheduling: project slots, the orchestrator and the feature watcher.
//!
//! - [`ConcurrencyManager`]: per-project limit on active pipelines.
//! - [`Orchestrator`]: dispatch, queue pumping, pipeline runs and recovery.
//! - [`FeatureWatcher`]: periodic scan that starts runnable features.

pub mod concurrency;
pub mod orchestrator;
pub mod watcher;

pub use concurrency::{Acquire, ConcurrencyManager, ProjectSlot};
pub use orchestrator::{
    DispatchOutcome, DispatchRequest, HealthSnapshot, Orchestrator, OrchestratorError,
    ScheduleOutcome,
};
pub use watcher::{FeatureWatcher, TickReport};
