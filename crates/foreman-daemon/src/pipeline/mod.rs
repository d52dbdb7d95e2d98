//! Four-role pipeline: architect, coder, reviewer, tester.

pub mod machine;
pub mod role;
pub mod runner;

pub use machine::{MAX_ATTEMPTS, StepOutcome, Transition, transition};
pub use runner::{PIPELINE_ROLE, PipelineRunner, StepExecutor, StepRequest};
