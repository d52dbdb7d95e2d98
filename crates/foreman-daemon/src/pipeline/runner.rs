//! Drives one pipeline run through its roles.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use foreman_core::config::{PipelineConfig, SuccessStatus};
use tracing::{info, warn};

use super::machine::{StepOutcome, Transition, transition};
use crate::bus::{ChannelId, EventPayload, NewEvent, StreamBus};
use crate::storage::{
    Database, DatabaseError, Feature, FeatureStatus, PipelineRun, Role, RunState, StepStatus,
};
use crate::thread::ThreadLog;

/// Role name used for run-level (not per-role) thread messages.
pub const PIPELINE_ROLE: &str = "pipeline";

/// One step to execute.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub run_id: String,
    pub feature_id: String,
    pub project_id: String,
    pub thread_id: String,
    pub role: Role,
    pub agent_id: String,
    pub prompt: String,
    pub workspace: Option<PathBuf>,
    /// 1-based.
    pub attempt: u32,
}

/// Runs a single role step to completion.
pub trait StepExecutor: Send + Sync {
    fn execute(&self, step: StepRequest) -> impl Future<Output = StepOutcome> + Send;
}

/// Sequences runs through the transition table and records every boundary.
pub struct PipelineRunner {
    db: Database,
    threads: Arc<ThreadLog>,
    bus: Arc<StreamBus>,
    config: PipelineConfig,
}

impl PipelineRunner {
    pub const fn new(
        db: Database,
        threads: Arc<ThreadLog>,
        bus: Arc<StreamBus>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            db,
            threads,
            bus,
            config,
        }
    }

    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Terminal state a fully successful run ends in.
    pub const fn success_state(&self) -> RunState {
        match self.config.success_status {
            SuccessStatus::ReviewReady => RunState::ReviewReady,
            SuccessStatus::Passing => RunState::Passing,
        }
    }

    pub fn workspace_for(&self, project_id: &str) -> Option<PathBuf> {
        self.config
            .workspace_root
            .as_ref()
            .map(|root| root.join(project_id))
    }

    /// Run from the run's current role until a terminal state.
    pub async fn run<E: StepExecutor>(
        &self,
        executor: &E,
        run: PipelineRun,
        feature: &Feature,
    ) -> Result<RunState, DatabaseError> {
        let run_channel = ChannelId::Run(run.id.clone());
        let mut role = run.current_role;
        let mut retries = run.retries.clone();
        let mut previous_report: Option<String> = None;
        let mut retry_reason: Option<String> = None;

        loop {
            let attempt = retries.get(role) + 1;
            let (status, message) = match &retry_reason {
                None => (StepStatus::Running, format!("Entered {role} phase")),
                Some(reason) => (
                    StepStatus::Retrying,
                    format!("Retrying {role} phase after failure: {reason}"),
                ),
            };
            self.db
                .update_run_step(&run.id, role, status, &retries)
                .await?;
            self.threads
                .system(&run.thread_id, role.as_str(), &message)
                .await?;
            self.status(&run, &run_channel, "step_started", Some(role.as_str()))
                .await;

            let outcome = executor
                .execute(StepRequest {
                    run_id: run.id.clone(),
                    feature_id: feature.id.clone(),
                    project_id: feature.project_id.clone(),
                    thread_id: run.thread_id.clone(),
                    role,
                    agent_id: role.agent(&self.config.roster).to_string(),
                    prompt: role.render_prompt(feature, previous_report.as_deref()),
                    workspace: self.workspace_for(&feature.project_id),
                    attempt,
                })
                .await;

            let succeeded = matches!(outcome, StepOutcome::Succeeded { .. });
            info!(run_id = %run.id, %role, attempt, succeeded, "Pipeline step finished");
            let step_status = if succeeded {
                StepStatus::Succeeded
            } else {
                retries.increment(role);
                StepStatus::Failed
            };
            self.db
                .update_run_step(&run.id, role, step_status, &retries)
                .await?;

            match (transition(role, succeeded, attempt), outcome) {
                (Transition::Advance(next), StepOutcome::Succeeded { report }) => {
                    previous_report = report;
                    retry_reason = None;
                    role = next;
                }
                (Transition::Retry(_), StepOutcome::Failed { reason }) => {
                    warn!(run_id = %run.id, %role, %reason, "Pipeline step failed, retrying");
                    retry_reason = Some(reason);
                }
                (Transition::Complete, _) => {
                    let state = self.success_state();
                    self.finish(&run, feature, state, None).await?;
                    return Ok(state);
                }
                (Transition::Fail(failed), StepOutcome::Failed { reason }) => {
                    let reason = format!("{failed} phase failed after {attempt} attempts: {reason}");
                    self.finish(&run, feature, RunState::Failing, Some(&reason))
                        .await?;
                    return Ok(RunState::Failing);
                }
                (transition, _) => {
                    // Advance/Retry always pair with success/failure.
                    warn!(run_id = %run.id, ?transition, "Inconsistent step transition");
                    self.finish(&run, feature, RunState::Failing, Some("inconsistent transition"))
                        .await?;
                    return Ok(RunState::Failing);
                }
            }
        }
    }

    /// Record a terminal state on the run, the feature, the thread and the bus.
    pub async fn finish(
        &self,
        run: &PipelineRun,
        feature: &Feature,
        state: RunState,
        reason: Option<&str>,
    ) -> Result<(), DatabaseError> {
        if !self.db.finish_run(&run.id, state, reason).await? {
            warn!(run_id = %run.id, "Run already finished");
            return Ok(());
        }
        let feature_status = match state {
            RunState::Passing => FeatureStatus::Passing,
            RunState::ReviewReady => FeatureStatus::ReviewReady,
            RunState::Abandoned => FeatureStatus::Pending,
            RunState::Failing | RunState::Running => FeatureStatus::Failing,
        };
        self.db
            .set_feature_status(&feature.id, feature_status)
            .await?;

        let content = match reason {
            Some(reason) => format!("Pipeline failed: {reason}"),
            None => format!("Pipeline completed: feature {} is {feature_status}", feature.id),
        };
        self.threads
            .system(&run.thread_id, PIPELINE_ROLE, &content)
            .await?;

        info!(run_id = %run.id, feature_id = %feature.id, %state, "Pipeline run finished");
        let run_channel = ChannelId::Run(run.id.clone());
        self.status(run, &run_channel, state.as_str(), reason).await;
        self.bus.close(&run_channel, state.as_str()).await;
        self.bus
            .close(&ChannelId::Thread(run.thread_id.clone()), state.as_str())
            .await;
        Ok(())
    }

    async fn status(
        &self,
        run: &PipelineRun,
        channel: &ChannelId,
        state: &str,
        detail: Option<&str>,
    ) {
        self.bus
            .publish(
                channel,
                NewEvent::new(EventPayload::Status {
                    state: state.to_string(),
                    detail: detail.map(str::to_string),
                })
                .thread(&run.thread_id),
            )
            .await;
    }
}
