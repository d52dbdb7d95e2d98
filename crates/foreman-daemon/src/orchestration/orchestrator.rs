//! Scheduler state and the glue between queue, sessions and pipelines.
//!
//! An [`Orchestrator`] owns one instance of every scheduler container, so
//! each daemon (and each test) gets fresh state. Waiting for a pipeline step
//! is a oneshot keyed by the step's job id, resolved by the completion loop
//! when the session that ran the job terminates.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use foreman_core::Config;
use tokio::sync::{OwnedMutexGuard, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::concurrency::{Acquire, ConcurrencyManager, ProjectSlot};
use crate::bus::{ChannelId, StreamBus};
use crate::pipeline::{PIPELINE_ROLE, PipelineRunner, StepExecutor, StepOutcome, StepRequest};
use crate::queue::{AgentJobQueue, NewJob, Placement, QueueEntry, QueueError};
use crate::session::{
    SessionCompletion, SessionError, SessionInfo, SessionMode, SessionOutcome, StartOutcome,
    StartSession, WorkSessionManager,
};
use crate::storage::{
    Database, DatabaseError, Feature, FeatureStatus, JobKind, JobPayload, QueuedBy, QueuedJob,
    Role, RunState, Sender,
};
use crate::thread::ThreadLog;

/// Errors from orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Feature {feature_id} is {status}, expected {expected}")]
    InvalidTransition {
        feature_id: String,
        status: FeatureStatus,
        expected: FeatureStatus,
    },
}

/// Work handed to an agent through the dispatch API.
#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    pub agent_id: String,
    pub project_id: String,
    pub initial_input: Option<String>,
    /// Thread to report into; a new one when absent.
    pub thread_id: Option<String>,
    pub workspace: Option<String>,
}

/// Result of a dispatch. "Busy" is a queued job, never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Started { session_id: String, thread_id: String },
    Queued { job_id: String, position: usize },
}

/// Result of trying to schedule one runnable feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Started { run_id: String, thread_id: String },
    Queued { job_id: String, position: usize },
    /// A pipeline job for the feature was already waiting.
    AlreadyQueued,
    /// The feature stopped being claimable (status or dependencies changed).
    NotClaimable,
}

/// Snapshot for the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub active_sessions: usize,
    pub slots_in_use: usize,
    pub queued_jobs: i64,
}

type StepWaiters = Mutex<HashMap<String, oneshot::Sender<StepOutcome>>>;
type PumpLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

pub struct Orchestrator {
    db: Database,
    config: Config,
    concurrency: ConcurrencyManager,
    queue: AgentJobQueue,
    sessions: WorkSessionManager,
    threads: Arc<ThreadLog>,
    bus: Arc<StreamBus>,
    runner: PipelineRunner,
    step_waiters: StepWaiters,
    /// Serializes the look-then-start sequence per agent.
    pump_locks: PumpLocks,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Orchestrator {
    /// Build the scheduler state and start the completion loop.
    pub fn new(db: Database, config: Config) -> Arc<Self> {
        let bus = Arc::new(StreamBus::new(config.bus.clone()));
        let threads = Arc::new(ThreadLog::new(db.clone(), Arc::clone(&bus)));
        let (sessions, completions) =
            WorkSessionManager::new(config.sessions.clone(), Arc::clone(&bus));
        let orchestrator = Arc::new(Self {
            concurrency: ConcurrencyManager::new(
                config.scheduler.default_project_limit,
                config.scheduler.project_limits.clone(),
            ),
            queue: AgentJobQueue::new(db.clone()),
            runner: PipelineRunner::new(
                db.clone(),
                Arc::clone(&threads),
                Arc::clone(&bus),
                config.pipeline.clone(),
            ),
            sessions,
            threads,
            bus,
            db,
            config,
            step_waiters: Mutex::new(HashMap::new()),
            pump_locks: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        let this = Arc::clone(&orchestrator);
        orchestrator
            .tasks
            .spawn(async move { this.completion_loop(completions).await });
        orchestrator
    }

    pub const fn db(&self) -> &Database {
        &self.db
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub const fn queue(&self) -> &AgentJobQueue {
        &self.queue
    }

    pub const fn sessions(&self) -> &WorkSessionManager {
        &self.sessions
    }

    pub const fn concurrency(&self) -> &ConcurrencyManager {
        &self.concurrency
    }

    pub fn threads(&self) -> &ThreadLog {
        &self.threads
    }

    pub fn bus(&self) -> &StreamBus {
        &self.bus
    }

    /// Token cancelled when the orchestrator shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    // =========================================================================
    // Crash recovery
    // =========================================================================

    /// Restore consistency after an unclean stop.
    ///
    /// Active runs become `abandoned` and their features `pending`; their
    /// step jobs are dropped; other interrupted jobs return to the front of
    /// their queues.
    pub async fn recover(&self) -> Result<(), OrchestratorError> {
        let abandoned = self.db.abandon_active_runs().await?;
        for run in &abandoned {
            self.db
                .transition_feature(&run.feature_id, FeatureStatus::InProgress, FeatureStatus::Pending)
                .await?;
            self.threads
                .system(&run.thread_id, PIPELINE_ROLE, "Pipeline abandoned: daemon restarted")
                .await?;
            self.bus
                .close(&ChannelId::Thread(run.thread_id.clone()), RunState::Abandoned.as_str())
                .await;
        }
        let dropped_steps = self.db.delete_live_jobs_of_kind(JobKind::Step).await?;
        let requeued = self.queue.recover().await?;
        let orphaned = self.db.reset_orphaned_features().await?;
        info!(
            abandoned_runs = abandoned.len(),
            dropped_steps, requeued, orphaned, "Recovery complete"
        );
        Ok(())
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Give work to an agent: start a session now, or queue it.
    pub async fn dispatch(
        self: &Arc<Self>,
        request: DispatchRequest,
    ) -> Result<DispatchOutcome, OrchestratorError> {
        let thread_id = request
            .thread_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let pumping = self.lock_pump(&request.agent_id).await;
        // Queued session work for the agent goes first.
        if !self.has_session_work(&request.agent_id).await? {
            let start = StartSession {
                agent_id: request.agent_id.clone(),
                thread_id: thread_id.clone(),
                workspace: self.workspace(request.workspace.as_deref(), &request.project_id),
                initial_input: request.initial_input.clone(),
                mode: SessionMode::Interactive,
                job_id: None,
            };
            if let StartOutcome::Started(info) = self.sessions.start(start).await? {
                if let Some(input) = &request.initial_input {
                    self.threads
                        .append(&thread_id, Sender::User, None, input, None)
                        .await?;
                }
                return Ok(DispatchOutcome::Started {
                    session_id: info.session_id,
                    thread_id,
                });
            }
        }
        drop(pumping);

        let payload = JobPayload {
            input: request.initial_input,
            thread_id: Some(thread_id),
            workspace: request.workspace,
            ..JobPayload::default()
        };
        let job = NewJob::new(
            &request.agent_id,
            &request.project_id,
            JobKind::Task,
            payload,
            QueuedBy::User,
        );
        let entry = self.queue.enqueue(job, Placement::Tail).await?;
        self.spawn_pump(&request.agent_id);
        Ok(DispatchOutcome::Queued {
            job_id: entry.job.id,
            position: entry.position,
        })
    }

    /// Queue a job through the API and start it if its agent is free.
    pub async fn enqueue_job(
        self: &Arc<Self>,
        job: NewJob,
        placement: Placement,
    ) -> Result<QueueEntry, OrchestratorError> {
        let agent_id = job.agent_id.clone();
        let entry = self.queue.enqueue(job, placement).await?;
        self.spawn_pump(&agent_id);
        Ok(entry)
    }

    /// Send a user turn to a live session and record it in its thread.
    pub async fn send_turn(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<SessionInfo, OrchestratorError> {
        let info = self.sessions.send(session_id, text).await?;
        self.threads
            .append(&info.thread_id, Sender::User, None, text, None)
            .await?;
        Ok(info)
    }

    // =========================================================================
    // Queue pumping
    // =========================================================================

    fn spawn_pump(self: &Arc<Self>, agent_id: &str) {
        let this = Arc::clone(self);
        let agent_id = agent_id.to_string();
        self.tasks.spawn(async move {
            if let Err(e) = this.pump_agent(&agent_id).await {
                warn!(agent_id = %agent_id, error = %e, "Queue pump failed");
            }
        });
    }

    /// Start queued work for an agent.
    ///
    /// Pipeline jobs need a project slot, not the agent, so each one whose
    /// project has a free slot starts regardless of its position; one waiting
    /// for a busy project does not hold up the others. The first other job
    /// starts only if the agent has no session.
    ///
    /// Boxed because pipeline steps pump their agent from inside a run task
    /// that a pump may have spawned.
    pub fn pump_agent<'a>(
        self: &'a Arc<Self>,
        agent_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), OrchestratorError>> + Send + 'a>> {
        Box::pin(async move { self.pump_agent_inner(agent_id).await })
    }

    async fn pump_agent_inner(self: &Arc<Self>, agent_id: &str) -> Result<(), OrchestratorError> {
        let _pumping = self.lock_pump(agent_id).await;
        let mut agent_busy = self.sessions.has_session(agent_id).await;

        for entry in self.queue.list_queue(agent_id).await? {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            let queued = entry.job;
            if queued.kind == JobKind::Pipeline {
                let Some(slot) = self.concurrency.try_acquire(&queued.project_id).granted() else {
                    debug!(agent_id, job_id = %queued.id, project_id = %queued.project_id, "Pipeline job waits for a project slot");
                    continue;
                };
                if let Some(job) = self.queue.take(agent_id, &queued.id).await? {
                    self.start_pipeline_job(job, slot).await?;
                }
                continue;
            }

            if agent_busy {
                continue;
            }
            if let Some(job) = self.queue.take(agent_id, &queued.id).await? {
                self.start_session_job(job).await?;
                agent_busy = self.sessions.has_session(agent_id).await;
            }
        }
        Ok(())
    }

    async fn lock_pump(&self, agent_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.pump_locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(agent_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Whether the agent has queued jobs that need its session.
    async fn has_session_work(&self, agent_id: &str) -> Result<bool, OrchestratorError> {
        Ok(self
            .queue
            .list_queue(agent_id)
            .await?
            .iter()
            .any(|entry| entry.job.kind != JobKind::Pipeline))
    }

    async fn start_pipeline_job(
        self: &Arc<Self>,
        job: QueuedJob,
        slot: ProjectSlot,
    ) -> Result<(), OrchestratorError> {
        let Some(feature_id) = job.feature_id.as_deref() else {
            self.queue.fail(&job.id, "pipeline job without feature").await?;
            return Ok(());
        };
        let feature = match self.db.get_feature(feature_id).await {
            Ok(feature) => feature,
            Err(DatabaseError::NotFound(_)) => {
                self.queue.fail(&job.id, "feature not found").await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        self.queue.complete(&job.id).await?;
        if self.db.claim_feature(feature_id).await? {
            self.start_run(feature, slot).await?;
        } else {
            debug!(feature_id, "Queued feature is no longer claimable");
        }
        Ok(())
    }

    async fn start_session_job(self: &Arc<Self>, job: QueuedJob) -> Result<(), OrchestratorError> {
        let thread_id = job
            .payload
            .thread_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mode = if job.kind == JobKind::Step {
            SessionMode::OneShot
        } else {
            SessionMode::Interactive
        };
        let start = StartSession {
            agent_id: job.agent_id.clone(),
            thread_id: thread_id.clone(),
            workspace: self.workspace(job.payload.workspace.as_deref(), &job.project_id),
            initial_input: job.payload.input.clone(),
            mode,
            job_id: Some(job.id.clone()),
        };

        match self.sessions.start(start).await {
            Ok(StartOutcome::Started(info)) => {
                info!(agent_id = %job.agent_id, job_id = %job.id, session_id = %info.session_id, "Queued job started");
                if job.kind == JobKind::Task
                    && let Some(input) = &job.payload.input
                {
                    self.threads
                        .append(&thread_id, Sender::User, None, input, None)
                        .await?;
                }
            }
            Ok(StartOutcome::Existing(_)) => {
                self.queue.requeue(&job).await?;
            }
            Err(e) => {
                error!(agent_id = %job.agent_id, job_id = %job.id, error = %e, "Failed to start queued job");
                self.queue.fail(&job.id, &e.to_string()).await?;
                self.resolve_step(&job.id, StepOutcome::failed(e.to_string()));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Pipelines
    // =========================================================================

    /// Try to run a runnable feature now, or queue it for the architect.
    pub async fn claim_and_start(
        self: &Arc<Self>,
        feature: Feature,
    ) -> Result<ScheduleOutcome, OrchestratorError> {
        match self.concurrency.try_acquire(&feature.project_id) {
            Acquire::Granted(slot) => {
                if !self.db.claim_feature(&feature.id).await? {
                    return Ok(ScheduleOutcome::NotClaimable);
                }
                self.start_run(feature, slot).await
            }
            Acquire::Denied { active, limit } => {
                debug!(feature_id = %feature.id, active, limit, "Project at capacity, queueing feature");
                self.enqueue_pipeline(&feature).await
            }
        }
    }

    /// Queue a pipeline job for a feature waiting for a slot.
    pub async fn enqueue_pipeline(
        &self,
        feature: &Feature,
    ) -> Result<ScheduleOutcome, OrchestratorError> {
        let agent = Role::first().agent(&self.config.pipeline.roster);
        let job = NewJob::new(
            agent,
            &feature.project_id,
            JobKind::Pipeline,
            JobPayload::default(),
            QueuedBy::Auto,
        )
        .for_feature(&feature.id);
        match self.queue.enqueue(job, Placement::Tail).await {
            Ok(entry) => Ok(ScheduleOutcome::Queued {
                job_id: entry.job.id,
                position: entry.position,
            }),
            Err(QueueError::AlreadyQueued(_)) => Ok(ScheduleOutcome::AlreadyQueued),
            Err(e) => Err(e.into()),
        }
    }

    /// Create a run for a claimed feature and drive it in its own task.
    async fn start_run(
        self: &Arc<Self>,
        mut feature: Feature,
        slot: ProjectSlot,
    ) -> Result<ScheduleOutcome, OrchestratorError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let thread_id = uuid::Uuid::new_v4().to_string();
        let run = match self
            .db
            .create_run(&run_id, &feature.id, &feature.project_id, &thread_id)
            .await
        {
            Ok(run) => run,
            Err(e) => {
                // Undo the claim so the next tick can retry.
                self.db
                    .transition_feature(&feature.id, FeatureStatus::InProgress, FeatureStatus::Pending)
                    .await?;
                return Err(e.into());
            }
        };
        feature.status = FeatureStatus::InProgress;
        info!(feature_id = %feature.id, run_id = %run_id, thread_id = %thread_id, "Pipeline started");

        let this = Arc::clone(self);
        let steps = QueuedSteps(Arc::clone(self));
        let cancel = self.shutdown.clone();
        self.tasks.spawn(async move {
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                result = this.runner.run(&steps, run.clone(), &feature) => Some(result),
            };
            match outcome {
                Some(Ok(state)) => debug!(run_id = %run.id, %state, "Pipeline task finished"),
                Some(Err(e)) => {
                    error!(run_id = %run.id, error = %e, "Pipeline aborted by storage error");
                    let reason = format!("internal error: {e}");
                    if let Err(e) = this
                        .runner
                        .finish(&run, &feature, RunState::Failing, Some(&reason))
                        .await
                    {
                        error!(run_id = %run.id, error = %e, "Failed to record pipeline failure");
                    }
                }
                None => info!(run_id = %run.id, "Pipeline interrupted by shutdown"),
            }
            slot.release();
            if !this.shutdown.is_cancelled() {
                let architect = Role::first().agent(&this.config.pipeline.roster).to_string();
                if let Err(e) = this.pump_agent(&architect).await {
                    warn!(error = %e, "Queue pump after pipeline failed");
                }
            }
        });

        Ok(ScheduleOutcome::Started { run_id, thread_id })
    }

    /// Queue a step job and wait for the session that runs it to end.
    async fn execute_step(self: &Arc<Self>, step: StepRequest) -> StepOutcome {
        let payload = JobPayload {
            input: Some(step.prompt),
            thread_id: Some(step.thread_id),
            workspace: step
                .workspace
                .map(|path| path.to_string_lossy().into_owned()),
            run_id: Some(step.run_id),
            role: Some(step.role),
            ..JobPayload::default()
        };
        let job = NewJob::new(
            &step.agent_id,
            &step.project_id,
            JobKind::Step,
            payload,
            QueuedBy::Auto,
        )
        .for_feature(&step.feature_id);
        let job_id = job.id.clone();

        let (tx, rx) = oneshot::channel();
        self.waiters().insert(job_id.clone(), tx);
        if let Err(e) = self.queue.enqueue(job, Placement::Front).await {
            self.waiters().remove(&job_id);
            return StepOutcome::failed(format!("could not queue step: {e}"));
        }
        if let Err(e) = self.pump_agent(&step.agent_id).await {
            warn!(agent_id = %step.agent_id, error = %e, "Queue pump for step failed");
        }

        rx.await
            .unwrap_or_else(|_| StepOutcome::failed("step abandoned"))
    }

    /// Explicit working directory, else the project's configured one.
    fn workspace(&self, explicit: Option<&str>, project_id: &str) -> Option<PathBuf> {
        explicit
            .map(PathBuf::from)
            .or_else(|| self.runner.workspace_for(project_id))
    }

    fn waiters(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<StepOutcome>>> {
        self.step_waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve_step(&self, job_id: &str, outcome: StepOutcome) {
        if let Some(tx) = self.waiters().remove(job_id)
            && tx.send(outcome).is_err()
        {
            debug!(job_id, "Step waiter went away");
        }
    }

    /// Move a feature from `review_ready` to `passing`.
    pub async fn promote(&self, feature_id: &str) -> Result<Feature, OrchestratorError> {
        if !self
            .db
            .transition_feature(feature_id, FeatureStatus::ReviewReady, FeatureStatus::Passing)
            .await?
        {
            let feature = self.db.get_feature(feature_id).await?;
            return Err(OrchestratorError::InvalidTransition {
                feature_id: feature_id.to_string(),
                status: feature.status,
                expected: FeatureStatus::ReviewReady,
            });
        }
        info!(feature_id, "Feature promoted to passing");
        Ok(self.db.get_feature(feature_id).await?)
    }

    // =========================================================================
    // Completion handling
    // =========================================================================

    async fn completion_loop(self: Arc<Self>, mut completions: mpsc::Receiver<SessionCompletion>) {
        loop {
            let completion = tokio::select! {
                () = self.shutdown.cancelled() => break,
                completion = completions.recv() => match completion {
                    Some(completion) => completion,
                    None => break,
                },
            };
            if let Err(e) = self.handle_completion(completion).await {
                error!(error = %e, "Failed to handle session completion");
            }
        }
        debug!("Completion loop stopped");
    }

    /// Book-keep a finished session and start the agent's next job.
    pub async fn handle_completion(
        self: &Arc<Self>,
        completion: SessionCompletion,
    ) -> Result<(), OrchestratorError> {
        if let Some(job_id) = &completion.job_id {
            match completion.mode {
                SessionMode::OneShot => {
                    let outcome = match &completion.outcome {
                        SessionOutcome::Result(result) if result.success => {
                            StepOutcome::Succeeded {
                                report: result.text.clone(),
                            }
                        }
                        other => StepOutcome::failed(other.describe()),
                    };
                    if let StepOutcome::Succeeded {
                        report: Some(report),
                    } = &outcome
                    {
                        let role = self
                            .queue
                            .get(job_id)
                            .await
                            .ok()
                            .and_then(|job| job.payload.role);
                        self.threads
                            .append(
                                &completion.thread_id,
                                Sender::Agent,
                                role.map(Role::as_str),
                                report,
                                None,
                            )
                            .await?;
                    }
                    match &outcome {
                        StepOutcome::Succeeded { .. } => self.queue.complete(job_id).await?,
                        StepOutcome::Failed { reason } => self.queue.fail(job_id, reason).await?,
                    }
                    self.resolve_step(job_id, outcome);
                }
                SessionMode::Interactive => self.queue.complete(job_id).await?,
            }
        }

        if !self.shutdown.is_cancelled() {
            self.pump_agent(&completion.agent_id).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Status and shutdown
    // =========================================================================

    pub async fn health(&self) -> Result<HealthSnapshot, OrchestratorError> {
        let queued_jobs = self
            .queue
            .summary()
            .await?
            .iter()
            .map(|depth| depth.depth)
            .sum();
        Ok(HealthSnapshot {
            active_sessions: self.sessions.active_count().await,
            slots_in_use: self.concurrency.total_active(),
            queued_jobs,
        })
    }

    /// Stop pipeline tasks, end every session and wait for both.
    pub async fn shutdown(&self) {
        info!("Orchestrator shutting down");
        self.shutdown.cancel();
        self.sessions.shutdown().await;
        self.waiters().clear();
        self.tasks.close();
        self.tasks.wait().await;
        info!("Orchestrator stopped");
    }
}

/// Runs pipeline steps as one-shot sessions through the agents' queues.
struct QueuedSteps(Arc<Orchestrator>);

impl StepExecutor for QueuedSteps {
    async fn execute(&self, step: StepRequest) -> StepOutcome {
        self.0.execute_step(step).await
    }
}
