//! Work session manager.
//!
//! One long-lived agent subprocess per busy agent. Each session runs in its
//! own task that reads stdout line by line, republishes classified output on
//! the thread's bus channel, writes turns to stdin and watches the idle
//! clock. Idle timeout, explicit end, a terminal result (one-shot mode) and
//! process exit all leave through the same teardown, which reports a
//! [`SessionCompletion`] exactly once on the completion channel.

pub mod classify;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use foreman_core::config::SessionConfig;
use foreman_core::db::unix_timestamp_ms;
use foreman_core::ndjson::user_turn;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{RwLock, mpsc};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::bus::{ChannelId, EventPayload, NewEvent, StreamBus};
use classify::{TurnResult, classify_line};

/// How long a session lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Stays alive across turns until idle timeout or explicit end.
    Interactive,
    /// Ends as soon as the terminal result line arrives.
    OneShot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Active,
    Terminated,
}

/// Request to start a session for an agent.
#[derive(Debug, Clone)]
pub struct StartSession {
    pub agent_id: String,
    pub thread_id: String,
    pub workspace: Option<PathBuf>,
    pub initial_input: Option<String>,
    pub mode: SessionMode,
    /// Queued job this session executes, if any.
    pub job_id: Option<String>,
}

/// Observable state of a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub agent_id: String,
    pub thread_id: String,
    pub job_id: Option<String>,
    pub mode: SessionMode,
    pub state: SessionState,
    pub busy: bool,
    pub started_at_ms: i64,
    pub last_activity_ms: i64,
}

/// Result of [`WorkSessionManager::start`].
#[derive(Debug, Clone)]
pub enum StartOutcome {
    Started(SessionInfo),
    /// The agent already had a session; nothing was spawned.
    Existing(SessionInfo),
}

impl StartOutcome {
    pub const fn info(&self) -> &SessionInfo {
        match self {
            Self::Started(info) | Self::Existing(info) => info,
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// A one-shot session produced its terminal result.
    Result(TurnResult),
    /// No input arrived within the idle timeout.
    IdleTimeout,
    /// `end_session` or shutdown.
    Ended,
    /// The process exited on its own.
    Exited { code: Option<i32> },
}

impl SessionOutcome {
    /// Whether the session produced a successful result.
    pub const fn succeeded(&self) -> bool {
        matches!(self, Self::Result(TurnResult { success: true, .. }))
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Result(TurnResult { success: true, .. }) => "result_success".to_string(),
            Self::Result(TurnResult { text, .. }) => text
                .as_deref()
                .map_or_else(|| "result_failure".to_string(), |t| format!("result_failure: {t}")),
            Self::IdleTimeout => "idle_timeout".to_string(),
            Self::Ended => "ended".to_string(),
            Self::Exited { code: Some(code) } => format!("exited with code {code}"),
            Self::Exited { code: None } => "exited".to_string(),
        }
    }
}

/// Reported once per session when it terminates.
#[derive(Debug, Clone)]
pub struct SessionCompletion {
    pub session_id: String,
    pub agent_id: String,
    pub thread_id: String,
    pub job_id: Option<String>,
    pub mode: SessionMode,
    pub outcome: SessionOutcome,
}

/// Errors from session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to spawn agent process: {reason}")]
    SpawnFailed { reason: String },

    #[error("Session not found: {id}")]
    NotFound { id: String },

    #[error("Session already terminated: {id}")]
    Terminated { id: String },
}

struct SessionEntry {
    info: SessionInfo,
    input_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

type SessionMap = Arc<RwLock<HashMap<String, SessionEntry>>>;

/// Lifecycle of agent subprocesses, at most one per agent.
pub struct WorkSessionManager {
    /// Live sessions keyed by agent id.
    sessions: SessionMap,
    bus: Arc<StreamBus>,
    config: SessionConfig,
    completion_tx: mpsc::Sender<SessionCompletion>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl WorkSessionManager {
    /// Create a manager and the receiving end of its completion channel.
    pub fn new(
        config: SessionConfig,
        bus: Arc<StreamBus>,
    ) -> (Self, mpsc::Receiver<SessionCompletion>) {
        let (completion_tx, completion_rx) = mpsc::channel(64);
        let manager = Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            bus,
            config,
            completion_tx,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        };
        (manager, completion_rx)
    }

    /// Start a session, or return the agent's existing one.
    ///
    /// The check and the spawn happen under one write lock, so concurrent
    /// starts for one agent yield exactly one `Started`.
    pub async fn start(&self, request: StartSession) -> Result<StartOutcome, SessionError> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&request.agent_id) {
            debug!(agent_id = %request.agent_id, session_id = %existing.info.session_id, "Agent already has a session");
            return Ok(StartOutcome::Existing(existing.info.clone()));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let mut child = self.spawn_agent(&request, &session_id)?;
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                child.start_kill().ok();
                return Err(SessionError::SpawnFailed {
                    reason: "Failed to capture agent stdio".to_string(),
                });
            }
        };
        forward_stderr(&mut child, &session_id);

        let now = unix_timestamp_ms();
        let info = SessionInfo {
            session_id: session_id.clone(),
            agent_id: request.agent_id.clone(),
            thread_id: request.thread_id.clone(),
            job_id: request.job_id.clone(),
            mode: request.mode,
            state: SessionState::Starting,
            busy: request.initial_input.is_some(),
            started_at_ms: now,
            last_activity_ms: now,
        };
        let (input_tx, input_rx) = mpsc::channel(32);
        let cancel = self.shutdown.child_token();
        sessions.insert(
            request.agent_id.clone(),
            SessionEntry {
                info: info.clone(),
                input_tx,
                cancel: cancel.clone(),
            },
        );
        // A thread continued by a new session takes events again.
        self.bus
            .reopen(&ChannelId::Thread(request.thread_id.clone()))
            .await;
        drop(sessions);

        info!(
            agent_id = %request.agent_id,
            session_id = %session_id,
            thread_id = %request.thread_id,
            mode = ?request.mode,
            "Session started"
        );
        self.bus
            .publish(
                &ChannelId::Thread(request.thread_id.clone()),
                NewEvent::new(EventPayload::SessionStarted {
                    agent_id: request.agent_id.clone(),
                })
                .session(&session_id)
                .thread(&request.thread_id),
            )
            .await;

        let task = SessionTask {
            ctx: SessionContext {
                info: info.clone(),
                sessions: Arc::clone(&self.sessions),
                bus: Arc::clone(&self.bus),
                completion_tx: self.completion_tx.clone(),
            },
            child,
            stdin,
            stdout,
            input_rx,
            initial_input: request.initial_input,
            cancel,
            idle_timeout: self.config.idle_timeout(),
            terminate_grace: self.config.terminate_grace(),
        };
        self.tasks.spawn(task.run());

        Ok(StartOutcome::Started(info))
    }

    fn spawn_agent(&self, request: &StartSession, session_id: &str) -> Result<Child, SessionError> {
        let working_dir = match &request.workspace {
            Some(dir) if dir.is_dir() => dir.clone(),
            requested => {
                let fallback = std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir());
                if let Some(requested) = requested {
                    warn!(
                        requested = %requested.display(),
                        fallback = %fallback.display(),
                        "Workspace missing, using fallback"
                    );
                }
                fallback
            }
        };

        let mut cmd = Command::new(&self.config.agent_program);
        cmd.args(&self.config.agent_args)
            .current_dir(&working_dir)
            .env("FOREMAN_AGENT_ID", &request.agent_id)
            .env("FOREMAN_SESSION_ID", session_id)
            .env("FOREMAN_THREAD_ID", &request.thread_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            agent_id = %request.agent_id,
            program = %self.config.agent_program,
            working_dir = %working_dir.display(),
            "Spawning agent subprocess"
        );
        cmd.spawn().map_err(|e| SessionError::SpawnFailed {
            reason: e.to_string(),
        })
    }

    /// Send one user turn to a session. Resets its idle clock.
    pub async fn send(&self, session_id: &str, text: &str) -> Result<SessionInfo, SessionError> {
        let (input_tx, info) = {
            let sessions = self.sessions.read().await;
            let entry = sessions
                .values()
                .find(|entry| entry.info.session_id == session_id)
                .ok_or_else(|| SessionError::NotFound {
                    id: session_id.to_string(),
                })?;
            if entry.cancel.is_cancelled() {
                return Err(SessionError::Terminated {
                    id: session_id.to_string(),
                });
            }
            (entry.input_tx.clone(), entry.info.clone())
        };
        input_tx
            .send(text.to_string())
            .await
            .map_err(|_| SessionError::Terminated {
                id: session_id.to_string(),
            })?;
        Ok(info)
    }

    /// Request termination. Idempotent; `false` if no such live session.
    pub async fn end_session(&self, session_id: &str) -> bool {
        let sessions = self.sessions.read().await;
        let Some(entry) = sessions
            .values()
            .find(|entry| entry.info.session_id == session_id)
        else {
            return false;
        };
        info!(session_id, agent_id = %entry.info.agent_id, "Ending session");
        entry.cancel.cancel();
        true
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions
            .read()
            .await
            .values()
            .find(|entry| entry.info.session_id == session_id)
            .map(|entry| entry.info.clone())
    }

    pub async fn session_for_agent(&self, agent_id: &str) -> Option<SessionInfo> {
        self.sessions
            .read()
            .await
            .get(agent_id)
            .map(|entry| entry.info.clone())
    }

    pub async fn has_session(&self, agent_id: &str) -> bool {
        self.sessions.read().await.contains_key(agent_id)
    }

    /// Live sessions ordered by agent.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .read()
            .await
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        sessions.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        sessions
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// End every session and wait for their teardown.
    pub async fn shutdown(&self) {
        info!("Shutting down all sessions");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

fn forward_stderr(child: &mut Child, session_id: &str) {
    if let Some(stderr) = child.stderr.take() {
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(session_id = %session_id, "stderr: {}", line);
            }
        });
    }
}

/// What the teardown needs to report a session.
struct SessionContext {
    info: SessionInfo,
    sessions: SessionMap,
    bus: Arc<StreamBus>,
    completion_tx: mpsc::Sender<SessionCompletion>,
}

struct SessionTask {
    ctx: SessionContext,
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    input_rx: mpsc::Receiver<String>,
    initial_input: Option<String>,
    cancel: CancellationToken,
    idle_timeout: Duration,
    terminate_grace: Duration,
}

impl SessionTask {
    async fn run(self) {
        let Self {
            ctx,
            mut child,
            stdin,
            stdout,
            mut input_rx,
            initial_input,
            cancel,
            idle_timeout,
            terminate_grace,
        } = self;
        let session_id = ctx.info.session_id.clone();
        let thread_id = ctx.info.thread_id.clone();
        let channel = ChannelId::Thread(thread_id.clone());
        let mut lines = BufReader::new(stdout).lines();
        let mut stdin = Some(stdin);

        if let Some(input) = initial_input {
            write_turn(&mut stdin, &input, &session_id).await;
        }
        ctx.update(|info| info.state = SessionState::Active).await;

        let mut deadline = Instant::now() + idle_timeout;
        let outcome = loop {
            tokio::select! {
                () = cancel.cancelled() => break SessionOutcome::Ended,
                () = sleep_until(deadline) => {
                    info!(session_id = %session_id, "Session idle timeout");
                    break SessionOutcome::IdleTimeout;
                }
                Some(turn) = input_rx.recv() => {
                    write_turn(&mut stdin, &turn, &session_id).await;
                    deadline = Instant::now() + idle_timeout;
                    ctx.update(|info| {
                        info.busy = true;
                        info.last_activity_ms = unix_timestamp_ms();
                    })
                    .await;
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let classified = classify_line(&line);
                        for payload in classified.events {
                            ctx.bus
                                .publish(
                                    &channel,
                                    NewEvent::new(payload)
                                        .session(&session_id)
                                        .thread(&thread_id),
                                )
                                .await;
                        }
                        let finished_turn = classified.result.is_some();
                        ctx.update(|info| {
                            info.last_activity_ms = unix_timestamp_ms();
                            if finished_turn {
                                info.busy = false;
                            }
                        })
                        .await;
                        if let Some(result) = classified.result
                            && ctx.info.mode == SessionMode::OneShot
                        {
                            break SessionOutcome::Result(result);
                        }
                    }
                    Ok(None) => break SessionOutcome::Exited { code: None },
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "Failed to read agent stdout");
                        break SessionOutcome::Exited { code: None };
                    }
                },
            }
        };

        drop(stdin);
        let code = terminate(&mut child, terminate_grace, &session_id).await;
        let outcome = match outcome {
            SessionOutcome::Exited { .. } => SessionOutcome::Exited { code },
            other => other,
        };
        ctx.finish(&channel, outcome).await;
    }
}

impl SessionContext {
    async fn update(&self, apply: impl FnOnce(&mut SessionInfo)) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(&self.info.agent_id)
            && entry.info.session_id == self.info.session_id
        {
            apply(&mut entry.info);
        }
    }

    /// Remove the session and report it. Runs once per session.
    ///
    /// An interactive session's thread channel closes with it unless another
    /// live session reports into the same thread. Both happen under the
    /// sessions lock so a concurrent start on that thread reopens after.
    async fn finish(self, channel: &ChannelId, outcome: SessionOutcome) {
        info!(
            session_id = %self.info.session_id,
            agent_id = %self.info.agent_id,
            outcome = %outcome.describe(),
            "Session terminated"
        );
        {
            let mut sessions = self.sessions.write().await;
            if let Some(entry) = sessions.get_mut(&self.info.agent_id)
                && entry.info.session_id == self.info.session_id
            {
                entry.info.state = SessionState::Terminated;
                sessions.remove(&self.info.agent_id);
            }
            self.bus
                .publish(
                    channel,
                    NewEvent::new(EventPayload::SessionEnded {
                        agent_id: self.info.agent_id.clone(),
                        outcome: outcome.describe(),
                    })
                    .session(&self.info.session_id)
                    .thread(&self.info.thread_id),
                )
                .await;
            let thread_idle = self.info.mode == SessionMode::Interactive
                && !sessions
                    .values()
                    .any(|entry| entry.info.thread_id == self.info.thread_id);
            if thread_idle {
                self.bus.close(channel, "session ended").await;
            }
        }

        let completion = SessionCompletion {
            session_id: self.info.session_id,
            agent_id: self.info.agent_id,
            thread_id: self.info.thread_id,
            job_id: self.info.job_id,
            mode: self.info.mode,
            outcome,
        };
        if self.completion_tx.send(completion).await.is_err() {
            debug!("Completion channel closed");
        }
    }
}

async fn write_turn(stdin: &mut Option<ChildStdin>, text: &str, session_id: &str) {
    let Some(pipe) = stdin.as_mut() else {
        return;
    };
    let mut line = user_turn(text);
    line.push('\n');
    let written = async {
        pipe.write_all(line.as_bytes()).await?;
        pipe.flush().await
    }
    .await;
    if let Err(e) = written {
        error!(session_id, error = %e, "Failed to write to agent stdin");
        *stdin = None;
    }
}

/// Stop the process: SIGTERM, wait up to `grace`, then SIGKILL.
async fn terminate(child: &mut Child, grace: Duration, session_id: &str) -> Option<i32> {
    if let Ok(Some(status)) = child.try_wait() {
        return status.code();
    }

    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) {
        // SAFETY: pid belongs to a child we spawned and have not reaped yet.
        #[allow(unsafe_code)]
        let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            warn!(session_id, pid, error = %err, "Failed to send SIGTERM");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(session_id, ?status, "Agent exited");
            status.code()
        }
        Ok(Err(e)) => {
            warn!(session_id, error = %e, "Error waiting for agent");
            child.kill().await.ok();
            None
        }
        Err(_) => {
            warn!(session_id, "Agent ignored SIGTERM, killing");
            child.kill().await.ok();
            None
        }
    }
}
