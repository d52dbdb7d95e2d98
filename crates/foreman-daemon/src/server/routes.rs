//! JSON handlers for features, queues, sessions, threads and health.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use super::error::ApiError;
use crate::orchestration::{DispatchOutcome, DispatchRequest, Orchestrator};
use crate::queue::{NewJob, Placement, QueueDepth, QueueEntry};
use crate::session::SessionInfo;
use crate::storage::{
    Feature, FeatureStatus, FeatureUpdate, JobKind, JobPayload, NewFeature, PipelineRun,
    QueuedBy, ThreadMessage,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

type ApiResult<T> = Result<T, ApiError>;

// =========================================================================
// Features
// =========================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFeatureRequest {
    /// Caller-chosen id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(flatten)]
    pub feature: NewFeature,
}

#[derive(Debug, Default, Deserialize)]
pub struct FeatureFilter {
    pub project: Option<String>,
    pub status: Option<String>,
}

/// `POST /features`
pub async fn create_feature(
    State(state): State<AppState>,
    Json(body): Json<CreateFeatureRequest>,
) -> ApiResult<(StatusCode, Json<Feature>)> {
    if body.feature.title.trim().is_empty() {
        return Err(ApiError::bad_request("title must not be empty"));
    }
    if body.feature.project_id.trim().is_empty() {
        return Err(ApiError::bad_request("projectId must not be empty"));
    }
    let id = body
        .id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    if body.feature.dependencies.iter().any(|dep| dep == &id) {
        return Err(ApiError::bad_request("a feature cannot depend on itself"));
    }
    let feature = state.orchestrator.db().create_feature(&id, &body.feature).await?;
    info!(feature_id = %feature.id, project_id = %feature.project_id, "Feature created");
    Ok((StatusCode::CREATED, Json(feature)))
}

/// `GET /features?project=&status=`
pub async fn list_features(
    State(state): State<AppState>,
    Query(filter): Query<FeatureFilter>,
) -> ApiResult<Json<Vec<Feature>>> {
    let status = filter
        .status
        .as_deref()
        .map(str::parse::<FeatureStatus>)
        .transpose()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let features = state
        .orchestrator
        .db()
        .list_features(filter.project.as_deref(), status)
        .await?;
    Ok(Json(features))
}

/// `GET /features/{id}`
pub async fn get_feature(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Feature>> {
    Ok(Json(state.orchestrator.db().get_feature(&id).await?))
}

/// `PATCH /features/{id}`
pub async fn update_feature(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<FeatureUpdate>,
) -> ApiResult<Json<Feature>> {
    if update.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
        return Err(ApiError::bad_request("title must not be empty"));
    }
    if update
        .dependencies
        .as_ref()
        .is_some_and(|deps| deps.iter().any(|dep| dep == &id))
    {
        return Err(ApiError::bad_request("a feature cannot depend on itself"));
    }
    Ok(Json(state.orchestrator.db().update_feature(&id, &update).await?))
}

/// `POST /features/{id}/promote`
pub async fn promote_feature(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Feature>> {
    Ok(Json(state.orchestrator.promote(&id).await?))
}

/// `GET /features/{id}/runs`
pub async fn list_runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<PipelineRun>>> {
    let db = state.orchestrator.db();
    db.get_feature(&id).await?;
    Ok(Json(db.list_runs_for_feature(&id).await?))
}

// =========================================================================
// Queues
// =========================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub agent_id: String,
    pub project_id: String,
    #[serde(default)]
    pub feature_id: Option<String>,
    #[serde(default)]
    pub payload: JobPayload,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPosition {
    pub job_id: String,
    /// `None` when the job already left the queue.
    pub position: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ReorderRequest {
    pub position: usize,
}

/// `GET /agents/{agent}/queue`
pub async fn list_queue(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ApiResult<Json<Vec<QueueEntry>>> {
    Ok(Json(state.orchestrator.queue().list_queue(&agent_id).await?))
}

/// `POST /queue`
pub async fn enqueue(
    State(state): State<AppState>,
    Json(body): Json<EnqueueRequest>,
) -> ApiResult<(StatusCode, Json<JobPosition>)> {
    if body.agent_id.trim().is_empty() || body.project_id.trim().is_empty() {
        return Err(ApiError::bad_request("agentId and projectId are required"));
    }
    let mut job = NewJob::new(
        &body.agent_id,
        &body.project_id,
        JobKind::Task,
        body.payload,
        QueuedBy::User,
    );
    if let Some(feature_id) = body.feature_id {
        state.orchestrator.db().get_feature(&feature_id).await?;
        job = job.for_feature(feature_id);
    }
    let entry = state.orchestrator.enqueue_job(job, Placement::Tail).await?;
    Ok((
        StatusCode::CREATED,
        Json(JobPosition {
            job_id: entry.job.id,
            position: Some(entry.position),
        }),
    ))
}

/// `DELETE /agents/{agent}/queue/{job}`
///
/// Removing a job that already left the queue is a no-op.
pub async fn remove_job(
    State(state): State<AppState>,
    Path((agent_id, job_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    if !state.orchestrator.queue().remove(&agent_id, &job_id).await? {
        debug!(%agent_id, %job_id, "Remove of a job no longer queued");
    }
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /agents/{agent}/queue/{job}/reorder`
pub async fn reorder_job(
    State(state): State<AppState>,
    Path((agent_id, job_id)): Path<(String, String)>,
    Json(body): Json<ReorderRequest>,
) -> ApiResult<Json<JobPosition>> {
    let position = state
        .orchestrator
        .queue()
        .reorder(&agent_id, &job_id, body.position)
        .await?;
    if position.is_none() {
        debug!(%agent_id, %job_id, "Reorder of a job no longer queued");
    }
    Ok(Json(JobPosition { job_id, position }))
}

/// `GET /queue/summary`
pub async fn queue_summary(State(state): State<AppState>) -> ApiResult<Json<Vec<QueueDepth>>> {
    Ok(Json(state.orchestrator.queue().summary().await?))
}

// =========================================================================
// Sessions
// =========================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchBody {
    pub agent_id: String,
    pub project_id: String,
    #[serde(default)]
    pub initial_input: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub workspace: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TurnBody {
    pub text: String,
}

/// `POST /sessions`: start now or queue. A busy agent is not an error.
pub async fn dispatch(
    State(state): State<AppState>,
    Json(body): Json<DispatchBody>,
) -> ApiResult<Response> {
    if body.agent_id.trim().is_empty() || body.project_id.trim().is_empty() {
        return Err(ApiError::bad_request("agentId and projectId are required"));
    }
    let request = DispatchRequest {
        agent_id: body.agent_id,
        project_id: body.project_id,
        initial_input: body.initial_input,
        thread_id: body.thread_id,
        workspace: body.workspace,
    };
    let response = match state.orchestrator.dispatch(request).await? {
        DispatchOutcome::Started {
            session_id,
            thread_id,
        } => (
            StatusCode::CREATED,
            Json(json!({ "started": true, "sessionId": session_id, "threadId": thread_id })),
        ),
        DispatchOutcome::Queued { job_id, position } => (
            StatusCode::ACCEPTED,
            Json(json!({ "queued": true, "jobId": job_id, "position": position })),
        ),
    };
    Ok(response.into_response())
}

/// `GET /sessions`
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.orchestrator.sessions().list().await)
}

/// `POST /sessions/{id}/messages`
pub async fn send_turn(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<TurnBody>,
) -> ApiResult<Json<SessionInfo>> {
    if body.text.trim().is_empty() {
        return Err(ApiError::bad_request("text must not be empty"));
    }
    Ok(Json(state.orchestrator.send_turn(&session_id, &body.text).await?))
}

/// `DELETE /sessions/{id}`
pub async fn end_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.orchestrator.sessions().end_session(&session_id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("session {session_id} not found")))
    }
}

// =========================================================================
// Threads and health
// =========================================================================

#[derive(Debug, Default, Deserialize)]
pub struct AfterQuery {
    #[serde(default)]
    pub after: i64,
}

/// `GET /threads/{id}/messages?after=`
pub async fn thread_messages(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Query(query): Query<AfterQuery>,
) -> ApiResult<Json<Vec<ThreadMessage>>> {
    Ok(Json(state.orchestrator.threads().list(&thread_id, query.after).await?))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let snapshot = state.orchestrator.health().await?;
    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "activeSessions": snapshot.active_sessions,
        "slotsInUse": snapshot.slots_in_use,
        "queuedJobs": snapshot.queued_jobs,
    })))
}
