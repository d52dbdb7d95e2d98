//! API error body: `{kind, message}`, never internal detail.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use crate::orchestration::OrchestratorError;
use crate::queue::QueueError;
use crate::session::SessionError;
use crate::storage::DatabaseError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "bad_request",
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "not_found",
            message: message.into(),
        }
    }

    fn conflict(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            kind,
            message: message.into(),
        }
    }

    /// Logs the cause and hides it from the client.
    fn internal(cause: &dyn std::fmt::Display) -> Self {
        error!(error = %cause, "Request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal",
            message: "internal error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(&self)).into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(what) => Self::not_found(format!("{what} not found")),
            DatabaseError::Conflict(_) => Self::conflict("conflict", "resource already exists"),
            other => Self::internal(&other),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Database(e) => e.into(),
            QueueError::AlreadyQueued(feature) => Self::conflict(
                "already_queued",
                format!("a pipeline job for feature {feature} is already queued"),
            ),
            other @ QueueError::KeySpaceExhausted(_) => Self::internal(&other),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound { id } => Self::not_found(format!("session {id} not found")),
            SessionError::Terminated { id } => {
                Self::conflict("session_terminated", format!("session {id} has ended"))
            }
            other @ SessionError::SpawnFailed { .. } => {
                error!(error = %other, "Agent spawn failed");
                Self {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    kind: "spawn_failed",
                    message: "agent process could not be started".to_string(),
                }
            }
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::Database(e) => e.into(),
            OrchestratorError::Queue(e) => e.into(),
            OrchestratorError::Session(e) => e.into(),
            OrchestratorError::InvalidTransition { .. } => {
                Self::conflict("invalid_transition", e.to_string())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_hide_their_cause() {
        let err = ApiError::from(DatabaseError::Query("no such column: secret".into()));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.message.contains("secret"));
    }

    #[test]
    fn body_is_kind_and_message_only() {
        let body = serde_json::to_value(ApiError::not_found("feature x not found")).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"kind": "not_found", "message": "feature x not found"})
        );
    }
}
