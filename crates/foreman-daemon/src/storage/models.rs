//! Database models for the Foreman daemon.
//!
//! Enumerated columns are stored as TEXT and decoded into closed enums.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A TEXT column held a value outside its enum.
#[derive(Debug, thiserror::Error)]
#[error("Unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Define a closed enum stored as TEXT, with `as_str`, `Display`, `FromStr`
/// and `TryFrom<String>` (used by `#[sqlx(try_from = "String")]`).
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = UnknownVariant;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                s.parse()
            }
        }
    };
}

text_enum! {
    /// Feature lifecycle status.
    FeatureStatus {
        Pending => "pending",
        InProgress => "in_progress",
        ReviewReady => "review_ready",
        Passing => "passing",
        Failing => "failing",
    }
}

text_enum! {
    /// Queued job status.
    JobStatus {
        Queued => "queued",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
}

text_enum! {
    /// What a queued job does once dequeued.
    JobKind {
        /// A feature waiting for a project slot to start its pipeline.
        Pipeline => "pipeline",
        /// One role step of an already running pipeline.
        Step => "step",
        /// A user dispatch for an agent that was busy.
        Task => "task",
    }
}

text_enum! {
    /// Who put a job in the queue.
    QueuedBy {
        User => "user",
        Auto => "auto",
    }
}

text_enum! {
    /// The four pipeline roles, in pipeline order.
    Role {
        Architect => "architect",
        Coder => "coder",
        Reviewer => "reviewer",
        Tester => "tester",
    }
}

text_enum! {
    /// Status of the current step of a run.
    StepStatus {
        Running => "running",
        Retrying => "retrying",
        Succeeded => "succeeded",
        Failed => "failed",
    }
}

text_enum! {
    /// Run state; everything but `Running` is terminal.
    RunState {
        Running => "running",
        Passing => "passing",
        ReviewReady => "review_ready",
        Failing => "failing",
        /// The daemon restarted while the run was active.
        Abandoned => "abandoned",
    }
}

text_enum! {
    /// Author of a thread message.
    Sender {
        User => "user",
        Agent => "agent",
        System => "system",
    }
}

/// Feature record. `dependencies` is loaded from `feature_dependencies`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub description: String,
    pub priority: i64,
    #[sqlx(try_from = "String")]
    pub status: FeatureStatus,
    #[sqlx(skip)]
    pub dependencies: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields for a new feature.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFeature {
    pub project_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Partial update of a feature's descriptive fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<i64>,
    pub dependencies: Option<Vec<String>>,
}

/// Per-role retry counters of a run, stored as a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryCounts(pub BTreeMap<Role, u32>);

impl RetryCounts {
    pub fn get(&self, role: Role) -> u32 {
        self.0.get(&role).copied().unwrap_or(0)
    }

    pub fn increment(&mut self, role: Role) {
        *self.0.entry(role).or_insert(0) += 1;
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }
}

impl TryFrom<String> for RetryCounts {
    type Error = serde_json::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        serde_json::from_str(&s).map(Self)
    }
}

/// Pipeline run record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRun {
    pub id: String,
    pub feature_id: String,
    pub project_id: String,
    pub thread_id: String,
    #[sqlx(try_from = "String")]
    pub current_role: Role,
    #[sqlx(try_from = "String")]
    pub step_status: StepStatus,
    #[sqlx(try_from = "String")]
    pub retries: RetryCounts,
    #[sqlx(try_from = "String")]
    pub state: RunState,
    pub failure_reason: Option<String>,
    pub started_at: i64,
    pub updated_at: i64,
    pub finished_at: Option<i64>,
}

/// Job-specific data carried through the queue as JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    /// First turn sent to the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    /// Thread the session reports into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Working directory for the agent process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    /// Caller fields the daemon does not interpret, kept as given.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl JobPayload {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

impl TryFrom<String> for JobPayload {
    type Error = serde_json::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        serde_json::from_str(&s)
    }
}

/// Queued job record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct QueuedJob {
    pub id: String,
    pub agent_id: String,
    pub project_id: String,
    pub feature_id: Option<String>,
    #[sqlx(try_from = "String")]
    pub kind: JobKind,
    pub ordering_key: i64,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    #[sqlx(try_from = "String")]
    pub payload: JobPayload,
    #[sqlx(try_from = "String")]
    pub queued_by: QueuedBy,
    pub error: Option<String>,
    pub enqueued_at: i64,
    pub updated_at: i64,
}

/// Thread message record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ThreadMessage {
    pub id: i64,
    pub thread_id: String,
    pub sequence: i64,
    #[sqlx(try_from = "String")]
    pub sender: Sender,
    pub role: Option<String>,
    pub content: String,
    pub payload: Option<String>,
    pub created_at: i64,
}
