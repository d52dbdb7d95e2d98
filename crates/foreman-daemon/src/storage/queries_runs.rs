//! Database queries for pipeline runs.

use foreman_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{PipelineRun, RetryCounts, Role, RunState, StepStatus};

impl Database {
    // =========================================================================
    // Pipeline run queries
    // =========================================================================

    /// Create an active run starting at the architect role.
    ///
    /// Fails with [`DatabaseError::Conflict`] if the feature already has an
    /// active run.
    pub async fn create_run(
        &self,
        id: &str,
        feature_id: &str,
        project_id: &str,
        thread_id: &str,
    ) -> Result<PipelineRun, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT INTO pipeline_runs
                (id, feature_id, project_id, thread_id, current_role, step_status,
                 retries, state, started_at, updated_at)
            VALUES (?, ?, ?, ?, 'architect', 'running', '{}', 'running', ?, ?)
            ",
        )
        .bind(id)
        .bind(feature_id)
        .bind(project_id)
        .bind(thread_id)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_run(id).await
    }

    /// Get a run by ID.
    pub async fn get_run(&self, id: &str) -> Result<PipelineRun, DatabaseError> {
        sqlx::query_as::<_, PipelineRun>("SELECT * FROM pipeline_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Pipeline run {id}")))
    }

    /// The active run of a feature, if any.
    pub async fn active_run_for_feature(
        &self,
        feature_id: &str,
    ) -> Result<Option<PipelineRun>, DatabaseError> {
        let run = sqlx::query_as::<_, PipelineRun>(
            "SELECT * FROM pipeline_runs WHERE feature_id = ? AND state = 'running'",
        )
        .bind(feature_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(run)
    }

    /// All runs of a feature, newest first.
    pub async fn list_runs_for_feature(
        &self,
        feature_id: &str,
    ) -> Result<Vec<PipelineRun>, DatabaseError> {
        let runs = sqlx::query_as::<_, PipelineRun>(
            "SELECT * FROM pipeline_runs WHERE feature_id = ? ORDER BY started_at DESC, id",
        )
        .bind(feature_id)
        .fetch_all(self.pool())
        .await?;
        Ok(runs)
    }

    /// Record the current role, step status and retry counters.
    pub async fn update_run_step(
        &self,
        id: &str,
        role: Role,
        step_status: StepStatus,
        retries: &RetryCounts,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            UPDATE pipeline_runs
            SET current_role = ?, step_status = ?, retries = ?, updated_at = ?
            WHERE id = ? AND state = 'running'
            ",
        )
        .bind(role.as_str())
        .bind(step_status.as_str())
        .bind(retries.to_json())
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Archive a run with its terminal state.
    pub async fn finish_run(
        &self,
        id: &str,
        state: RunState,
        failure_reason: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let now = unix_timestamp();
        let result = sqlx::query(
            r"
            UPDATE pipeline_runs
            SET state = ?, failure_reason = ?, updated_at = ?, finished_at = ?
            WHERE id = ? AND state = 'running'
            ",
        )
        .bind(state.as_str())
        .bind(failure_reason)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Mark every active run `abandoned`; returns the affected runs.
    pub async fn abandon_active_runs(&self) -> Result<Vec<PipelineRun>, DatabaseError> {
        let now = unix_timestamp();
        let runs = sqlx::query_as::<_, PipelineRun>(
            r"
            UPDATE pipeline_runs
            SET state = 'abandoned', failure_reason = 'daemon restarted',
                updated_at = ?, finished_at = ?
            WHERE state = 'running'
            RETURNING *
            ",
        )
        .bind(now)
        .bind(now)
        .fetch_all(self.pool())
        .await?;
        Ok(runs)
    }
}
