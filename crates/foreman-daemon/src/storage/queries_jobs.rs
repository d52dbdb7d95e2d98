//! Database queries for the per-agent job queue.
//!
//! These are the storage primitives; key allocation and positions live in
//! [`crate::queue`].

use foreman_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{JobKind, JobPayload, QueuedBy, QueuedJob};

/// Fields for inserting a queued job at a precomputed ordering key.
#[derive(Debug, Clone)]
pub struct NewJobRow<'a> {
    pub id: &'a str,
    pub agent_id: &'a str,
    pub project_id: &'a str,
    pub feature_id: Option<&'a str>,
    pub kind: JobKind,
    pub ordering_key: i64,
    pub payload: &'a JobPayload,
    pub queued_by: QueuedBy,
}

impl Database {
    // =========================================================================
    // Queued job queries
    // =========================================================================

    /// Insert a job in `queued` state.
    pub async fn insert_job(&self, job: &NewJobRow<'_>) -> Result<QueuedJob, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT INTO queued_jobs
                (id, agent_id, project_id, feature_id, kind, ordering_key, status,
                 payload, queued_by, enqueued_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 'queued', ?, ?, ?, ?)
            ",
        )
        .bind(job.id)
        .bind(job.agent_id)
        .bind(job.project_id)
        .bind(job.feature_id)
        .bind(job.kind.as_str())
        .bind(job.ordering_key)
        .bind(job.payload.to_json())
        .bind(job.queued_by.as_str())
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_job(job.id).await
    }

    /// Get a job by ID.
    pub async fn get_job(&self, id: &str) -> Result<QueuedJob, DatabaseError> {
        sqlx::query_as::<_, QueuedJob>("SELECT * FROM queued_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Job {id}")))
    }

    /// Queued jobs of one agent in dequeue order.
    pub async fn list_queued_jobs(&self, agent_id: &str) -> Result<Vec<QueuedJob>, DatabaseError> {
        let jobs = sqlx::query_as::<_, QueuedJob>(
            "SELECT * FROM queued_jobs WHERE agent_id = ? AND status = 'queued' ORDER BY ordering_key",
        )
        .bind(agent_id)
        .fetch_all(self.pool())
        .await?;
        Ok(jobs)
    }

    /// Jobs currently marked `processing`.
    pub async fn list_processing_jobs(&self) -> Result<Vec<QueuedJob>, DatabaseError> {
        let jobs = sqlx::query_as::<_, QueuedJob>(
            "SELECT * FROM queued_jobs WHERE status = 'processing' ORDER BY agent_id, ordering_key",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(jobs)
    }

    /// Smallest and largest ordering key among an agent's queued jobs.
    pub async fn queued_key_bounds(
        &self,
        agent_id: &str,
    ) -> Result<Option<(i64, i64)>, DatabaseError> {
        let row: (Option<i64>, Option<i64>) = sqlx::query_as(
            "SELECT MIN(ordering_key), MAX(ordering_key) FROM queued_jobs WHERE agent_id = ? AND status = 'queued'",
        )
        .bind(agent_id)
        .fetch_one(self.pool())
        .await?;
        Ok(row.0.zip(row.1))
    }

    /// Overwrite a queued job's ordering key.
    pub async fn set_job_key(&self, id: &str, ordering_key: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE queued_jobs SET ordering_key = ?, updated_at = ? WHERE id = ? AND status = 'queued'",
        )
        .bind(ordering_key)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Atomically move the agent's head job from `queued` to `processing`.
    ///
    /// A single conditional UPDATE, so concurrent callers can never both
    /// receive the same job.
    pub async fn dequeue_head_job(&self, agent_id: &str) -> Result<Option<QueuedJob>, DatabaseError> {
        let job = sqlx::query_as::<_, QueuedJob>(
            r"
            UPDATE queued_jobs SET status = 'processing', updated_at = ?
            WHERE status = 'queued' AND id = (
                SELECT id FROM queued_jobs
                WHERE agent_id = ? AND status = 'queued'
                ORDER BY ordering_key LIMIT 1
            )
            RETURNING *
            ",
        )
        .bind(unix_timestamp())
        .bind(agent_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(job)
    }

    /// Take a specific queued job wherever it sits in the agent's queue.
    pub async fn dequeue_job(
        &self,
        agent_id: &str,
        job_id: &str,
    ) -> Result<Option<QueuedJob>, DatabaseError> {
        let job = sqlx::query_as::<_, QueuedJob>(
            r"
            UPDATE queued_jobs SET status = 'processing', updated_at = ?
            WHERE id = ? AND agent_id = ? AND status = 'queued'
            RETURNING *
            ",
        )
        .bind(unix_timestamp())
        .bind(job_id)
        .bind(agent_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(job)
    }

    /// Return a `processing` job to `queued` at the given key.
    pub async fn requeue_job(&self, id: &str, ordering_key: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r"
            UPDATE queued_jobs SET status = 'queued', ordering_key = ?, updated_at = ?
            WHERE id = ? AND status = 'processing'
            ",
        )
        .bind(ordering_key)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Delete a queued job of the given agent. `false` if there was none.
    pub async fn delete_queued_job(&self, agent_id: &str, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "DELETE FROM queued_jobs WHERE id = ? AND agent_id = ? AND status = 'queued'",
        )
        .bind(id)
        .bind(agent_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Delete a job regardless of status (used on successful completion).
    pub async fn delete_job(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM queued_jobs WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Mark a job `failed` with a reason. It stays for inspection.
    pub async fn fail_job(&self, id: &str, error: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE queued_jobs SET status = 'failed', error = ?, updated_at = ? WHERE id = ?")
            .bind(error)
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Delete every queued or processing job of a kind. Returns the count.
    pub async fn delete_live_jobs_of_kind(&self, kind: JobKind) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "DELETE FROM queued_jobs WHERE kind = ? AND status IN ('queued', 'processing')",
        )
        .bind(kind.as_str())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Live (queued or processing) pipeline job of a feature.
    pub async fn live_pipeline_job(
        &self,
        feature_id: &str,
    ) -> Result<Option<QueuedJob>, DatabaseError> {
        let job = sqlx::query_as::<_, QueuedJob>(
            r"
            SELECT * FROM queued_jobs
            WHERE feature_id = ? AND kind = 'pipeline' AND status IN ('queued', 'processing')
            ",
        )
        .bind(feature_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(job)
    }

    /// Number of queued jobs per agent, agents with none omitted.
    pub async fn queue_depths(&self) -> Result<Vec<(String, i64)>, DatabaseError> {
        let depths = sqlx::query_as(
            r"
            SELECT agent_id, COUNT(*) FROM queued_jobs
            WHERE status = 'queued'
            GROUP BY agent_id ORDER BY agent_id
            ",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(depths)
    }

    /// Renumber an agent's queued jobs to `gap, 2*gap, ...` keeping order.
    ///
    /// Runs in one transaction. Keys are first moved below every existing
    /// key so the final assignment never collides mid-way.
    pub async fn renumber_queue(&self, agent_id: &str, gap: i64) -> Result<(), DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT id, ordering_key FROM queued_jobs WHERE agent_id = ? AND status = 'queued' ORDER BY ordering_key",
        )
        .bind(agent_id)
        .fetch_all(&mut *tx)
        .await?;
        let Some(floor) = rows.first().map(|(_, key)| (*key).min(gap)) else {
            return Ok(());
        };

        let now = unix_timestamp();
        for (offset, (id, _)) in (1_i64..).zip(&rows) {
            sqlx::query("UPDATE queued_jobs SET ordering_key = ? WHERE id = ?")
                .bind(floor - offset)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        for (rank, (id, _)) in (1_i64..).zip(&rows) {
            sqlx::query("UPDATE queued_jobs SET ordering_key = ?, updated_at = ? WHERE id = ?")
                .bind(rank * gap)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
