//! Per-agent persisted job queue.
//!
//! Jobs are ordered by a gap-numbered key (step [`GAP`]). Inserting between
//! two jobs takes the midpoint of their keys, so a move rewrites only the
//! moved job. When two neighbours leave no integer between them the agent's
//! queue is renumbered once, in one transaction.
//!
//! Key-allocating mutations of one agent's queue are serialized by a
//! per-agent lock. `dequeue` does not take the lock: it is a single
//! conditional UPDATE in the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::storage::{
    Database, DatabaseError, JobKind, JobPayload, NewJobRow, QueuedBy, QueuedJob,
};

/// Distance between neighbouring ordering keys after a renumber.
pub const GAP: i64 = 10;

/// Where a new job lands in the agent's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// After every queued job.
    Tail,
    /// After the queued step jobs, before everything else.
    Front,
}

/// A job to enqueue.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Chosen by the caller so it can register interest before the insert.
    pub id: String,
    pub agent_id: String,
    pub project_id: String,
    pub feature_id: Option<String>,
    pub kind: JobKind,
    pub payload: JobPayload,
    pub queued_by: QueuedBy,
}

impl NewJob {
    /// A job with a fresh id.
    pub fn new(
        agent_id: impl Into<String>,
        project_id: impl Into<String>,
        kind: JobKind,
        payload: JobPayload,
        queued_by: QueuedBy,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            project_id: project_id.into(),
            feature_id: None,
            kind,
            payload,
            queued_by,
        }
    }

    #[must_use]
    pub fn for_feature(mut self, feature_id: impl Into<String>) -> Self {
        self.feature_id = Some(feature_id.into());
        self
    }
}

/// A queued job with its 1-based position.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub position: usize,
    #[serde(flatten)]
    pub job: QueuedJob,
}

/// Queued job count of one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDepth {
    pub agent_id: String,
    pub depth: i64,
}

/// Errors from queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// The feature already has a live pipeline job.
    #[error("Feature {0} already has a queued pipeline job")]
    AlreadyQueued(String),

    #[error("No ordering key available between neighbours in queue of {0}")]
    KeySpaceExhausted(String),
}

/// Key strictly between `prev` and `next`, or `None` if there is no gap.
///
/// An open end extends by [`GAP`].
pub fn key_between(prev: Option<i64>, next: Option<i64>) -> Option<i64> {
    match (prev, next) {
        (None, None) => Some(GAP),
        (Some(prev), None) => prev.checked_add(GAP),
        (None, Some(next)) => next.checked_sub(GAP),
        (Some(prev), Some(next)) => {
            let span = next.checked_sub(prev)?;
            (span >= 2).then(|| prev + span / 2)
        }
    }
}

/// Key for inserting before `keys[index]` (or at the end).
fn key_at(keys: &[i64], index: usize) -> Option<i64> {
    let prev = index.checked_sub(1).and_then(|i| keys.get(i)).copied();
    key_between(prev, keys.get(index).copied())
}

/// The agent job queue.
pub struct AgentJobQueue {
    db: Database,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AgentJobQueue {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_agent(&self, agent_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(agent_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Keys of an agent's queued jobs in order, without `exclude`.
    async fn queued_keys(
        &self,
        agent_id: &str,
        exclude: Option<&str>,
    ) -> Result<Vec<(String, JobKind, i64)>, QueueError> {
        Ok(self
            .db
            .list_queued_jobs(agent_id)
            .await?
            .into_iter()
            .filter(|job| Some(job.id.as_str()) != exclude)
            .map(|job| (job.id, job.kind, job.ordering_key))
            .collect())
    }

    /// Allocate a key at `index` among the queued jobs (minus `exclude`),
    /// renumbering the queue once if the neighbours are adjacent.
    async fn allocate_key(
        &self,
        agent_id: &str,
        index: usize,
        exclude: Option<&str>,
        keys: &[i64],
    ) -> Result<i64, QueueError> {
        if let Some(key) = key_at(keys, index) {
            return Ok(key);
        }
        info!(agent_id, "Renumbering job queue");
        self.db.renumber_queue(agent_id, GAP).await?;
        let keys: Vec<i64> = self
            .queued_keys(agent_id, exclude)
            .await?
            .into_iter()
            .map(|(_, _, key)| key)
            .collect();
        key_at(&keys, index).ok_or_else(|| QueueError::KeySpaceExhausted(agent_id.to_string()))
    }

    /// Add a job and return it with its 1-based position.
    pub async fn enqueue(
        &self,
        job: NewJob,
        placement: Placement,
    ) -> Result<QueueEntry, QueueError> {
        let _guard = self.lock_agent(&job.agent_id).await;

        let queued = self.queued_keys(&job.agent_id, None).await?;
        let index = match placement {
            Placement::Tail => queued.len(),
            Placement::Front => queued
                .iter()
                .take_while(|(_, kind, _)| *kind == JobKind::Step)
                .count(),
        };
        let keys: Vec<i64> = queued.iter().map(|(_, _, key)| *key).collect();
        let ordering_key = self.allocate_key(&job.agent_id, index, None, &keys).await?;

        let row = NewJobRow {
            id: &job.id,
            agent_id: &job.agent_id,
            project_id: &job.project_id,
            feature_id: job.feature_id.as_deref(),
            kind: job.kind,
            ordering_key,
            payload: &job.payload,
            queued_by: job.queued_by,
        };
        let inserted = match self.db.insert_job(&row).await {
            Ok(inserted) => inserted,
            Err(DatabaseError::Conflict(_)) if job.kind == JobKind::Pipeline => {
                return Err(QueueError::AlreadyQueued(
                    job.feature_id.unwrap_or_default(),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            agent_id = %inserted.agent_id,
            job_id = %inserted.id,
            kind = %inserted.kind,
            position = index + 1,
            "Job enqueued"
        );
        Ok(QueueEntry {
            position: index + 1,
            job: inserted,
        })
    }

    /// Take the head job of an agent, marking it `processing`.
    pub async fn dequeue(&self, agent_id: &str) -> Result<Option<QueuedJob>, QueueError> {
        let job = self.db.dequeue_head_job(agent_id).await?;
        if let Some(job) = &job {
            debug!(agent_id, job_id = %job.id, "Job dequeued");
        }
        Ok(job)
    }

    /// Take a specific job if it is still queued, at any position.
    pub async fn take(&self, agent_id: &str, job_id: &str) -> Result<Option<QueuedJob>, QueueError> {
        let job = self.db.dequeue_job(agent_id, job_id).await?;
        if job.is_some() {
            debug!(agent_id, job_id, "Job taken from queue");
        }
        Ok(job)
    }

    /// The head job without taking it.
    pub async fn peek(&self, agent_id: &str) -> Result<Option<QueuedJob>, QueueError> {
        Ok(self.db.list_queued_jobs(agent_id).await?.into_iter().next())
    }

    /// Remove a queued job. Missing jobs are a no-op (`false`).
    pub async fn remove(&self, agent_id: &str, job_id: &str) -> Result<bool, QueueError> {
        let _guard = self.lock_agent(agent_id).await;
        let removed = self.db.delete_queued_job(agent_id, job_id).await?;
        if removed {
            info!(agent_id, job_id, "Job removed from queue");
        }
        Ok(removed)
    }

    /// Move a queued job to `new_position` (1-based, clamped).
    ///
    /// Returns the resulting position, or `None` if the job is not queued
    /// for this agent.
    pub async fn reorder(
        &self,
        agent_id: &str,
        job_id: &str,
        new_position: usize,
    ) -> Result<Option<usize>, QueueError> {
        let _guard = self.lock_agent(agent_id).await;

        let queued = self.queued_keys(agent_id, None).await?;
        let Some(current) = queued.iter().position(|(id, _, _)| id == job_id) else {
            return Ok(None);
        };
        let target = new_position.clamp(1, queued.len()) - 1;
        if target == current {
            return Ok(Some(current + 1));
        }

        let others: Vec<i64> = queued
            .iter()
            .filter(|(id, _, _)| id != job_id)
            .map(|(_, _, key)| *key)
            .collect();
        let key = self
            .allocate_key(agent_id, target, Some(job_id), &others)
            .await?;
        if !self.db.set_job_key(job_id, key).await? {
            // Dequeued between the listing and the update.
            return Ok(None);
        }

        info!(agent_id, job_id, from = current + 1, to = target + 1, "Job reordered");
        Ok(Some(target + 1))
    }

    /// Queued jobs of an agent with positions.
    pub async fn list_queue(&self, agent_id: &str) -> Result<Vec<QueueEntry>, QueueError> {
        Ok(self
            .db
            .list_queued_jobs(agent_id)
            .await?
            .into_iter()
            .enumerate()
            .map(|(i, job)| QueueEntry {
                position: i + 1,
                job,
            })
            .collect())
    }

    /// Position of a queued job, if it is queued.
    pub async fn position(&self, agent_id: &str, job_id: &str) -> Result<Option<usize>, QueueError> {
        Ok(self
            .db
            .list_queued_jobs(agent_id)
            .await?
            .iter()
            .position(|job| job.id == job_id)
            .map(|i| i + 1))
    }

    /// Queue depth per agent with queued work.
    pub async fn summary(&self) -> Result<Vec<QueueDepth>, QueueError> {
        Ok(self
            .db
            .queue_depths()
            .await?
            .into_iter()
            .map(|(agent_id, depth)| QueueDepth { agent_id, depth })
            .collect())
    }

    /// Finish a processing job successfully; the row is deleted.
    pub async fn complete(&self, job_id: &str) -> Result<(), QueueError> {
        if self.db.delete_job(job_id).await? {
            debug!(job_id, "Job completed");
        }
        Ok(())
    }

    /// Mark a job failed. It stays for inspection.
    pub async fn fail(&self, job_id: &str, error: &str) -> Result<(), QueueError> {
        warn!(job_id, error, "Job failed");
        self.db.fail_job(job_id, error).await?;
        Ok(())
    }

    /// Put a processing job back at the very front of its agent's queue.
    pub async fn requeue(&self, job: &QueuedJob) -> Result<bool, QueueError> {
        let _guard = self.lock_agent(&job.agent_id).await;
        let front = self.db.queued_key_bounds(&job.agent_id).await?.map(|(min, _)| min);
        let key = key_between(None, front)
            .ok_or_else(|| QueueError::KeySpaceExhausted(job.agent_id.clone()))?;
        let requeued = self.db.requeue_job(&job.id, key).await?;
        if requeued {
            debug!(agent_id = %job.agent_id, job_id = %job.id, "Job requeued");
        }
        Ok(requeued)
    }

    /// Return every `processing` job to the front of its queue.
    pub async fn recover(&self) -> Result<usize, QueueError> {
        let mut recovered = 0;
        // Last first, so jobs of one agent keep their relative order.
        for job in self.db.list_processing_jobs().await?.iter().rev() {
            if self.requeue(job).await? {
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(recovered, "Returned interrupted jobs to their queues");
        }
        Ok(recovered)
    }

    /// The live pipeline job of a feature, if any.
    pub async fn live_job_for_feature(
        &self,
        feature_id: &str,
    ) -> Result<Option<QueuedJob>, QueueError> {
        Ok(self.db.live_pipeline_job(feature_id).await?)
    }

    pub async fn get(&self, job_id: &str) -> Result<QueuedJob, QueueError> {
        Ok(self.db.get_job(job_id).await?)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::JobStatus;

    fn task(agent: &str) -> NewJob {
        NewJob::new(agent, "p1", JobKind::Task, JobPayload::default(), QueuedBy::User)
    }

    async fn queue() -> AgentJobQueue {
        AgentJobQueue::new(Database::open_in_memory().await.unwrap())
    }

    async fn ids(queue: &AgentJobQueue, agent: &str) -> Vec<String> {
        queue
            .list_queue(agent)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.job.id)
            .collect()
    }

    #[test]
    fn key_between_cases() {
        assert_eq!(key_between(None, None), Some(10));
        assert_eq!(key_between(Some(30), None), Some(40));
        assert_eq!(key_between(None, Some(10)), Some(0));
        assert_eq!(key_between(Some(10), Some(20)), Some(15));
        assert_eq!(key_between(Some(10), Some(12)), Some(11));
        assert_eq!(key_between(Some(10), Some(11)), None);
    }

    #[tokio::test]
    async fn enqueue_appends_with_gap_keys() {
        let q = queue().await;
        for expected in 1..=3 {
            let entry = q.enqueue(task("a"), Placement::Tail).await.unwrap();
            assert_eq!(entry.position, expected);
            assert_eq!(entry.job.ordering_key, i64::try_from(expected).unwrap() * GAP);
            assert_eq!(entry.job.status, JobStatus::Queued);
        }
        assert_eq!(q.enqueue(task("b"), Placement::Tail).await.unwrap().position, 1);
    }

    #[tokio::test]
    async fn reorder_third_to_first_then_dequeue_returns_it() {
        let q = queue().await;
        let mut jobs = Vec::new();
        for _ in 0..3 {
            jobs.push(q.enqueue(task("a"), Placement::Tail).await.unwrap().job.id);
        }
        assert_eq!(q.reorder("a", &jobs[2], 1).await.unwrap(), Some(1));

        let head = q.dequeue("a").await.unwrap().unwrap();
        assert_eq!(head.id, jobs[2]);
        assert_eq!(head.status, JobStatus::Processing);
        assert_eq!(ids(&q, "a").await, vec![jobs[0].clone(), jobs[1].clone()]);
    }

    #[tokio::test]
    async fn reorder_rewrites_only_moved_key_and_keeps_others_ordered() {
        let q = queue().await;
        let mut jobs = Vec::new();
        for _ in 0..5 {
            jobs.push(q.enqueue(task("a"), Placement::Tail).await.unwrap().job);
        }
        q.reorder("a", &jobs[0].id, 4).await.unwrap();

        let after = q.list_queue("a").await.unwrap();
        let order: Vec<&str> = after.iter().map(|e| e.job.id.as_str()).collect();
        assert_eq!(
            order,
            vec![&jobs[1].id, &jobs[2].id, &jobs[3].id, &jobs[0].id, &jobs[4].id]
        );
        for entry in &after {
            if entry.job.id != jobs[0].id {
                let original = jobs.iter().find(|j| j.id == entry.job.id).unwrap();
                assert_eq!(entry.job.ordering_key, original.ordering_key);
            }
        }
    }

    #[tokio::test]
    async fn reorder_clamps_and_missing_is_noop() {
        let q = queue().await;
        let a = q.enqueue(task("a"), Placement::Tail).await.unwrap().job.id;
        let b = q.enqueue(task("a"), Placement::Tail).await.unwrap().job.id;
        assert_eq!(q.reorder("a", &a, 99).await.unwrap(), Some(2));
        assert_eq!(ids(&q, "a").await, vec![b.clone(), a.clone()]);
        assert_eq!(q.reorder("a", &a, 0).await.unwrap(), Some(1));
        assert_eq!(q.reorder("a", "missing", 1).await.unwrap(), None);
        assert_eq!(q.reorder("other", &a, 1).await.unwrap(), None);
        assert_eq!(ids(&q, "a").await, vec![a, b]);
    }

    #[tokio::test]
    async fn remove_preserves_order_and_missing_is_noop() {
        let q = queue().await;
        let mut jobs = Vec::new();
        for _ in 0..4 {
            jobs.push(q.enqueue(task("a"), Placement::Tail).await.unwrap().job.id);
        }
        assert!(q.remove("a", &jobs[1]).await.unwrap());
        assert!(!q.remove("a", &jobs[1]).await.unwrap());
        assert!(!q.remove("b", &jobs[0]).await.unwrap());
        assert_eq!(
            ids(&q, "a").await,
            vec![jobs[0].clone(), jobs[2].clone(), jobs[3].clone()]
        );
    }

    #[tokio::test]
    async fn repeated_moves_into_one_gap_fall_back_to_renumber() {
        let q = queue().await;
        let mut jobs = Vec::new();
        for _ in 0..6 {
            jobs.push(q.enqueue(task("a"), Placement::Tail).await.unwrap().job.id);
        }
        // Always move the last job to position 2: the gap after the head
        // halves each time until it runs out.
        let mut expected = jobs.clone();
        for _ in 0..12 {
            let last = expected.pop().unwrap();
            q.reorder("a", &last, 2).await.unwrap();
            expected.insert(1, last);
            assert_eq!(ids(&q, "a").await, expected);
        }
        let keys: Vec<i64> = q
            .list_queue("a")
            .await
            .unwrap()
            .iter()
            .map(|e| e.job.ordering_key)
            .collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn front_placement_goes_after_step_jobs() {
        let q = queue().await;
        let t1 = q.enqueue(task("a"), Placement::Tail).await.unwrap().job.id;
        let step = |agent: &str| {
            NewJob::new(agent, "p1", JobKind::Step, JobPayload::default(), QueuedBy::Auto)
        };
        let s1 = q.enqueue(step("a"), Placement::Front).await.unwrap();
        assert_eq!(s1.position, 1);
        let s2 = q.enqueue(step("a"), Placement::Front).await.unwrap();
        assert_eq!(s2.position, 2);
        assert_eq!(ids(&q, "a").await, vec![s1.job.id, s2.job.id, t1]);
    }

    #[tokio::test]
    async fn duplicate_pipeline_job_is_rejected() {
        let q = queue().await;
        let pipeline = || {
            NewJob::new("architect", "p1", JobKind::Pipeline, JobPayload::default(), QueuedBy::Auto)
                .for_feature("f1")
        };
        q.enqueue(pipeline(), Placement::Tail).await.unwrap();
        match q.enqueue(pipeline(), Placement::Tail).await {
            Err(QueueError::AlreadyQueued(feature)) => assert_eq!(feature, "f1"),
            other => panic!("expected AlreadyQueued, got {other:?}"),
        }
        assert!(q.live_job_for_feature("f1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_dequeues_hand_out_each_job_once() {
        let q = Arc::new(queue().await);
        q.enqueue(task("a"), Placement::Tail).await.unwrap();
        q.enqueue(task("a"), Placement::Tail).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let q = Arc::clone(&q);
            handles.push(tokio::spawn(async move { q.dequeue("a").await.unwrap() }));
        }
        let mut taken = Vec::new();
        for handle in handles {
            if let Some(job) = handle.await.unwrap() {
                taken.push(job.id);
            }
        }
        taken.sort();
        taken.dedup();
        assert_eq!(taken.len(), 2);
        assert!(q.peek("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn requeue_recover_complete_and_fail() {
        let q = queue().await;
        let first = q.enqueue(task("a"), Placement::Tail).await.unwrap().job.id;
        let second = q.enqueue(task("a"), Placement::Tail).await.unwrap().job.id;

        let head = q.dequeue("a").await.unwrap().unwrap();
        assert!(q.requeue(&head).await.unwrap());
        assert_eq!(ids(&q, "a").await, vec![first.clone(), second.clone()]);

        q.dequeue("a").await.unwrap().unwrap();
        assert_eq!(q.recover().await.unwrap(), 1);
        assert_eq!(q.position("a", &first).await.unwrap(), Some(1));

        let head = q.dequeue("a").await.unwrap().unwrap();
        q.complete(&head.id).await.unwrap();
        assert!(q.get(&head.id).await.is_err());

        let next = q.dequeue("a").await.unwrap().unwrap();
        q.fail(&next.id, "boom").await.unwrap();
        let failed = q.get(&next.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert!(q.summary().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn take_claims_a_job_at_any_position_once() {
        let q = queue().await;
        let first = q.enqueue(task("a"), Placement::Tail).await.unwrap().job.id;
        let second = q.enqueue(task("a"), Placement::Tail).await.unwrap().job.id;

        assert!(q.take("b", &second).await.unwrap().is_none());
        let taken = q.take("a", &second).await.unwrap().unwrap();
        assert_eq!(taken.status, JobStatus::Processing);
        assert!(q.take("a", &second).await.unwrap().is_none());
        assert_eq!(ids(&q, "a").await, vec![first]);
    }
}
