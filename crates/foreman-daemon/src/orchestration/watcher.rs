//! Periodic scan that starts runnable features.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::orchestrator::{Orchestrator, OrchestratorError, ScheduleOutcome};

/// Shortest accepted poll interval.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub started: usize,
    pub queued: usize,
    pub pruned_channels: usize,
}

pub struct FeatureWatcher {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
}

impl FeatureWatcher {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let interval = orchestrator
            .config()
            .scheduler
            .poll_interval()
            .max(MIN_POLL_INTERVAL);
        Self {
            orchestrator,
            interval,
        }
    }

    /// One scan: schedule runnable features by priority, retry waiting
    /// queues, then drop expired closed channels.
    pub async fn tick(&self) -> Result<TickReport, OrchestratorError> {
        let mut report = TickReport::default();

        for feature in self.orchestrator.db().list_runnable_features().await? {
            let feature_id = feature.id.clone();
            match self.orchestrator.claim_and_start(feature).await? {
                ScheduleOutcome::Started { run_id, .. } => {
                    debug!(feature_id = %feature_id, run_id = %run_id, "Watcher started feature");
                    report.started += 1;
                }
                ScheduleOutcome::Queued { .. } => report.queued += 1,
                ScheduleOutcome::AlreadyQueued | ScheduleOutcome::NotClaimable => {}
            }
        }

        for depth in self.orchestrator.queue().summary().await? {
            self.orchestrator.pump_agent(&depth.agent_id).await?;
        }

        let retention = self.orchestrator.config().bus.closed_retention();
        report.pruned_channels = self.orchestrator.bus().prune_closed(retention).await;

        if report != TickReport::default() {
            info!(
                started = report.started,
                queued = report.queued,
                pruned = report.pruned_channels,
                "Watcher tick"
            );
        }
        Ok(report)
    }

    /// Tick until cancelled. Errors are logged and the next tick retries.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = self.interval.as_millis(), "Feature watcher started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "Watcher tick failed");
                    }
                }
            }
        }
        info!("Feature watcher stopped");
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use foreman_core::Config;

    use super::*;
    use crate::storage::{Database, FeatureStatus, NewFeature};

    const AGENT_OK: &str =
        r#"read line; echo '{"type":"result","subtype":"success","result":"step done"}'; sleep 30"#;

    fn config(project_limit: usize) -> Config {
        let mut config = Config::default();
        config.sessions.agent_program = "sh".to_string();
        config.sessions.agent_args = vec!["-c".to_string(), AGENT_OK.to_string()];
        config.sessions.terminate_grace_secs = 1;
        config.scheduler.default_project_limit = project_limit;
        config
    }

    fn feature(title: &str, priority: i64, deps: &[&str]) -> NewFeature {
        NewFeature {
            project_id: "p".to_string(),
            title: title.to_string(),
            description: String::new(),
            priority,
            dependencies: deps.iter().map(ToString::to_string).collect(),
        }
    }

    async fn wait_for_status(db: &Database, id: &str, status: FeatureStatus) {
        tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                if db.get_feature(id).await.unwrap().status == status {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("feature {id} never reached {status}"));
    }

    #[tokio::test]
    async fn tick_starts_only_features_with_passing_dependencies() {
        let db = Database::open_in_memory().await.unwrap();
        db.create_feature("base", &feature("base", 0, &[])).await.unwrap();
        db.create_feature("child", &feature("child", 0, &["base"])).await.unwrap();
        let orchestrator = Orchestrator::new(db.clone(), config(2));
        let watcher = FeatureWatcher::new(Arc::clone(&orchestrator));

        let report = watcher.tick().await.unwrap();
        assert_eq!(report.started, 1);
        wait_for_status(&db, "base", FeatureStatus::ReviewReady).await;

        // review_ready does not unblock dependents.
        assert_eq!(watcher.tick().await.unwrap().started, 0);

        orchestrator.promote("base").await.unwrap();
        assert_eq!(watcher.tick().await.unwrap().started, 1);
        wait_for_status(&db, "child", FeatureStatus::ReviewReady).await;

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn capacity_overflow_is_queued_and_started_when_a_slot_frees() {
        let db = Database::open_in_memory().await.unwrap();
        db.create_feature("urgent", &feature("urgent", 0, &[])).await.unwrap();
        db.create_feature("later", &feature("later", 5, &[])).await.unwrap();
        let orchestrator = Orchestrator::new(db.clone(), config(1));
        let watcher = FeatureWatcher::new(Arc::clone(&orchestrator));

        let report = watcher.tick().await.unwrap();
        assert_eq!((report.started, report.queued), (1, 1));
        assert_eq!(
            db.get_feature("later").await.unwrap().status,
            FeatureStatus::Pending
        );
        // The queued feature is not queued twice.
        assert_eq!(watcher.tick().await.unwrap().queued, 0);

        wait_for_status(&db, "urgent", FeatureStatus::ReviewReady).await;
        wait_for_status(&db, "later", FeatureStatus::ReviewReady).await;

        orchestrator.shutdown().await;
    }
}
