//! Database queries for features and their dependencies.

use foreman_core::db::unix_timestamp;
use sqlx::{Sqlite, Transaction};

use super::db::{Database, DatabaseError};
use super::models::{Feature, FeatureStatus, FeatureUpdate, NewFeature};

/// Matches when feature `f` has at least one dependency that is not
/// `passing`, including dependencies on unknown features.
const UNMET_DEPENDENCY: &str = r"
    EXISTS (
        SELECT 1 FROM feature_dependencies d
        LEFT JOIN features dep ON dep.id = d.depends_on
        WHERE d.feature_id = f.id
          AND (dep.id IS NULL OR dep.status != 'passing')
    )";

impl Database {
    // =========================================================================
    // Feature queries
    // =========================================================================

    /// Create a feature with its dependency list.
    pub async fn create_feature(
        &self,
        id: &str,
        feature: &NewFeature,
    ) -> Result<Feature, DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r"
            INSERT INTO features
                (id, project_id, title, description, priority, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'pending', ?, ?)
            ",
        )
        .bind(id)
        .bind(&feature.project_id)
        .bind(&feature.title)
        .bind(&feature.description)
        .bind(feature.priority)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        replace_dependencies(&mut tx, id, &feature.dependencies).await?;
        tx.commit().await?;

        self.get_feature(id).await
    }

    /// Get a feature by ID, dependencies included.
    pub async fn get_feature(&self, id: &str) -> Result<Feature, DatabaseError> {
        let mut feature = sqlx::query_as::<_, Feature>("SELECT * FROM features WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Feature {id}")))?;
        feature.dependencies = self.feature_dependencies(id).await?;
        Ok(feature)
    }

    /// Ordered dependency IDs of a feature.
    pub async fn feature_dependencies(&self, id: &str) -> Result<Vec<String>, DatabaseError> {
        let deps = sqlx::query_scalar(
            "SELECT depends_on FROM feature_dependencies WHERE feature_id = ? ORDER BY position",
        )
        .bind(id)
        .fetch_all(self.pool())
        .await?;
        Ok(deps)
    }

    /// List features, optionally filtered by project and status.
    pub async fn list_features(
        &self,
        project_id: Option<&str>,
        status: Option<FeatureStatus>,
    ) -> Result<Vec<Feature>, DatabaseError> {
        let mut features = sqlx::query_as::<_, Feature>(
            r"
            SELECT * FROM features
            WHERE (?1 IS NULL OR project_id = ?1)
              AND (?2 IS NULL OR status = ?2)
            ORDER BY priority, created_at, id
            ",
        )
        .bind(project_id)
        .bind(status.map(FeatureStatus::as_str))
        .fetch_all(self.pool())
        .await?;

        for feature in &mut features {
            feature.dependencies = self.feature_dependencies(&feature.id).await?;
        }
        Ok(features)
    }

    /// Update descriptive fields; `None` leaves a field unchanged.
    pub async fn update_feature(
        &self,
        id: &str,
        update: &FeatureUpdate,
    ) -> Result<Feature, DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        let result = sqlx::query(
            r"
            UPDATE features SET
                title = COALESCE(?, title),
                description = COALESCE(?, description),
                priority = COALESCE(?, priority),
                updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(update.title.as_deref())
        .bind(update.description.as_deref())
        .bind(update.priority)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Feature {id}")));
        }
        if let Some(deps) = &update.dependencies {
            replace_dependencies(&mut tx, id, deps).await?;
        }
        tx.commit().await?;

        self.get_feature(id).await
    }

    /// Pending features whose dependencies are all `passing` and that have
    /// neither a live pipeline job nor an active run. Most urgent first
    /// (lowest priority rank, then oldest).
    pub async fn list_runnable_features(&self) -> Result<Vec<Feature>, DatabaseError> {
        let sql = format!(
            r"
            SELECT f.* FROM features f
            WHERE f.status = 'pending'
              AND NOT {UNMET_DEPENDENCY}
              AND NOT EXISTS (
                  SELECT 1 FROM queued_jobs j
                  WHERE j.feature_id = f.id AND j.kind = 'pipeline'
                    AND j.status IN ('queued', 'processing')
              )
              AND NOT EXISTS (
                  SELECT 1 FROM pipeline_runs r
                  WHERE r.feature_id = f.id AND r.state = 'running'
              )
            ORDER BY f.priority, f.created_at, f.id
            "
        );
        let mut features = sqlx::query_as::<_, Feature>(&sql)
            .fetch_all(self.pool())
            .await?;
        for feature in &mut features {
            feature.dependencies = self.feature_dependencies(&feature.id).await?;
        }
        Ok(features)
    }

    /// Atomically move a feature from `pending` to `in_progress`.
    ///
    /// Re-checks dependencies in the same statement. Returns `false` when
    /// another claimant won or the feature is no longer runnable.
    pub async fn claim_feature(&self, id: &str) -> Result<bool, DatabaseError> {
        let sql = format!(
            r"
            UPDATE features AS f SET status = 'in_progress', updated_at = ?
            WHERE f.id = ? AND f.status = 'pending' AND NOT {UNMET_DEPENDENCY}
            "
        );
        let result = sqlx::query(&sql)
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Unconditionally set a feature's status.
    pub async fn set_feature_status(
        &self,
        id: &str,
        status: FeatureStatus,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE features SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Feature {id}")));
        }
        Ok(())
    }

    /// Conditional status write; `false` if the feature was not in `from`.
    pub async fn transition_feature(
        &self,
        id: &str,
        from: FeatureStatus,
        to: FeatureStatus,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE features SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(unix_timestamp())
        .bind(id)
        .bind(from.as_str())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Return `in_progress` features without an active run to `pending`.
    pub async fn reset_orphaned_features(&self) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            r"
            UPDATE features SET status = 'pending', updated_at = ?
            WHERE status = 'in_progress'
              AND NOT EXISTS (
                  SELECT 1 FROM pipeline_runs r
                  WHERE r.feature_id = features.id AND r.state = 'running'
              )
            ",
        )
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}

async fn replace_dependencies(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
    deps: &[String],
) -> Result<(), DatabaseError> {
    sqlx::query("DELETE FROM feature_dependencies WHERE feature_id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?;

    let mut seen = std::collections::HashSet::new();
    for (position, dep) in deps.iter().enumerate() {
        if !seen.insert(dep.as_str()) {
            continue;
        }
        let position = i64::try_from(position).unwrap_or(i64::MAX);
        sqlx::query(
            "INSERT INTO feature_dependencies (feature_id, depends_on, position) VALUES (?, ?, ?)",
        )
        .bind(id)
        .bind(dep)
        .bind(position)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn new_feature(project: &str, priority: i64, deps: &[&str]) -> NewFeature {
        NewFeature {
            project_id: project.to_string(),
            title: "title".to_string(),
            description: String::new(),
            priority,
            dependencies: deps.iter().map(ToString::to_string).collect(),
        }
    }

    #[tokio::test]
    async fn create_and_get_feature_with_deps() {
        let db = Database::open_in_memory().await.unwrap();
        db.create_feature("a", &new_feature("p", 0, &[])).await.unwrap();
        let b = db
            .create_feature("b", &new_feature("p", 0, &["a", "zzz", "a"]))
            .await
            .unwrap();

        assert_eq!(b.status, FeatureStatus::Pending);
        assert_eq!(b.dependencies, vec!["a", "zzz"]);
    }

    #[tokio::test]
    async fn runnable_requires_all_deps_passing() {
        let db = Database::open_in_memory().await.unwrap();
        db.create_feature("a", &new_feature("p", 5, &[])).await.unwrap();
        db.create_feature("b", &new_feature("p", 0, &["a"])).await.unwrap();
        db.create_feature("c", &new_feature("p", 0, &["missing"]))
            .await
            .unwrap();

        let ids: Vec<String> = db
            .list_runnable_features()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.id)
            .collect();
        assert_eq!(ids, vec!["a"]);

        db.set_feature_status("a", FeatureStatus::Passing).await.unwrap();
        let ids: Vec<String> = db
            .list_runnable_features()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.id)
            .collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[tokio::test]
    async fn claim_is_exclusive_and_checks_deps() {
        let db = Database::open_in_memory().await.unwrap();
        db.create_feature("a", &new_feature("p", 0, &[])).await.unwrap();
        db.create_feature("b", &new_feature("p", 0, &["a"])).await.unwrap();

        assert!(!db.claim_feature("b").await.unwrap());
        assert!(db.claim_feature("a").await.unwrap());
        assert!(!db.claim_feature("a").await.unwrap());
        assert_eq!(
            db.get_feature("a").await.unwrap().status,
            FeatureStatus::InProgress
        );
    }

    #[tokio::test]
    async fn update_feature_partial() {
        let db = Database::open_in_memory().await.unwrap();
        db.create_feature("a", &new_feature("p", 3, &[])).await.unwrap();
        let updated = db
            .update_feature(
                "a",
                &FeatureUpdate {
                    title: Some("renamed".into()),
                    dependencies: Some(vec!["x".into()]),
                    ..FeatureUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.title, "renamed");
        assert_eq!(updated.priority, 3);
        assert_eq!(updated.dependencies, vec!["x"]);

        assert!(matches!(
            db.update_feature("nope", &FeatureUpdate::default()).await,
            Err(DatabaseError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn transition_is_conditional() {
        let db = Database::open_in_memory().await.unwrap();
        db.create_feature("a", &new_feature("p", 0, &[])).await.unwrap();
        assert!(
            !db.transition_feature("a", FeatureStatus::ReviewReady, FeatureStatus::Passing)
                .await
                .unwrap()
        );
        db.set_feature_status("a", FeatureStatus::ReviewReady)
            .await
            .unwrap();
        assert!(
            db.transition_feature("a", FeatureStatus::ReviewReady, FeatureStatus::Passing)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn list_filters_by_project_and_status() {
        let db = Database::open_in_memory().await.unwrap();
        db.create_feature("a", &new_feature("p", 0, &[])).await.unwrap();
        db.create_feature("b", &new_feature("q", 0, &[])).await.unwrap();
        db.set_feature_status("b", FeatureStatus::Failing).await.unwrap();

        assert_eq!(db.list_features(Some("p"), None).await.unwrap().len(), 1);
        assert_eq!(
            db.list_features(None, Some(FeatureStatus::Failing))
                .await
                .unwrap()[0]
                .id,
            "b"
        );
        assert_eq!(db.list_features(None, None).await.unwrap().len(), 2);
    }
}
