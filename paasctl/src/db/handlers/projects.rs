use crate::db::errors::{DbError, Result};
use crate::db::models::projects::{Project, ProjectCreateDBRequest, ProjectStatus};
use crate::types::{ClusterId, ProjectId};
use sqlx::PgConnection;
use tracing::instrument;

/// Repository for the `projects` table.
pub struct Projects<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Projects<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Insert a new project row in CREATING.
    #[instrument(skip(self, request), fields(project_id = %request.id), err)]
    pub async fn create(&mut self, request: &ProjectCreateDBRequest) -> Result<Project> {
        let project = sqlx::query_as::<_, Project>(
            r#"
            INSERT INTO projects (id, name, org_id, status, placement, backend, cluster_id, db_name, custom_domain)
            VALUES ($1, $2, $3, 'creating', $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(&request.id)
        .bind(&request.name)
        .bind(request.org_id)
        .bind(request.placement)
        .bind(&request.backend)
        .bind(&request.cluster_id)
        .bind(&request.db_name)
        .bind(&request.custom_domain)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(project)
    }

    #[instrument(skip(self), err)]
    pub async fn get_by_id(&mut self, id: &ProjectId) -> Result<Option<Project>> {
        let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(project)
    }

    /// Compare-and-set status transition.
    ///
    /// The UPDATE is guarded by the current status, so concurrent callers
    /// serialize on the row and only one observer of a given `from` state
    /// wins. Returns the updated row, or `None` when the project was not in
    /// `from` anymore (the caller decides whether that is a no-op or a
    /// conflict). Legality of `from -> to` is asserted here; an illegal pair
    /// is a programming error, not a race.
    #[instrument(skip(self), err)]
    pub async fn transition(&mut self, id: &ProjectId, from: ProjectStatus, to: ProjectStatus) -> Result<Option<Project>> {
        debug_assert!(from.can_transition_to(to), "illegal transition {from} -> {to}");

        let project = sqlx::query_as::<_, Project>(
            r#"
            UPDATE projects SET status = $3, last_error = NULL
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(project)
    }

    /// Move a project to FAILED, recording the human-readable cause.
    ///
    /// Only transient states can fail; a project already past them keeps its
    /// status and the call reports what state it found instead.
    #[instrument(skip(self, cause), err)]
    pub async fn mark_failed(&mut self, id: &ProjectId, cause: &str) -> Result<Option<Project>> {
        let project = sqlx::query_as::<_, Project>(
            r#"
            UPDATE projects SET status = 'failed', last_error = $2
            WHERE id = $1 AND status IN ('creating', 'provisioning', 'deleting')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(cause)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(project)
    }

    /// Record the endpoint URLs returned by provisioning.
    #[instrument(skip(self, api_url, db_url), err)]
    pub async fn set_endpoints(&mut self, id: &ProjectId, api_url: &str, db_url: &str) -> Result<()> {
        let result = sqlx::query("UPDATE projects SET api_url = $2, db_url = $3 WHERE id = $1")
            .bind(id)
            .bind(api_url)
            .bind(db_url)
            .execute(&mut *self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Bring a DELETED project back to RUNNING after an archive restore.
    ///
    /// Deliberately outside the normal transition graph, where DELETED is
    /// terminal; only the restore path may resurrect a row.
    #[instrument(skip(self), err)]
    pub async fn revive(&mut self, id: &ProjectId) -> Result<Option<Project>> {
        let project = sqlx::query_as::<_, Project>(
            r#"
            UPDATE projects SET status = 'running', last_error = NULL
            WHERE id = $1 AND status = 'deleted'
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(project)
    }

    #[instrument(skip(self), err)]
    pub async fn list_by_status(&mut self, status: ProjectStatus) -> Result<Vec<Project>> {
        let projects = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE status = $1 ORDER BY created_at")
            .bind(status)
            .fetch_all(&mut *self.db)
            .await?;

        Ok(projects)
    }

    /// Projects still in CREATING that are parked on the given cluster,
    /// waiting for it to come up.
    #[instrument(skip(self), err)]
    pub async fn list_waiting_on_cluster(&mut self, cluster_id: &ClusterId) -> Result<Vec<Project>> {
        let projects = sqlx::query_as::<_, Project>(
            "SELECT * FROM projects WHERE status = 'creating' AND cluster_id = $1 ORDER BY created_at",
        )
        .bind(cluster_id)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(projects)
    }

    /// Count of live (neither deleted nor failed) projects on a cluster.
    #[instrument(skip(self), err)]
    pub async fn count_live_on_cluster(&mut self, cluster_id: &ClusterId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM projects WHERE cluster_id = $1 AND status NOT IN ('deleted', 'failed')",
        )
        .bind(cluster_id)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::errors::DbError;
    use crate::db::models::projects::Placement;
    use sqlx::PgPool;
    use uuid::Uuid;

    fn request(id: &str) -> ProjectCreateDBRequest {
        ProjectCreateDBRequest {
            id: id.to_string(),
            name: "demo".to_string(),
            org_id: Uuid::new_v4(),
            placement: Placement::Shared,
            backend: "shared".to_string(),
            cluster_id: None,
            db_name: Some(format!("project_{id}")),
            custom_domain: None,
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn create_and_get_round_trip(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let created = Projects::new(&mut conn).create(&request("aaaa11112222")).await.unwrap();
        assert_eq!(created.status, ProjectStatus::Creating);

        let fetched = Projects::new(&mut conn)
            .get_by_id(&"aaaa11112222".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.name, "demo");
        assert_eq!(fetched.db_name.as_deref(), Some("project_aaaa11112222"));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn duplicate_id_is_a_unique_violation(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        Projects::new(&mut conn).create(&request("aaaa11112222")).await.unwrap();

        let err = Projects::new(&mut conn).create(&request("aaaa11112222")).await.unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn transition_is_compare_and_set(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let id = "aaaa11112222".to_string();
        Projects::new(&mut conn).create(&request(&id)).await.unwrap();

        let first = Projects::new(&mut conn)
            .transition(&id, ProjectStatus::Creating, ProjectStatus::Provisioning)
            .await
            .unwrap();
        assert_eq!(first.unwrap().status, ProjectStatus::Provisioning);

        // A second observer of CREATING loses the race and gets None.
        let second = Projects::new(&mut conn)
            .transition(&id, ProjectStatus::Creating, ProjectStatus::Provisioning)
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn mark_failed_only_hits_transient_states(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let id = "aaaa11112222".to_string();
        Projects::new(&mut conn).create(&request(&id)).await.unwrap();

        Projects::new(&mut conn)
            .transition(&id, ProjectStatus::Creating, ProjectStatus::Provisioning)
            .await
            .unwrap();
        Projects::new(&mut conn)
            .transition(&id, ProjectStatus::Provisioning, ProjectStatus::Running)
            .await
            .unwrap();

        let failed = Projects::new(&mut conn).mark_failed(&id, "boom").await.unwrap();
        assert!(failed.is_none(), "a running project must not be failable");

        let project = Projects::new(&mut conn).get_by_id(&id).await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Running);
        assert!(project.last_error.is_none());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn revive_only_resurrects_deleted_projects(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let id = "aaaa11112222".to_string();
        Projects::new(&mut conn).create(&request(&id)).await.unwrap();

        assert!(Projects::new(&mut conn).revive(&id).await.unwrap().is_none());

        for (from, to) in [
            (ProjectStatus::Creating, ProjectStatus::Provisioning),
            (ProjectStatus::Provisioning, ProjectStatus::Running),
            (ProjectStatus::Running, ProjectStatus::Deleting),
            (ProjectStatus::Deleting, ProjectStatus::Deleted),
        ] {
            Projects::new(&mut conn).transition(&id, from, to).await.unwrap();
        }

        let revived = Projects::new(&mut conn).revive(&id).await.unwrap().unwrap();
        assert_eq!(revived.status, ProjectStatus::Running);
    }
}
