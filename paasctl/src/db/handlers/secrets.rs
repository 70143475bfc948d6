use crate::db::errors::Result;
use crate::db::models::secrets::ProjectSecret;
use crate::types::ProjectId;
use sqlx::PgConnection;
use std::collections::{BTreeMap, HashSet};
use tracing::instrument;

/// Repository for per-project secret material.
pub struct Secrets<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Secrets<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Upsert the full secret map for a project. Values are overwritten on
    /// key collision so re-provisioning refreshes stale material.
    #[instrument(skip(self, secrets), fields(count = secrets.len()), err)]
    pub async fn put_many(&mut self, project_id: &ProjectId, secrets: &BTreeMap<String, String>) -> Result<()> {
        for (key, value) in secrets {
            sqlx::query(
                r#"
                INSERT INTO project_secrets (project_id, key, value)
                VALUES ($1, $2, $3)
                ON CONFLICT (project_id, key) DO UPDATE SET value = EXCLUDED.value
                "#,
            )
            .bind(project_id)
            .bind(key)
            .bind(value)
            .execute(&mut *self.db)
            .await?;
        }

        Ok(())
    }

    /// The project's secrets as an ordered map. BTreeMap keeps rendering of
    /// derived artifacts (env files) deterministic.
    #[instrument(skip(self), err)]
    pub async fn get_map(&mut self, project_id: &ProjectId) -> Result<BTreeMap<String, String>> {
        let rows: Vec<ProjectSecret> =
            sqlx::query_as("SELECT * FROM project_secrets WHERE project_id = $1")
                .bind(project_id)
                .fetch_all(&mut *self.db)
                .await?;

        Ok(rows.into_iter().map(|row| (row.key, row.value)).collect())
    }

    /// Host ports already promised to projects that are not deleted or
    /// failed. A parked project's stack is not running yet, so its ports are
    /// invisible to both docker and a bind probe; this set is what keeps two
    /// parked projects from being handed the same block.
    #[instrument(skip(self), err)]
    pub async fn reserved_ports(&mut self) -> Result<HashSet<u16>> {
        let values: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT ps.value FROM project_secrets ps
            JOIN projects p ON p.id = ps.project_id
            WHERE ps.key LIKE '%\_PORT' AND p.status NOT IN ('deleted', 'failed')
            "#,
        )
        .fetch_all(&mut *self.db)
        .await?;

        Ok(values.iter().filter_map(|v| v.parse().ok()).collect())
    }

    #[instrument(skip(self), err)]
    pub async fn get(&mut self, project_id: &ProjectId, key: &str) -> Result<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM project_secrets WHERE project_id = $1 AND key = $2")
                .bind(project_id)
                .bind(key)
                .fetch_optional(&mut *self.db)
                .await?;

        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::handlers::Projects;
    use crate::db::models::projects::{Placement, ProjectCreateDBRequest};
    use sqlx::PgPool;
    use uuid::Uuid;

    async fn seed_project(pool: &PgPool, id: &str) {
        let mut conn = pool.acquire().await.unwrap();
        Projects::new(&mut conn)
            .create(&ProjectCreateDBRequest {
                id: id.to_string(),
                name: "demo".to_string(),
                org_id: Uuid::new_v4(),
                placement: Placement::Dedicated,
                backend: "local".to_string(),
                cluster_id: None,
                db_name: None,
                custom_domain: None,
            })
            .await
            .unwrap();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn put_many_overwrites_on_key_collision(pool: PgPool) {
        let id = "aaaa11112222".to_string();
        seed_project(&pool, &id).await;
        let mut conn = pool.acquire().await.unwrap();

        let first = BTreeMap::from([
            ("JWT_SECRET".to_string(), "old".to_string()),
            ("DB_PASSWORD".to_string(), "pw".to_string()),
        ]);
        Secrets::new(&mut conn).put_many(&id, &first).await.unwrap();

        let refreshed = BTreeMap::from([("JWT_SECRET".to_string(), "new".to_string())]);
        Secrets::new(&mut conn).put_many(&id, &refreshed).await.unwrap();

        let map = Secrets::new(&mut conn).get_map(&id).await.unwrap();
        assert_eq!(map["JWT_SECRET"], "new");
        assert_eq!(map["DB_PASSWORD"], "pw");
        assert_eq!(Secrets::new(&mut conn).get(&id, "JWT_SECRET").await.unwrap().as_deref(), Some("new"));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn unknown_project_has_an_empty_map(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let map = Secrets::new(&mut conn).get_map(&"missing000000".to_string()).await.unwrap();
        assert!(map.is_empty());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn reserved_ports_cover_live_projects_only(pool: PgPool) {
        let live = "live00001111".to_string();
        let dead = "dead00001111".to_string();
        seed_project(&pool, &live).await;
        seed_project(&pool, &dead).await;
        let mut conn = pool.acquire().await.unwrap();

        let live_secrets = BTreeMap::from([
            ("DB_PORT".to_string(), "56000".to_string()),
            ("GATEWAY_PORT".to_string(), "56006".to_string()),
            ("JWT_SECRET".to_string(), "not-a-port".to_string()),
        ]);
        Secrets::new(&mut conn).put_many(&live, &live_secrets).await.unwrap();

        let dead_secrets = BTreeMap::from([("DB_PORT".to_string(), "57000".to_string())]);
        Secrets::new(&mut conn).put_many(&dead, &dead_secrets).await.unwrap();
        Projects::new(&mut conn).mark_failed(&dead, "boom").await.unwrap();

        let reserved = Secrets::new(&mut conn).reserved_ports().await.unwrap();
        assert_eq!(reserved, HashSet::from([56000, 56006]));
    }
}
