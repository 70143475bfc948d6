use crate::db::errors::{DbError, Result};
use crate::db::models::clusters::{Cluster, ClusterStatus, ClusterUsage};
use crate::types::{new_private_cluster_id, ClusterId, OrgId, GLOBAL_CLUSTER_ID};
use sqlx::PgConnection;
use tracing::instrument;

/// Repository for the `clusters` and `cluster_usage` tables.
pub struct Clusters<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Clusters<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self), err)]
    pub async fn get_by_id(&mut self, id: &ClusterId) -> Result<Option<Cluster>> {
        let cluster = sqlx::query_as::<_, Cluster>("SELECT * FROM clusters WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(cluster)
    }

    #[instrument(skip(self), err)]
    pub async fn get_global(&mut self) -> Result<Option<Cluster>> {
        let cluster = sqlx::query_as::<_, Cluster>("SELECT * FROM clusters WHERE cluster_type = 'global_shared'")
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(cluster)
    }

    #[instrument(skip(self), err)]
    pub async fn get_private_for_org(&mut self, org_id: OrgId) -> Result<Option<Cluster>> {
        let cluster = sqlx::query_as::<_, Cluster>(
            "SELECT * FROM clusters WHERE cluster_type = 'private' AND owner_org_id = $1",
        )
        .bind(org_id)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(cluster)
    }

    /// Insert the single global shared cluster, already running, with the
    /// shared infrastructure coordinates, and seed its usage row.
    ///
    /// Safe under concurrency: if another caller won the insert race, the
    /// winner's row is returned instead. The id is the constant
    /// `GLOBAL_CLUSTER_ID`, so the loser trips the primary key before the
    /// `clusters_single_global` index ever gets a chance; both spellings of
    /// the conflict mean the same thing here.
    #[instrument(skip(self, host, api_url), err)]
    pub async fn insert_global_running(&mut self, host: &str, port: u16, api_url: &str) -> Result<Cluster> {
        let inserted = sqlx::query_as::<_, Cluster>(
            r#"
            INSERT INTO clusters (id, cluster_type, status, postgres_host, postgres_port, api_url)
            VALUES ($1, 'global_shared', 'running', $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(GLOBAL_CLUSTER_ID)
        .bind(host)
        .bind(port as i32)
        .bind(api_url)
        .fetch_one(&mut *self.db)
        .await
        .map_err(DbError::from);

        let cluster = match inserted {
            Ok(cluster) => cluster,
            Err(err)
                if err.is_unique_violation_on("clusters_pkey")
                    || err.is_unique_violation_on("clusters_single_global") => self
                .get_global()
                .await?
                .ok_or_else(|| DbError::Other(anyhow::anyhow!("global cluster vanished after insert race")))?,
            Err(err) => return Err(err),
        };

        self.seed_usage(&cluster.id).await?;
        Ok(cluster)
    }

    /// Insert a private cluster row in `creating` for the given org.
    ///
    /// Two concurrent project creations for a cluster-less org both reach
    /// this insert; the partial unique index on (owner_org_id) lets exactly
    /// one through and the loser re-reads and reuses the winner's row. The
    /// returned flag is true only for the caller that actually inserted.
    #[instrument(skip(self), err)]
    pub async fn insert_private_creating(&mut self, org_id: OrgId) -> Result<(Cluster, bool)> {
        let id = new_private_cluster_id(&org_id);

        let inserted = sqlx::query_as::<_, Cluster>(
            r#"
            INSERT INTO clusters (id, cluster_type, owner_org_id, status)
            VALUES ($1, 'private', $2, 'creating')
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(org_id)
        .fetch_one(&mut *self.db)
        .await
        .map_err(DbError::from);

        let (cluster, created) = match inserted {
            Ok(cluster) => (cluster, true),
            Err(err) if err.is_unique_violation_on("clusters_owner_org_unique") => {
                let winner = self.get_private_for_org(org_id).await?.ok_or_else(|| {
                    DbError::Other(anyhow::anyhow!("private cluster for {org_id} vanished after insert race"))
                })?;
                (winner, false)
            }
            Err(err) => return Err(err),
        };

        self.seed_usage(&cluster.id).await?;
        Ok((cluster, created))
    }

    /// Flip a `creating` cluster to `running`, assigning its coordinates.
    ///
    /// Guarded by the current status so a cluster never moves backwards;
    /// returns `None` when the cluster was not in `creating`.
    #[instrument(skip(self, host, api_url), err)]
    pub async fn mark_running(&mut self, id: &ClusterId, host: &str, port: u16, api_url: &str) -> Result<Option<Cluster>> {
        let cluster = sqlx::query_as::<_, Cluster>(
            r#"
            UPDATE clusters SET status = 'running', postgres_host = $2, postgres_port = $3, api_url = $4
            WHERE id = $1 AND status = 'creating'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(host)
        .bind(port as i32)
        .bind(api_url)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(cluster)
    }

    /// Flip a `creating` cluster to `failed`. Not retried automatically.
    #[instrument(skip(self), err)]
    pub async fn mark_failed(&mut self, id: &ClusterId) -> Result<()> {
        sqlx::query("UPDATE clusters SET status = 'failed' WHERE id = $1 AND status = 'creating'")
            .bind(id)
            .execute(&mut *self.db)
            .await?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn list_by_status(&mut self, status: ClusterStatus) -> Result<Vec<Cluster>> {
        let clusters = sqlx::query_as::<_, Cluster>("SELECT * FROM clusters WHERE status = $1 ORDER BY created_at")
            .bind(status)
            .fetch_all(&mut *self.db)
            .await?;

        Ok(clusters)
    }

    /// Ensure a usage row exists for the cluster (all gauges zero).
    async fn seed_usage(&mut self, cluster_id: &ClusterId) -> Result<()> {
        sqlx::query("INSERT INTO cluster_usage (cluster_id) VALUES ($1) ON CONFLICT (cluster_id) DO NOTHING")
            .bind(cluster_id)
            .execute(&mut *self.db)
            .await?;

        Ok(())
    }

    /// Overwrite the cluster's usage gauge with a fresh snapshot.
    #[instrument(skip(self, usage), fields(cluster_id = %usage.cluster_id), err)]
    pub async fn overwrite_usage(&mut self, usage: &ClusterUsage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cluster_usage (cluster_id, project_count, cpu_percent, memory_mb, active_connections, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (cluster_id) DO UPDATE SET
                project_count = EXCLUDED.project_count,
                cpu_percent = EXCLUDED.cpu_percent,
                memory_mb = EXCLUDED.memory_mb,
                active_connections = EXCLUDED.active_connections,
                updated_at = NOW()
            "#,
        )
        .bind(&usage.cluster_id)
        .bind(usage.project_count)
        .bind(usage.cpu_percent)
        .bind(usage.memory_mb)
        .bind(usage.active_connections)
        .execute(&mut *self.db)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn get_usage(&mut self, cluster_id: &ClusterId) -> Result<Option<ClusterUsage>> {
        let usage = sqlx::query_as::<_, ClusterUsage>("SELECT * FROM cluster_usage WHERE cluster_id = $1")
            .bind(cluster_id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::clusters::ClusterType;
    use sqlx::PgPool;
    use uuid::Uuid;

    #[sqlx::test]
    #[test_log::test]
    async fn global_cluster_insert_survives_the_singleton_race(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let first = Clusters::new(&mut conn)
            .insert_global_running("db.internal", 54322, "http://gw.internal")
            .await
            .unwrap();
        assert_eq!(first.id, GLOBAL_CLUSTER_ID);
        assert_eq!(first.status, ClusterStatus::Running);
        assert_eq!(first.coordinates(), Some(("db.internal", 54322)));

        // Second insert loses on the partial unique index and returns the winner.
        let second = Clusters::new(&mut conn)
            .insert_global_running("other.host", 5432, "http://other")
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.coordinates(), Some(("db.internal", 54322)));

        let usage = Clusters::new(&mut conn).get_usage(&first.id).await.unwrap().unwrap();
        assert_eq!(usage.project_count, 0);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn one_private_cluster_per_org(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let org = Uuid::new_v4();

        let (first, created) = Clusters::new(&mut conn).insert_private_creating(org).await.unwrap();
        assert!(created);
        assert_eq!(first.cluster_type, ClusterType::Private);
        assert_eq!(first.status, ClusterStatus::Creating);
        assert_eq!(first.owner_org_id, Some(org));

        let (second, created) = Clusters::new(&mut conn).insert_private_creating(org).await.unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);

        // A different org gets its own cluster.
        let (other, created) = Clusters::new(&mut conn).insert_private_creating(Uuid::new_v4()).await.unwrap();
        assert!(created);
        assert_ne!(other.id, first.id);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn mark_running_is_guarded_by_creating(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let org = Uuid::new_v4();
        let (cluster, _) = Clusters::new(&mut conn).insert_private_creating(org).await.unwrap();

        let running = Clusters::new(&mut conn)
            .mark_running(&cluster.id, "db.internal", 54322, "http://gw.internal")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(running.status, ClusterStatus::Running);

        // Already running: the guard refuses a second flip.
        let again = Clusters::new(&mut conn)
            .mark_running(&cluster.id, "elsewhere", 1111, "http://x")
            .await
            .unwrap();
        assert!(again.is_none());

        // mark_failed after running is also a no-op.
        Clusters::new(&mut conn).mark_failed(&cluster.id).await.unwrap();
        let current = Clusters::new(&mut conn).get_by_id(&cluster.id).await.unwrap().unwrap();
        assert_eq!(current.status, ClusterStatus::Running);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn list_by_status_filters(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let (a, _) = Clusters::new(&mut conn).insert_private_creating(Uuid::new_v4()).await.unwrap();
        let (b, _) = Clusters::new(&mut conn).insert_private_creating(Uuid::new_v4()).await.unwrap();
        Clusters::new(&mut conn)
            .mark_running(&a.id, "db.internal", 54322, "http://gw")
            .await
            .unwrap();

        let creating = Clusters::new(&mut conn).list_by_status(ClusterStatus::Creating).await.unwrap();
        assert_eq!(creating.len(), 1);
        assert_eq!(creating[0].id, b.id);
    }
}
