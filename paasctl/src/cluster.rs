//! Cluster resolution: which cluster a new project lands on.
//!
//! Shared placement resolves to the single global cluster, created lazily in
//! `running` since it rides on infrastructure that already exists. Dedicated
//! placement resolves to the org's private cluster, created lazily as a bare
//! `creating` row; no physical work happens here, the scheduler picks the
//! row up and the project waits in CREATING until the cluster is running.

use sqlx::PgConnection;
use tracing::{info, instrument, warn};

use crate::config::SharedClusterConfig;
use crate::db::handlers::{Clusters, Entitlements};
use crate::db::models::clusters::Cluster;
use crate::db::models::plans::ClusterStrategy;
use crate::db::models::projects::Placement;
use crate::errors::{Error, Result};
use crate::types::OrgId;

pub struct ClusterResolver {
    shared: SharedClusterConfig,
}

impl ClusterResolver {
    pub fn new(shared: SharedClusterConfig) -> Self {
        Self { shared }
    }

    /// Resolve the cluster for a new project, honoring the org's plan.
    ///
    /// Returns the cluster and the effective placement, which can differ
    /// from the requested one when the plan allows falling back to the
    /// shared cluster.
    #[instrument(skip(self, db), err)]
    pub async fn resolve(
        &self,
        db: &mut PgConnection,
        org_id: OrgId,
        requested: Placement,
    ) -> Result<(Cluster, Placement)> {
        match requested {
            Placement::Shared => Ok((self.global_cluster(db).await?, Placement::Shared)),
            Placement::Dedicated => self.private_cluster(db, org_id).await,
        }
    }

    /// The single global shared cluster, created on first use from the
    /// configured shared infrastructure coordinates.
    async fn global_cluster(&self, db: &mut PgConnection) -> Result<Cluster> {
        let mut clusters = Clusters::new(db);
        if let Some(cluster) = clusters.get_global().await? {
            return Ok(cluster);
        }

        let cluster = clusters
            .insert_global_running(
                &self.shared.postgres_host,
                self.shared.postgres_port,
                &self.shared.gateway_url,
            )
            .await?;
        info!(cluster_id = %cluster.id, "registered global shared cluster");
        Ok(cluster)
    }

    async fn private_cluster(&self, db: &mut PgConnection, org_id: OrgId) -> Result<(Cluster, Placement)> {
        let entitlement = Entitlements::new(&mut *db).get_or_default(org_id).await?;
        let plan = Entitlements::new(&mut *db).get_plan(&entitlement.plan_id).await?;

        if plan.cluster_strategy != ClusterStrategy::PrivatePerOrg || plan.max_private_clusters == 0 {
            if plan.allow_shared_fallback {
                warn!(%org_id, plan = %plan.id, "plan has no private clusters, falling back to shared placement");
                return Ok((self.global_cluster(db).await?, Placement::Shared));
            }
            return Err(Error::QuotaExceeded {
                message: format!("plan {} does not include private clusters", plan.id),
            });
        }

        if let Some(cluster) = Clusters::new(&mut *db).get_private_for_org(org_id).await? {
            return Ok((cluster, Placement::Dedicated));
        }

        let (cluster, created) = Clusters::new(&mut *db).insert_private_creating(org_id).await?;
        if created {
            Entitlements::new(&mut *db).increment_private_clusters(org_id).await?;
            info!(cluster_id = %cluster.id, %org_id, "registered private cluster, awaiting provisioning");
        }
        Ok((cluster, Placement::Dedicated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::clusters::ClusterStatus;
    use crate::types::GLOBAL_CLUSTER_ID;
    use sqlx::PgPool;
    use uuid::Uuid;

    fn resolver() -> ClusterResolver {
        ClusterResolver::new(SharedClusterConfig {
            postgres_host: "db.internal".to_string(),
            gateway_url: "http://gw.internal".to_string(),
            ..Default::default()
        })
    }

    #[sqlx::test]
    #[test_log::test]
    async fn shared_placements_share_the_single_global_cluster(pool: PgPool) {
        let resolver = resolver();
        let mut conn = pool.acquire().await.unwrap();

        let (first, placement) = resolver.resolve(&mut conn, Uuid::new_v4(), Placement::Shared).await.unwrap();
        assert_eq!(first.id, GLOBAL_CLUSTER_ID);
        assert_eq!(placement, Placement::Shared);
        assert_eq!(first.status, ClusterStatus::Running);

        // A second org resolves to the very same row, not a second cluster.
        let (second, _) = resolver.resolve(&mut conn, Uuid::new_v4(), Placement::Shared).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.coordinates(), Some(("db.internal", 54322)));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn dedicated_placement_reuses_the_orgs_private_cluster(pool: PgPool) {
        let resolver = resolver();
        let mut conn = pool.acquire().await.unwrap();
        let org = Uuid::new_v4();
        Entitlements::new(&mut conn).get_or_default(org).await.unwrap();
        Entitlements::new(&mut conn).set_plan(org, "premium").await.unwrap();

        let (first, placement) = resolver.resolve(&mut conn, org, Placement::Dedicated).await.unwrap();
        assert_eq!(placement, Placement::Dedicated);
        assert_eq!(first.status, ClusterStatus::Creating);

        let (second, _) = resolver.resolve(&mut conn, org, Placement::Dedicated).await.unwrap();
        assert_eq!(second.id, first.id);

        // The counter reflects one cluster, however many projects land on it.
        let entitlement = Entitlements::new(&mut conn).get_or_default(org).await.unwrap();
        assert_eq!(entitlement.private_clusters_used, 1);
    }
}
