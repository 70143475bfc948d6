use crate::db::errors::{DbError, Result};
use crate::db::models::plans::{OrganizationEntitlement, Plan};
use crate::types::OrgId;
use sqlx::PgConnection;
use tracing::instrument;

const DEFAULT_PLAN_ID: &str = "free";

/// Repository for plans and per-organization entitlement counters.
pub struct Entitlements<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Entitlements<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self), err)]
    pub async fn get_plan(&mut self, plan_id: &str) -> Result<Plan> {
        let plan = sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = $1")
            .bind(plan_id)
            .fetch_optional(&mut *self.db)
            .await?
            .ok_or(DbError::NotFound)?;

        Ok(plan)
    }

    /// Fetch the organization's entitlement row, creating it on the free plan
    /// if this is the first time we see the org.
    #[instrument(skip(self), err)]
    pub async fn get_or_default(&mut self, org_id: OrgId) -> Result<OrganizationEntitlement> {
        let entitlement = sqlx::query_as::<_, OrganizationEntitlement>(
            r#"
            INSERT INTO organization_entitlements (org_id, plan_id)
            VALUES ($1, $2)
            ON CONFLICT (org_id) DO UPDATE SET org_id = EXCLUDED.org_id
            RETURNING *
            "#,
        )
        .bind(org_id)
        .bind(DEFAULT_PLAN_ID)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(entitlement)
    }

    #[instrument(skip(self), err)]
    pub async fn set_plan(&mut self, org_id: OrgId, plan_id: &str) -> Result<OrganizationEntitlement> {
        let entitlement = sqlx::query_as::<_, OrganizationEntitlement>(
            r#"
            INSERT INTO organization_entitlements (org_id, plan_id)
            VALUES ($1, $2)
            ON CONFLICT (org_id) DO UPDATE SET plan_id = EXCLUDED.plan_id, updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(org_id)
        .bind(plan_id)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(entitlement)
    }

    /// Bump the live-project counter. Taken with `FOR UPDATE` semantics via
    /// the row update itself, inside the caller's transaction, so two
    /// concurrent creates for the same org serialize here.
    #[instrument(skip(self), err)]
    pub async fn increment_projects(&mut self, org_id: OrgId) -> Result<i32> {
        let used: i32 = sqlx::query_scalar(
            r#"
            UPDATE organization_entitlements
            SET projects_used = projects_used + 1, updated_at = NOW()
            WHERE org_id = $1
            RETURNING projects_used
            "#,
        )
        .bind(org_id)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;

        Ok(used)
    }

    /// Drop the live-project counter, clamped at zero.
    #[instrument(skip(self), err)]
    pub async fn decrement_projects(&mut self, org_id: OrgId) -> Result<i32> {
        let used: i32 = sqlx::query_scalar(
            r#"
            UPDATE organization_entitlements
            SET projects_used = GREATEST(projects_used - 1, 0), updated_at = NOW()
            WHERE org_id = $1
            RETURNING projects_used
            "#,
        )
        .bind(org_id)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;

        Ok(used)
    }

    #[instrument(skip(self), err)]
    pub async fn increment_private_clusters(&mut self, org_id: OrgId) -> Result<i32> {
        let used: i32 = sqlx::query_scalar(
            r#"
            UPDATE organization_entitlements
            SET private_clusters_used = private_clusters_used + 1, updated_at = NOW()
            WHERE org_id = $1
            RETURNING private_clusters_used
            "#,
        )
        .bind(org_id)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;

        Ok(used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::plans::ClusterStrategy;
    use sqlx::PgPool;
    use uuid::Uuid;

    #[sqlx::test]
    #[test_log::test]
    async fn unknown_orgs_land_on_the_free_plan(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let org = Uuid::new_v4();

        let entitlement = Entitlements::new(&mut conn).get_or_default(org).await.unwrap();
        assert_eq!(entitlement.plan_id, "free");
        assert_eq!(entitlement.projects_used, 0);

        let plan = Entitlements::new(&mut conn).get_plan(&entitlement.plan_id).await.unwrap();
        assert_eq!(plan.max_projects, 2);
        assert_eq!(plan.cluster_strategy, ClusterStrategy::GlobalOnly);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn seeded_premium_plan_allows_private_clusters(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let plan = Entitlements::new(&mut conn).get_plan("premium").await.unwrap();

        assert_eq!(plan.max_projects, -1);
        assert_eq!(plan.max_private_clusters, 1);
        assert_eq!(plan.cluster_strategy, ClusterStrategy::PrivatePerOrg);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn project_counter_is_clamped_at_zero(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let org = Uuid::new_v4();
        Entitlements::new(&mut conn).get_or_default(org).await.unwrap();

        assert_eq!(Entitlements::new(&mut conn).increment_projects(org).await.unwrap(), 1);
        assert_eq!(Entitlements::new(&mut conn).decrement_projects(org).await.unwrap(), 0);
        assert_eq!(Entitlements::new(&mut conn).decrement_projects(org).await.unwrap(), 0);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn set_plan_upgrades_in_place(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let org = Uuid::new_v4();
        Entitlements::new(&mut conn).get_or_default(org).await.unwrap();

        let upgraded = Entitlements::new(&mut conn).set_plan(org, "premium").await.unwrap();
        assert_eq!(upgraded.plan_id, "premium");

        // get_or_default must not downgrade an existing row.
        let fetched = Entitlements::new(&mut conn).get_or_default(org).await.unwrap();
        assert_eq!(fetched.plan_id, "premium");
    }
}
