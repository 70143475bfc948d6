//! Database models for plans and organization entitlements.

use crate::types::OrgId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a plan places projects onto clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "cluster_strategy", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ClusterStrategy {
    /// Every project lands on the single global shared cluster.
    GlobalOnly,
    /// Each organization gets its own private cluster, created lazily.
    PrivatePerOrg,
}

/// A subscription plan: quota ceilings plus the cluster placement strategy.
///
/// Seeded by migration with `free`, `pro` and `premium` rows.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Plan {
    pub id: String,
    pub name: String,
    /// -1 means unlimited.
    pub max_projects: i32,
    pub max_private_clusters: i32,
    pub cluster_strategy: ClusterStrategy,
    /// Whether projects may fall back to the shared cluster while a private
    /// one is still being provisioned.
    pub allow_shared_fallback: bool,
    pub max_db_size_mb: i32,
    pub max_storage_mb: i32,
}

/// Binding of an organization to a plan, with runtime usage counters.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OrganizationEntitlement {
    pub org_id: OrgId,
    pub plan_id: String,
    pub projects_used: i32,
    pub private_clusters_used: i32,
    pub updated_at: DateTime<Utc>,
}
