//! Database models for physical clusters and their usage gauges.

use crate::types::{ClusterId, OrgId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of cluster: the single global multi-tenant instance, or a private
/// instance owned by exactly one organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "cluster_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ClusterType {
    GlobalShared,
    Private,
}

/// Provisioning state of a cluster. Moves creating -> running or
/// creating -> failed, never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "cluster_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Creating,
    Running,
    Stopped,
    Failed,
}

/// Database row for a cluster.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Cluster {
    pub id: ClusterId,
    pub cluster_type: ClusterType,
    pub owner_org_id: Option<OrgId>,
    pub status: ClusterStatus,
    pub postgres_host: Option<String>,
    pub postgres_port: Option<i32>,
    pub api_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Cluster {
    /// Admin connection coordinates, available once the cluster is running.
    pub fn coordinates(&self) -> Option<(&str, u16)> {
        match (self.postgres_host.as_deref(), self.postgres_port) {
            (Some(host), Some(port)) => Some((host, port as u16)),
            _ => None,
        }
    }
}

/// Point-in-time resource gauge for a cluster.
///
/// Rewritten wholesale on every usage-refresh tick; this is a snapshot,
/// not an append-only log.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClusterUsage {
    pub cluster_id: ClusterId,
    pub project_count: i32,
    pub cpu_percent: f64,
    pub memory_mb: i32,
    pub active_connections: i32,
    pub updated_at: DateTime<Utc>,
}
