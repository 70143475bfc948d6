//! Database models for projects and their lifecycle state machine.

use crate::types::{ClusterId, OrgId, ProjectId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a project.
///
/// Legal transitions form a directed graph (see [`ProjectStatus::can_transition_to`]):
///
/// ```text
/// CREATING -> PROVISIONING -> RUNNING <-> STOPPED
/// RUNNING | STOPPED | PROVISIONING -> DELETING -> DELETED
/// CREATING | PROVISIONING | DELETING -> FAILED
/// ```
///
/// DELETED and FAILED are terminal. FAILED is terminal for the creation
/// attempt; retrying means creating a new project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "project_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Creating,
    Provisioning,
    Running,
    Stopped,
    Deleting,
    Deleted,
    Failed,
}

impl ProjectStatus {
    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// This is the single authority on transition legality; every status
    /// UPDATE goes through a compare-and-set guarded by it, so a stop
    /// arriving after a delete has started can never resurrect the project.
    pub fn can_transition_to(self, next: ProjectStatus) -> bool {
        use ProjectStatus::*;
        match (self, next) {
            (Creating, Provisioning) => true,
            (Provisioning, Running) => true,
            (Running, Stopped) | (Stopped, Running) => true,
            (Running | Stopped | Provisioning, Deleting) => true,
            (Deleting, Deleted) => true,
            (Creating | Provisioning | Deleting, Failed) => true,
            _ => false,
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProjectStatus::Deleted | ProjectStatus::Failed)
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProjectStatus::Creating => "creating",
            ProjectStatus::Provisioning => "provisioning",
            ProjectStatus::Running => "running",
            ProjectStatus::Stopped => "stopped",
            ProjectStatus::Deleting => "deleting",
            ProjectStatus::Deleted => "deleted",
            ProjectStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Where a project's data lives: the shared multi-tenant cluster or a
/// dedicated container stack of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "placement", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    Shared,
    Dedicated,
}

/// Database row for a project.
///
/// Rows are never physically removed by the orchestrator; deletion is the
/// DELETED status. `cluster_id` is set exactly once (shared placement) and
/// immutable afterwards.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub org_id: OrgId,
    pub status: ProjectStatus,
    pub placement: Placement,
    pub backend: String,
    pub cluster_id: Option<ClusterId>,
    pub db_name: Option<String>,
    pub custom_domain: Option<String>,
    pub api_url: Option<String>,
    pub db_url: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Database request for creating a new project row (always in CREATING).
#[derive(Debug, Clone)]
pub struct ProjectCreateDBRequest {
    pub id: ProjectId,
    pub name: String,
    pub org_id: OrgId,
    pub placement: Placement,
    pub backend: String,
    pub cluster_id: Option<ClusterId>,
    pub db_name: Option<String>,
    pub custom_domain: Option<String>,
}
