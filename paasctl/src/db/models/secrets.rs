//! Database model for the per-project secret store.

use crate::types::ProjectId;
use chrono::{DateTime, Utc};

/// One generated credential, port or derived key, keyed by (project, key).
///
/// This table is the single source of truth for a project's runtime
/// environment; any on-disk env file is a projection regenerated from it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProjectSecret {
    pub project_id: ProjectId,
    pub key: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
}
