use crate::db::errors::DbError;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Organization is not entitled to create further resources
    #[error("Quota exceeded: {message}")]
    QuotaExceeded { message: String },

    /// Requested resource not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: String, id: String },

    /// Operation conflicts with the resource's current state
    /// (e.g. stopping a project that is being deleted, restoring an active one)
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Port or name allocation collided with concurrently claimed resources
    /// or ran out of candidates.
    #[error("Allocation conflict: {message}")]
    AllocationConflict { message: String },

    /// A provisioning backend call failed. The project has been (or will be)
    /// moved to FAILED; no automatic retry.
    #[error("Provisioning failed for {project_id}: {message}")]
    Provisioning { project_id: String, message: String },

    /// Invalid request data or business rule violation
    #[error("{message}")]
    BadRequest { message: String },

    /// Database operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn not_found(resource: &str, id: impl Into<String>) -> Self {
        Error::NotFound {
            resource: resource.to_string(),
            id: id.into(),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Database(DbError::from(err))
    }
}

/// Type alias for orchestrator operation results
pub type Result<T> = std::result::Result<T, Error>;
