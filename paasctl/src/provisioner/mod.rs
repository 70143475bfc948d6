//! Provisioning backend abstraction layer.
//!
//! This module defines the `ProvisioningBackend` trait which abstracts where
//! dedicated project stacks physically run (local docker compose, a remote
//! deployment platform, ...).

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::config::ProvisionerConfig;
use crate::types::ProjectId;

pub mod local;
pub mod remote;

/// Create a provisioning backend from configuration
///
/// This is the single point where we convert config into backend instances.
/// Adding a new backend requires adding a match arm here.
pub fn create_backend(config: ProvisionerConfig) -> Box<dyn ProvisioningBackend> {
    match config {
        ProvisionerConfig::Local(local_config) => Box::new(local::LocalBackend::from(local_config)),
        ProvisionerConfig::Remote(remote_config) => Box::new(remote::RemoteBackend::from(remote_config)),
    }
}

/// Result type for provisioning backend operations
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Errors that can occur while driving the provisioning substrate
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("provisioning command failed: {0}")]
    CommandFailed(String),

    #[error("provisioning timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("platform API error: {0}")]
    PlatformApi(String),

    #[error("a port in the allocated block is already in use: {0}")]
    PortInUse(String),

    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),

    #[error("no archive found for project {0}")]
    ArchiveMissing(ProjectId),

    #[error("project {0} already has a live stack")]
    AlreadyLive(ProjectId),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl ProvisionError {
    /// Conflicts that a fresh port allocation can resolve.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProvisionError::PortInUse(_))
    }
}

/// Public endpoints of a provisioned stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub api_url: String,
    pub db_url: String,
}

/// Where dedicated project stacks run.
///
/// All operations are idempotent from the caller's perspective: provisioning
/// an already-provisioned project succeeds, and stop/start/destroy against a
/// resource that no longer exists on the substrate is a logged no-op.
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Backend name recorded on the project row.
    fn name(&self) -> &'static str;

    /// Bring up the full stack for a project and return its endpoints.
    /// `domain` is a caller-supplied custom domain; backends that cannot
    /// bind one ignore it.
    async fn provision(
        &self,
        project_id: &ProjectId,
        secrets: &BTreeMap<String, String>,
        domain: Option<&str>,
    ) -> Result<Endpoints>;

    async fn start(&self, project_id: &ProjectId) -> Result<()>;

    async fn stop(&self, project_id: &ProjectId) -> Result<()>;

    /// Tear the stack down. Local keeps a soft-delete archive; remote
    /// deletes the platform resource outright.
    async fn destroy(&self, project_id: &ProjectId) -> Result<()>;

    /// Bring an archived stack back. Backends without archives return
    /// `Unsupported`.
    async fn restore(&self, project_id: &ProjectId) -> Result<Endpoints>;
}
