//! Nightly project backups.
//!
//! The scheduler hands every RUNNING project to a `BackupRunner`; the
//! shipped implementation shells out to `pg_dump` and writes a timestamped
//! artifact under the configured backups directory. Shipping the artifacts
//! off-host (object storage, retention) is external tooling's job.

use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{info, instrument};

use crate::config::BackupConfig;
use crate::db::models::projects::Project;
use crate::errors::{Error, Result};

#[async_trait]
pub trait BackupRunner: Send + Sync {
    /// Back the project up, returning the artifact path.
    async fn run(&self, project: &Project) -> Result<PathBuf>;
}

/// `pg_dump`-based backup against the project's own connection string.
pub struct PgDumpBackup {
    dir: PathBuf,
    timeout: std::time::Duration,
}

impl From<BackupConfig> for PgDumpBackup {
    fn from(config: BackupConfig) -> Self {
        Self {
            dir: config.dir,
            timeout: config.pg_dump_timeout,
        }
    }
}

impl PgDumpBackup {
    fn artifact_path(&self, project: &Project) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        self.dir.join(&project.id).join(format!("{}-{stamp}.dump", project.id))
    }
}

#[async_trait]
impl BackupRunner for PgDumpBackup {
    #[instrument(skip(self, project), fields(project_id = %project.id), err)]
    async fn run(&self, project: &Project) -> Result<PathBuf> {
        let db_url = project.db_url.as_deref().ok_or_else(|| Error::Conflict {
            message: format!("project {} has no database URL to back up", project.id),
        })?;

        let artifact = self.artifact_path(project);
        if let Some(parent) = artifact.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Other(anyhow::anyhow!("creating backup directory: {e}")))?;
        }

        let mut cmd = Command::new("pg_dump");
        cmd.arg("--dbname")
            .arg(db_url)
            .arg("--format")
            .arg("custom")
            .arg("--file")
            .arg(&artifact);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| Error::Other(anyhow::anyhow!("pg_dump timed out after {:?}", self.timeout)))?
            .map_err(|e| Error::Other(anyhow::anyhow!("running pg_dump: {e}")))?;

        if !output.status.success() {
            return Err(Error::Other(anyhow::anyhow!(
                "pg_dump exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        info!(project_id = %project.id, artifact = %artifact.display(), "backup written");
        Ok(artifact)
    }
}
