//! # paasctl: Project & Cluster Provisioning Orchestrator
//!
//! `paasctl` is the control plane of a self-hostable backend-as-a-service
//! platform. Customers create "projects": isolated backend stacks with a
//! Postgres database, REST/realtime/storage/auth services and an API
//! gateway. This crate decides where each project lives, provisions it,
//! walks it through its lifecycle and reconciles drifting state in the
//! background.
//!
//! ## Placement
//!
//! Entry-level plans place projects on the single **global shared cluster**:
//! one Postgres instance hosting one database per project, bootstrapped with
//! the schemas and roles the platform services expect. Premium plans get a
//! **private cluster** per organization and dedicated container stacks per
//! project, driven through a [`provisioner::ProvisioningBackend`] selected
//! at startup (local docker compose or a remote deployment platform).
//!
//! ## Lifecycle
//!
//! Projects move through `CREATING -> PROVISIONING -> RUNNING <-> STOPPED
//! -> DELETING -> DELETED`, with transient states able to fail into
//! `FAILED`. Every transition is a compare-and-set against the current
//! status, so concurrent operations serialize on the project row and
//! nothing ever moves backwards. Secrets (database credentials, JWT
//! material, API keys, host ports) are generated and persisted before the
//! first external side effect.
//!
//! ## Background reconciliation
//!
//! A single scheduler daemon provisions pending clusters and promotes the
//! projects waiting on them, refreshes per-cluster usage gauges, and runs
//! the nightly backup sweep. See [`scheduler::ReconciliationScheduler`].

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub mod backup;
pub mod cluster;
pub mod config;
pub mod db;
pub mod errors;
pub mod lifecycle;
pub mod provisioner;
pub mod scheduler;
pub mod secrets;
pub mod telemetry;
pub mod tenants;
pub mod types;

pub use config::Config;
pub use errors::{Error, Result};
pub use types::{ClusterId, OrgId, ProjectId};

use backup::{BackupRunner, PgDumpBackup};
use lifecycle::ProjectLifecycle;
use provisioner::create_backend;
use scheduler::ReconciliationScheduler;

/// Get the paasctl database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// The assembled orchestrator: database pool, provisioning backend,
/// lifecycle manager and the background scheduler.
///
/// 1. **Create**: [`Application::new`] connects the pool, runs migrations
///    and spawns the background jobs
/// 2. **Serve**: [`Application::serve`] parks on the shutdown signal while
///    the scheduler works
/// 3. **Shutdown**: background jobs are stopped and the pool is drained
pub struct Application {
    pool: PgPool,
    lifecycle: Arc<ProjectLifecycle>,
    jobs: Vec<JoinHandle<()>>,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting orchestrator with configuration: {:#?}", config);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_db_connections)
            .connect(&config.database_url)
            .await?;
        migrator().run(&pool).await?;

        let backend: Arc<dyn provisioner::ProvisioningBackend> = Arc::from(create_backend(config.provisioner.clone()));
        info!(backend = backend.name(), "provisioning backend selected");

        let lifecycle = Arc::new(ProjectLifecycle::new(pool.clone(), backend, &config));
        let backup: Arc<dyn BackupRunner> = Arc::new(PgDumpBackup::from(config.backups.clone()));

        let scheduler = Arc::new(ReconciliationScheduler::new(
            pool.clone(),
            Arc::clone(&lifecycle),
            backup,
            config.scheduler.clone(),
            config.shared_cluster.clone(),
        ));
        let jobs = scheduler.spawn();

        Ok(Self { pool, lifecycle, jobs })
    }

    /// The lifecycle manager, for embedding callers driving projects
    /// programmatically.
    pub fn lifecycle(&self) -> Arc<ProjectLifecycle> {
        Arc::clone(&self.lifecycle)
    }

    /// Run until the shutdown future resolves, then stop the background
    /// jobs and drain the pool.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        info!("Orchestrator running");
        shutdown.await;

        info!("Stopping background jobs...");
        for job in self.jobs {
            job.abort();
        }

        info!("Closing database connections...");
        self.pool.close().await;
        Ok(())
    }
}
