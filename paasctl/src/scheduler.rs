//! Background reconciliation scheduler.
//!
//! A single daemon with three periodic jobs:
//!
//! 1. pending-cluster provisioning plus promotion of projects that waited on
//!    their cluster,
//! 2. cluster usage gauge refresh,
//! 3. the daily backup sweep.
//!
//! Jobs run on `tokio::time::interval` timers with missed ticks skipped, so
//! a slow pass never queues up a burst of catch-up work, and each job is a
//! single task, never re-entrant.

use chrono::{Duration as ChronoDuration, Timelike, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::backup::BackupRunner;
use crate::config::{SchedulerConfig, SharedClusterConfig};
use crate::db::handlers::{Clusters, Projects};
use crate::db::models::clusters::{Cluster, ClusterStatus, ClusterUsage};
use crate::db::models::projects::ProjectStatus;
use crate::errors::Result;
use crate::lifecycle::ProjectLifecycle;
use crate::types::ClusterId;

/// Rough per-project resource estimates for the usage gauge. Real telemetry
/// would come from the cluster itself; these keep the capacity view useful
/// until it does.
const EST_CPU_PERCENT_PER_PROJECT: f64 = 2.5;
const EST_MEMORY_MB_PER_PROJECT: i32 = 192;
const EST_CONNECTIONS_PER_PROJECT: i32 = 4;

pub struct ReconciliationScheduler {
    pool: PgPool,
    lifecycle: Arc<ProjectLifecycle>,
    backup: Arc<dyn BackupRunner>,
    config: SchedulerConfig,
    shared: SharedClusterConfig,
}

impl ReconciliationScheduler {
    pub fn new(
        pool: PgPool,
        lifecycle: Arc<ProjectLifecycle>,
        backup: Arc<dyn BackupRunner>,
        config: SchedulerConfig,
        shared: SharedClusterConfig,
    ) -> Self {
        Self {
            pool,
            lifecycle,
            backup,
            config,
            shared,
        }
    }

    /// Spawn the three background jobs and return their handles.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let cluster_job = {
            let scheduler = Arc::clone(&self);
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(scheduler.config.cluster_interval);
                timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    timer.tick().await;
                    if let Err(e) = scheduler.provision_pending_clusters().await {
                        error!("pending-cluster pass failed: {e}");
                    }
                }
            })
        };

        let usage_job = {
            let scheduler = Arc::clone(&self);
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(scheduler.config.usage_interval);
                timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    timer.tick().await;
                    if let Err(e) = scheduler.refresh_usage().await {
                        error!("usage refresh failed: {e}");
                    }
                }
            })
        };

        let backup_job = {
            let scheduler = Arc::clone(&self);
            tokio::spawn(async move {
                loop {
                    let wait = seconds_until_hour(now_hour_minute(), scheduler.config.backup_hour);
                    info!(seconds = wait, "next backup sweep scheduled");
                    tokio::time::sleep(std::time::Duration::from_secs(wait)).await;
                    scheduler.run_backup_sweep().await;
                }
            })
        };

        vec![cluster_job, usage_job, backup_job]
    }

    /// Provision clusters sitting in `creating` and promote their waiting
    /// projects.
    ///
    /// In the minimal deployment a private cluster has no infrastructure of
    /// its own yet; it is routed onto the shared coordinates so tenants are
    /// reachable the moment the row flips to `running`.
    #[instrument(skip(self), err)]
    pub async fn provision_pending_clusters(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let pending = Clusters::new(&mut *conn).list_by_status(ClusterStatus::Creating).await?;
        drop(conn);

        for cluster in pending {
            match self.bring_cluster_up(&cluster.id).await {
                Ok(Some(cluster)) => {
                    info!(cluster_id = %cluster.id, "cluster is now running");
                    self.promote_waiting_projects(&cluster).await;
                }
                Ok(None) => warn!(cluster_id = %cluster.id, "cluster left creating before this pass, skipping"),
                Err(e) => {
                    // Failed clusters stay failed; they are not retried.
                    error!(cluster_id = %cluster.id, "cluster provisioning failed: {e}");
                    if let Err(e) = self.mark_cluster_failed(&cluster.id).await {
                        error!(cluster_id = %cluster.id, "could not mark cluster failed: {e}");
                    }
                }
            }
        }
        Ok(())
    }

    async fn bring_cluster_up(&self, cluster_id: &ClusterId) -> Result<Option<Cluster>> {
        let mut conn = self.pool.acquire().await?;
        Clusters::new(&mut *conn)
            .mark_running(
                cluster_id,
                &self.shared.postgres_host,
                self.shared.postgres_port,
                &self.shared.gateway_url,
            )
            .await
            .map_err(Into::into)
    }

    async fn mark_cluster_failed(&self, cluster_id: &ClusterId) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Clusters::new(&mut *conn).mark_failed(cluster_id).await?;
        Ok(())
    }

    /// Push projects that were parked in CREATING on this cluster through
    /// the normal provisioning path. Per-project failures are logged and do
    /// not abort the pass.
    async fn promote_waiting_projects(&self, cluster: &Cluster) {
        let waiting = match self.pool.acquire().await {
            Ok(mut conn) => match Projects::new(&mut *conn).list_waiting_on_cluster(&cluster.id).await {
                Ok(projects) => projects,
                Err(e) => {
                    error!(cluster_id = %cluster.id, "listing waiting projects failed: {e}");
                    return;
                }
            },
            Err(e) => {
                error!("acquiring connection failed: {e}");
                return;
            }
        };

        for project in waiting {
            let project_id = project.id.clone();
            if let Err(e) = self.lifecycle.provision(project, cluster.clone()).await {
                error!(project_id = %project_id, "promotion failed: {e}");
            }
        }
    }

    /// Overwrite every running cluster's usage gauge.
    #[instrument(skip(self), err)]
    pub async fn refresh_usage(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let clusters = Clusters::new(&mut *conn).list_by_status(ClusterStatus::Running).await?;

        for cluster in clusters {
            let count = Projects::new(&mut *conn).count_live_on_cluster(&cluster.id).await? as i32;
            let usage = ClusterUsage {
                cluster_id: cluster.id.clone(),
                project_count: count,
                cpu_percent: (f64::from(count) * EST_CPU_PERCENT_PER_PROJECT).min(100.0),
                memory_mb: count * EST_MEMORY_MB_PER_PROJECT,
                active_connections: count * EST_CONNECTIONS_PER_PROJECT,
                updated_at: Utc::now(),
            };
            Clusters::new(&mut *conn).overwrite_usage(&usage).await?;
        }
        Ok(())
    }

    /// Back up every RUNNING project; per-project failures are logged and
    /// the sweep continues.
    #[instrument(skip(self))]
    pub async fn run_backup_sweep(&self) {
        let running = match self.pool.acquire().await {
            Ok(mut conn) => match Projects::new(&mut *conn).list_by_status(ProjectStatus::Running).await {
                Ok(projects) => projects,
                Err(e) => {
                    error!("listing running projects failed: {e}");
                    return;
                }
            },
            Err(e) => {
                error!("acquiring connection failed: {e}");
                return;
            }
        };

        info!(count = running.len(), "starting backup sweep");
        for project in running {
            if let Err(e) = self.backup.run(&project).await {
                error!(project_id = %project.id, "backup failed: {e}");
            }
        }
    }
}

fn now_hour_minute() -> (u32, u32, u32) {
    let now = Utc::now();
    (now.hour(), now.minute(), now.second())
}

/// Seconds from `(hour, minute, second)` until the next occurrence of
/// `target_hour:00:00`, a full day away when we are exactly on it.
fn seconds_until_hour((hour, minute, second): (u32, u32, u32), target_hour: u8) -> u64 {
    let now_secs = i64::from(hour) * 3600 + i64::from(minute) * 60 + i64::from(second);
    let target_secs = i64::from(target_hour) * 3600;
    let day = ChronoDuration::days(1).num_seconds();

    let mut delta = target_secs - now_secs;
    if delta <= 0 {
        delta += day;
    }
    delta as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_waits_until_the_configured_hour() {
        // 01:00:00 -> 03:00 is two hours away
        assert_eq!(seconds_until_hour((1, 0, 0), 3), 2 * 3600);
        // 03:00:00 exactly -> a full day
        assert_eq!(seconds_until_hour((3, 0, 0), 3), 24 * 3600);
        // 23:59:30 -> 03:00 next day
        assert_eq!(seconds_until_hour((23, 59, 30), 3), 3 * 3600 + 30);
        // just past the hour wraps to tomorrow
        assert_eq!(seconds_until_hour((3, 0, 1), 3), 24 * 3600 - 1);
    }

    #[test]
    fn usage_estimates_are_clamped() {
        let cpu = (f64::from(100) * EST_CPU_PERCENT_PER_PROJECT).min(100.0);
        assert_eq!(cpu, 100.0);
    }
}
