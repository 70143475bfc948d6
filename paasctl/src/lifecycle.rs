//! Project lifecycle management.
//!
//! Owns the `CREATING -> PROVISIONING -> RUNNING <-> STOPPED -> DELETING ->
//! DELETED` state machine and coordinates the collaborators around it:
//! quota gate, cluster resolver, secret generation, tenant provisioning and
//! the provisioning backend. Every status flip is a compare-and-set UPDATE
//! committed only after the corresponding external side effect succeeded.

use sqlx::PgPool;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::cluster::ClusterResolver;
use crate::config::{Config, SharedClusterConfig};
use crate::db::handlers::{Entitlements, Projects, Secrets};
use crate::db::models::clusters::{Cluster, ClusterStatus};
use crate::db::models::projects::{Placement, Project, ProjectCreateDBRequest, ProjectStatus};
use crate::errors::{Error, Result};
use crate::provisioner::{ProvisionError, ProvisioningBackend};
use crate::secrets::{generate_project_secrets, PortAllocator};
use crate::tenants::{tenant_db_name, tenant_role_name, TenantProvisioner};
use crate::types::{new_project_id, OrgId, ProjectId};

/// How many times a dedicated provision is retried after a port allocation
/// lost the race to a concurrently started stack.
const ALLOCATION_RETRIES: u32 = 3;

pub struct ProjectLifecycle {
    pool: PgPool,
    backend: Arc<dyn ProvisioningBackend>,
    resolver: ClusterResolver,
    tenants: TenantProvisioner,
    allocator: PortAllocator,
    shared: SharedClusterConfig,
}

impl ProjectLifecycle {
    pub fn new(pool: PgPool, backend: Arc<dyn ProvisioningBackend>, config: &Config) -> Self {
        Self {
            pool,
            backend,
            resolver: ClusterResolver::new(config.shared_cluster.clone()),
            tenants: TenantProvisioner::from(&config.shared_cluster),
            allocator: PortAllocator::new(config.port_range_start),
            shared: config.shared_cluster.clone(),
        }
    }

    /// Create a new project.
    ///
    /// The quota check, cluster resolution, row insert and entitlement
    /// counter bump happen in one transaction; secrets are persisted next;
    /// only then do external side effects start. A project placed on a
    /// still-creating cluster is returned in CREATING and promoted by the
    /// scheduler once the cluster is up.
    #[instrument(skip(self), err)]
    pub async fn create(
        &self,
        name: &str,
        org_id: OrgId,
        requested: Placement,
        custom_domain: Option<&str>,
    ) -> Result<Project> {
        let mut tx = self.pool.begin().await?;

        let entitlement = Entitlements::new(&mut *tx).get_or_default(org_id).await?;
        let plan = Entitlements::new(&mut *tx).get_plan(&entitlement.plan_id).await?;
        if plan.max_projects >= 0 && entitlement.projects_used >= plan.max_projects {
            return Err(Error::QuotaExceeded {
                message: format!(
                    "plan {} allows {} projects, {} in use",
                    plan.id, plan.max_projects, entitlement.projects_used
                ),
            });
        }

        let (cluster, placement) = self.resolver.resolve(&mut *tx, org_id, requested).await?;

        let id = new_project_id();
        let request = ProjectCreateDBRequest {
            id: id.clone(),
            name: name.to_string(),
            org_id,
            placement,
            backend: match placement {
                Placement::Shared => "shared".to_string(),
                Placement::Dedicated => self.backend.name().to_string(),
            },
            cluster_id: Some(cluster.id.clone()),
            db_name: match placement {
                Placement::Shared => Some(tenant_db_name(&id)),
                Placement::Dedicated => None,
            },
            custom_domain: custom_domain.map(str::to_string),
        };
        let project = Projects::new(&mut *tx).create(&request).await?;
        Entitlements::new(&mut *tx).increment_projects(org_id).await?;
        tx.commit().await?;

        // Secrets exist in the database before any external call, so a crash
        // mid-provisioning never strands a stack whose credentials are lost.
        // A failure here still fails the project and releases its quota slot.
        if let Err(err) = self.generate_and_store_secrets(&project).await {
            error!(project_id = %project.id, %err, "secret generation failed");
            self.fail_project(&project, &err.to_string()).await?;
            return Err(err);
        }

        if cluster.status == ClusterStatus::Creating {
            info!(project_id = %project.id, cluster_id = %cluster.id,
                "cluster still provisioning, project parked in creating");
            return Ok(project);
        }

        self.provision(project, cluster).await
    }

    async fn generate_and_store_secrets(&self, project: &Project) -> Result<()> {
        let reserved = {
            let mut conn = self.pool.acquire().await?;
            Secrets::new(&mut *conn).reserved_ports().await?
        };

        let secrets = generate_project_secrets(
            &project.id,
            project.placement,
            self.shared.postgres_port,
            &self.shared.jwt_secret,
            &self.allocator,
            &reserved,
        )
        .await?;

        let mut conn = self.pool.acquire().await?;
        Secrets::new(&mut *conn).put_many(&project.id, &secrets).await?;
        Ok(())
    }

    /// Drive a CREATING project through PROVISIONING to RUNNING.
    ///
    /// Also the promotion path the scheduler uses for projects that waited
    /// on their cluster. Any provisioning failure lands the project in
    /// FAILED with `last_error` set; the row is retained for inspection.
    ///
    /// The scheduler awaits this inside spawned tasks, so `Send` is part of
    /// the signature rather than left to auto-trait inference across the
    /// task boundary.
    pub fn provision(&self, project: Project, cluster: Cluster) -> impl Future<Output = Result<Project>> + Send + '_ {
        self.provision_inner(project, cluster)
    }

    #[instrument(skip(self, project, cluster), fields(project_id = %project.id), err)]
    async fn provision_inner(&self, project: Project, cluster: Cluster) -> Result<Project> {
        let mut conn = self.pool.acquire().await?;
        let project = match Projects::new(&mut *conn)
            .transition(&project.id, ProjectStatus::Creating, ProjectStatus::Provisioning)
            .await?
        {
            Some(updated) => updated,
            // Someone else is already driving this project.
            None => return Ok(project),
        };
        drop(conn);

        match self.run_provisioning(&project, &cluster).await {
            Ok((api_url, db_url)) => {
                let mut conn = self.pool.acquire().await?;
                Projects::new(&mut *conn).set_endpoints(&project.id, &api_url, &db_url).await?;
                let running = Projects::new(&mut *conn)
                    .transition(&project.id, ProjectStatus::Provisioning, ProjectStatus::Running)
                    .await?
                    .ok_or_else(|| Error::Conflict {
                        message: format!("project {} left provisioning while being provisioned", project.id),
                    })?;
                info!(project_id = %running.id, api_url, "project provisioned and running");
                Ok(running)
            }
            Err(err) => {
                error!(project_id = %project.id, %err, "provisioning failed");
                self.fail_project(&project, &err.to_string()).await?;
                Err(err)
            }
        }
    }

    async fn run_provisioning(&self, project: &Project, cluster: &Cluster) -> Result<(String, String)> {
        let mut conn = self.pool.acquire().await?;
        let secrets = Secrets::new(&mut *conn).get_map(&project.id).await?;
        drop(conn);

        match project.placement {
            Placement::Shared => {
                self.tenants.provision(&project.id, &secrets).await?;

                let (host, port) = cluster.coordinates().ok_or_else(|| Error::Provisioning {
                    project_id: project.id.clone(),
                    message: format!("cluster {} has no coordinates", cluster.id),
                })?;
                let password = secrets.get("DB_PASSWORD").cloned().unwrap_or_default();
                let api_url = format!(
                    "{}/projects/{}",
                    self.shared.gateway_url.trim_end_matches('/'),
                    project.id
                );
                let db_url = format!(
                    "postgresql://{}:{password}@{host}:{port}/{}",
                    tenant_role_name(&project.id),
                    tenant_db_name(&project.id),
                );
                Ok((api_url, db_url))
            }
            Placement::Dedicated => {
                let mut secrets = secrets;
                let mut attempt = 0;
                loop {
                    match self.backend.provision(&project.id, &secrets, project.custom_domain.as_deref()).await {
                        Ok(endpoints) => return Ok((endpoints.api_url, endpoints.db_url)),
                        Err(err) if err.is_retryable() && attempt < ALLOCATION_RETRIES => {
                            attempt += 1;
                            warn!(project_id = %project.id, attempt, %err,
                                "port block lost a race, re-allocating and retrying");
                            let reserved = {
                                let mut conn = self.pool.acquire().await?;
                                Secrets::new(&mut *conn).reserved_ports().await?
                            };
                            secrets = generate_project_secrets(
                                &project.id,
                                Placement::Dedicated,
                                self.shared.postgres_port,
                                &self.shared.jwt_secret,
                                &self.allocator,
                                &reserved,
                            )
                            .await?;
                            let mut conn = self.pool.acquire().await?;
                            Secrets::new(&mut *conn).put_many(&project.id, &secrets).await?;
                        }
                        Err(err) => {
                            return Err(Error::Provisioning {
                                project_id: project.id.clone(),
                                message: err.to_string(),
                            })
                        }
                    }
                }
            }
        }
    }

    async fn fail_project(&self, project: &Project, cause: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if Projects::new(&mut *tx).mark_failed(&project.id, cause).await?.is_some() {
            // A failed creation does not consume quota.
            Entitlements::new(&mut *tx).decrement_projects(project.org_id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Stop a running project. Idempotent: stopping a stopped project is a
    /// no-op success; anything else is a conflict.
    #[instrument(skip(self), err)]
    pub async fn stop(&self, id: &ProjectId) -> Result<Project> {
        let project = self.get(id).await?;
        match project.status {
            ProjectStatus::Stopped => return Ok(project),
            ProjectStatus::Running => {}
            other => {
                return Err(Error::Conflict {
                    message: format!("cannot stop project {id} in status {other}"),
                })
            }
        }

        // Shared projects have no containers of their own; stopping them is
        // purely a control-plane state change.
        if project.placement == Placement::Dedicated {
            self.backend.stop(id).await.map_err(|e| provision_error(id, e))?;
        }

        let mut conn = self.pool.acquire().await?;
        match Projects::new(&mut *conn)
            .transition(id, ProjectStatus::Running, ProjectStatus::Stopped)
            .await?
        {
            Some(stopped) => Ok(stopped),
            None => self.get(id).await,
        }
    }

    /// Start a stopped project. Idempotent for already-running projects.
    #[instrument(skip(self), err)]
    pub async fn start(&self, id: &ProjectId) -> Result<Project> {
        let project = self.get(id).await?;
        match project.status {
            ProjectStatus::Running => return Ok(project),
            ProjectStatus::Stopped => {}
            other => {
                return Err(Error::Conflict {
                    message: format!("cannot start project {id} in status {other}"),
                })
            }
        }

        if project.placement == Placement::Dedicated {
            self.backend.start(id).await.map_err(|e| provision_error(id, e))?;
        }

        let mut conn = self.pool.acquire().await?;
        match Projects::new(&mut *conn)
            .transition(id, ProjectStatus::Stopped, ProjectStatus::Running)
            .await?
        {
            Some(started) => Ok(started),
            None => self.get(id).await,
        }
    }

    /// Delete a project and its external resources.
    ///
    /// Idempotent: deleting a DELETED project succeeds. Works for projects
    /// stuck in PROVISIONING. A cleanup failure marks the project FAILED
    /// with the cause instead of claiming DELETED while the stack may still
    /// be live; missing resources are not failures, the drivers treat those
    /// as no-ops.
    #[instrument(skip(self), err)]
    pub async fn delete(&self, id: &ProjectId) -> Result<Project> {
        let project = self.get(id).await?;
        match project.status {
            ProjectStatus::Deleted => return Ok(project),
            ProjectStatus::Running | ProjectStatus::Stopped | ProjectStatus::Provisioning => {}
            other => {
                return Err(Error::Conflict {
                    message: format!("cannot delete project {id} in status {other}"),
                })
            }
        }

        let mut conn = self.pool.acquire().await?;
        let project = Projects::new(&mut *conn)
            .transition(id, project.status, ProjectStatus::Deleting)
            .await?
            .ok_or_else(|| Error::Conflict {
                message: format!("project {id} changed status while deletion was starting"),
            })?;
        drop(conn);

        let cleanup = match project.placement {
            Placement::Shared => self.tenants.teardown(id).await,
            Placement::Dedicated => self.backend.destroy(id).await.map_err(|e| provision_error(id, e)),
        };
        if let Err(err) = cleanup {
            // The stack may still be live; quota stays consumed until an
            // operator resolves it.
            error!(project_id = %id, %err, "cleanup failed, marking the project failed");
            let mut conn = self.pool.acquire().await?;
            Projects::new(&mut *conn).mark_failed(id, &err.to_string()).await?;
            return Err(err);
        }

        let mut tx = self.pool.begin().await?;
        let deleted = Projects::new(&mut *tx)
            .transition(id, ProjectStatus::Deleting, ProjectStatus::Deleted)
            .await?
            .ok_or_else(|| Error::Conflict {
                message: format!("project {id} left deleting mid-delete"),
            })?;
        Entitlements::new(&mut *tx).decrement_projects(project.org_id).await?;
        tx.commit().await?;

        info!(project_id = %id, "project deleted");
        Ok(deleted)
    }

    /// Restore a soft-deleted dedicated project from its archive.
    #[instrument(skip(self), err)]
    pub async fn restore(&self, id: &ProjectId) -> Result<Project> {
        let project = self.get(id).await?;
        if project.placement != Placement::Dedicated {
            return Err(Error::BadRequest {
                message: format!("project {id} is shared-placement, only dedicated projects can be restored"),
            });
        }
        if project.status != ProjectStatus::Deleted {
            return Err(Error::Conflict {
                message: format!("cannot restore project {id} in status {}", project.status),
            });
        }

        let endpoints = match self.backend.restore(id).await {
            Ok(endpoints) => endpoints,
            Err(ProvisionError::ArchiveMissing(_)) => return Err(Error::not_found("archive for project", id.clone())),
            Err(ProvisionError::AlreadyLive(_)) => {
                return Err(Error::Conflict {
                    message: format!("project {id} already has a live stack"),
                })
            }
            Err(err) => return Err(provision_error(id, err)),
        };

        let mut tx = self.pool.begin().await?;
        Projects::new(&mut *tx)
            .set_endpoints(id, &endpoints.api_url, &endpoints.db_url)
            .await?;
        let restored = Projects::new(&mut *tx).revive(id).await?.ok_or_else(|| Error::Conflict {
            message: format!("project {id} left deleted mid-restore"),
        })?;
        Entitlements::new(&mut *tx).increment_projects(project.org_id).await?;
        tx.commit().await?;

        info!(project_id = %id, "project restored from archive");
        Ok(restored)
    }

    pub async fn get(&self, id: &ProjectId) -> Result<Project> {
        let mut conn = self.pool.acquire().await?;
        Projects::new(&mut *conn)
            .get_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found("project", id.clone()))
    }
}

fn provision_error(id: &ProjectId, err: ProvisionError) -> Error {
    Error::Provisioning {
        project_id: id.clone(),
        message: err.to_string(),
    }
}
