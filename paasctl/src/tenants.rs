//! Tenant provisioning on the shared cluster.
//!
//! Shared-placement projects do not get containers; they get a database and
//! a login role on the shared Postgres, bootstrapped with the schemas and
//! roles the platform services expect. Every step is individually
//! idempotent so a crashed provisioning run can simply be repeated.

use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection, Executor};
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};

use crate::config::SharedClusterConfig;
use crate::errors::{Error, Result};
use crate::types::ProjectId;

const TENANT_BOOTSTRAP_SQL: &str = include_str!("../sql/tenant_bootstrap.sql");

/// Provisions and tears down tenant databases on the shared cluster.
#[derive(Debug, Clone)]
pub struct TenantProvisioner {
    host: String,
    port: u16,
    admin_user: String,
    admin_password: String,
    admin_db: String,
}

impl From<&SharedClusterConfig> for TenantProvisioner {
    fn from(config: &SharedClusterConfig) -> Self {
        Self {
            host: config.postgres_host.clone(),
            port: config.postgres_port,
            admin_user: config.admin_user.clone(),
            admin_password: config.admin_password.clone(),
            admin_db: config.admin_db.clone(),
        }
    }
}

pub fn tenant_db_name(project_id: &ProjectId) -> String {
    format!("project_{project_id}")
}

pub fn tenant_role_name(project_id: &ProjectId) -> String {
    format!("project_{project_id}_user")
}

/// Identifiers are interpolated into DDL (CREATE DATABASE cannot take bind
/// parameters), so only lowercase alphanumerics and underscores pass.
fn checked_ident(ident: &str) -> Result<&str> {
    if !ident.is_empty() && ident.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        Ok(ident)
    } else {
        Err(Error::BadRequest {
            message: format!("invalid SQL identifier: {ident:?}"),
        })
    }
}

/// Literals interpolated into DDL (role passwords) get standard single-quote
/// doubling.
fn quoted_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

impl TenantProvisioner {
    async fn connect(&self, database: &str) -> Result<PgConnection> {
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.admin_user)
            .password(&self.admin_password)
            .database(database);

        let conn = options.connect().await.map_err(|e| {
            Error::Other(anyhow::anyhow!("connecting to shared cluster database {database}: {e}"))
        })?;
        Ok(conn)
    }

    /// Create the tenant database, its login role and the bootstrap objects.
    ///
    /// `secrets` must contain `DB_PASSWORD`; the tenant role and the
    /// in-database `authenticator` role both log in with it.
    #[instrument(skip(self, secrets), err)]
    pub async fn provision(&self, project_id: &ProjectId, secrets: &BTreeMap<String, String>) -> Result<()> {
        let db_name = tenant_db_name(project_id);
        let role_name = tenant_role_name(project_id);
        let db = checked_ident(&db_name)?;
        let role = checked_ident(&role_name)?;
        let password = secrets.get("DB_PASSWORD").ok_or_else(|| Error::Provisioning {
            project_id: project_id.clone(),
            message: "secret map is missing DB_PASSWORD".into(),
        })?;

        let mut admin = self.connect(&self.admin_db).await?;

        match admin.execute(sqlx::raw_sql(&format!("CREATE DATABASE {db}"))).await {
            Ok(_) => info!(project_id = %project_id, db, "created tenant database"),
            Err(e) if is_pg_code(&e, "42P04") => {
                info!(project_id = %project_id, db, "tenant database already exists")
            }
            Err(e) => return Err(provisioning_error(project_id, "creating tenant database", e)),
        }

        let pw = quoted_literal(password);
        match admin.execute(sqlx::raw_sql(&format!("CREATE ROLE {role} LOGIN PASSWORD {pw}"))).await {
            Ok(_) => info!(project_id = %project_id, role, "created tenant role"),
            Err(e) if is_pg_code(&e, "42710") => {
                // Re-provisioning with fresh secrets still has to take.
                admin
                    .execute(sqlx::raw_sql(&format!("ALTER ROLE {role} LOGIN PASSWORD {pw}")))
                    .await
                    .map_err(|e| provisioning_error(project_id, "refreshing tenant role password", e))?;
            }
            Err(e) => return Err(provisioning_error(project_id, "creating tenant role", e)),
        }

        admin
            .execute(sqlx::raw_sql(&format!("GRANT ALL PRIVILEGES ON DATABASE {db} TO {role}")))
            .await
            .map_err(|e| provisioning_error(project_id, "granting tenant database", e))?;
        admin.close().await.ok();

        // The bootstrap script runs on the tenant database itself and is
        // re-runnable end to end.
        let mut tenant = self.connect(db).await?;
        let script = TENANT_BOOTSTRAP_SQL.replace("PLACEHOLDER_PASSWORD", &password.replace('\'', "''"));
        tenant
            .execute(sqlx::raw_sql(&script))
            .await
            .map_err(|e| provisioning_error(project_id, "running tenant bootstrap script", e))?;

        tenant
            .execute(sqlx::raw_sql(&format!(
                "GRANT ALL ON SCHEMA public TO {role}; GRANT USAGE ON SCHEMA auth, storage TO {role}"
            )))
            .await
        .map_err(|e| provisioning_error(project_id, "granting tenant schemas", e))?;
        tenant.close().await.ok();

        Ok(())
    }

    /// Drop the tenant database and role. Active sessions are terminated
    /// first; DROP DATABASE refuses databases with connected backends.
    #[instrument(skip(self), err)]
    pub async fn teardown(&self, project_id: &ProjectId) -> Result<()> {
        let db_name = tenant_db_name(project_id);
        let role_name = tenant_role_name(project_id);
        let db = checked_ident(&db_name)?;
        let role = checked_ident(&role_name)?;

        let mut admin = self.connect(&self.admin_db).await?;

        sqlx::query(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = $1 AND pid <> pg_backend_pid()",
        )
        .bind(db)
        .execute(&mut admin)
        .await
        .map_err(|e| provisioning_error(project_id, "terminating tenant connections", e))?;

        sqlx::raw_sql(&format!("DROP DATABASE IF EXISTS {db}"))
            .execute(&mut admin)
            .await
            .map_err(|e| provisioning_error(project_id, "dropping tenant database", e))?;

        if let Err(e) = sqlx::raw_sql(&format!("DROP ROLE IF EXISTS {role}")).execute(&mut admin).await {
            // The role may own objects in other databases; leave it behind
            // rather than failing the teardown.
            warn!(project_id = %project_id, role, %e, "could not drop tenant role");
        }
        admin.close().await.ok();

        Ok(())
    }
}

fn is_pg_code(err: &sqlx::Error, code: &str) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(code))
}

fn provisioning_error(project_id: &ProjectId, action: &str, err: sqlx::Error) -> Error {
    Error::Provisioning {
        project_id: project_id.clone(),
        message: format!("{action}: {err}"),
    }
}
