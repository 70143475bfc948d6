//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides. The configuration file path defaults to `config.yaml` but can
//! be specified via `-f` flag or the `PAASCTL_CONFIG` environment variable.
//!
//! ## Loading priority
//!
//! 1. **YAML config file** - base configuration (default: `config.yaml`)
//! 2. **Environment variables** - variables prefixed with `PAASCTL_`
//! 3. **DATABASE_URL** - special case: overrides `database_url` if set
//!
//! For nested config values, use double underscores in environment
//! variables: `PAASCTL_SHARED_CLUSTER__POSTGRES_PORT=54322` sets
//! `shared_cluster.postgres_port`.

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use url::Url;

use crate::errors::Error;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "PAASCTL_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the orchestrator.
    /// Useful for CI/CD pipelines to catch config errors before deployment.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Control-plane database connection string
    pub database_url: String,
    /// Maximum control-plane database pool size
    pub max_db_connections: u32,
    /// Coordinates and secrets of the shared multi-tenant cluster
    pub shared_cluster: SharedClusterConfig,
    /// Which provisioning backend dedicated projects run on
    pub provisioner: ProvisionerConfig,
    /// First host port the allocator hands out to dedicated stacks
    pub port_range_start: u16,
    /// Background reconciliation intervals
    pub scheduler: SchedulerConfig,
    /// Nightly backup settings
    pub backups: BackupConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_db_connections: 10,
            shared_cluster: SharedClusterConfig::default(),
            provisioner: ProvisionerConfig::default(),
            port_range_start: 54100,
            scheduler: SchedulerConfig::default(),
            backups: BackupConfig::default(),
        }
    }
}

/// The shared cluster every free/pro project lands on.
///
/// In the minimal deployment this is also where private clusters are routed
/// until they get infrastructure of their own.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SharedClusterConfig {
    pub postgres_host: String,
    pub postgres_port: u16,
    /// Superuser able to CREATE DATABASE / CREATE ROLE
    pub admin_user: String,
    pub admin_password: String,
    /// Maintenance database for admin connections
    pub admin_db: String,
    /// Public URL of the shared API gateway
    pub gateway_url: String,
    /// JWT secret the shared gateway verifies API keys against.
    /// Set via `PAASCTL_SHARED_CLUSTER__JWT_SECRET`.
    pub jwt_secret: String,
}

impl Default for SharedClusterConfig {
    fn default() -> Self {
        Self {
            postgres_host: "localhost".to_string(),
            postgres_port: 54322,
            admin_user: "postgres".to_string(),
            admin_password: String::new(),
            admin_db: "postgres".to_string(),
            gateway_url: "http://localhost:8000".to_string(),
            jwt_secret: String::new(),
        }
    }
}

/// Provisioning backend configuration.
///
/// Supports different substrates via an enum. Credentials should be set via
/// environment variables.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionerConfig {
    /// Docker compose stacks on the orchestrator host
    Local(LocalDriverConfig),
    /// A remote deployment platform driven over its HTTP API
    /// Set credentials via:
    /// - `PAASCTL_PROVISIONER__REMOTE__API_URL`
    /// - `PAASCTL_PROVISIONER__REMOTE__API_TOKEN`
    Remote(RemoteDriverConfig),
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        ProvisionerConfig::Local(LocalDriverConfig::default())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocalDriverConfig {
    /// Directory holding one subdirectory per project
    pub projects_dir: PathBuf,
    /// Compose file shared by all project stacks, parameterized via env
    pub compose_template: PathBuf,
    /// First provision pulls images, so this is minutes-scale
    #[serde(with = "humantime_serde")]
    pub provision_timeout: Duration,
    /// Deadline for stop/start/down of already-built stacks
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
}

impl Default for LocalDriverConfig {
    fn default() -> Self {
        Self {
            projects_dir: PathBuf::from("./projects"),
            compose_template: PathBuf::from("./stack/docker-compose.yaml"),
            provision_timeout: Duration::from_secs(600),
            command_timeout: Duration::from_secs(45),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteDriverConfig {
    /// Base URL of the platform API
    pub api_url: Url,
    /// Bearer token for the platform API
    pub api_token: String,
    /// Projects are exposed as `project-{id}.{domain_suffix}`
    pub domain_suffix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// How often pending clusters are provisioned and waiting projects promoted
    #[serde(with = "humantime_serde")]
    pub cluster_interval: Duration,
    /// How often cluster usage gauges are refreshed
    #[serde(with = "humantime_serde")]
    pub usage_interval: Duration,
    /// Hour of day (UTC, 0-23) the backup sweep runs
    pub backup_hour: u8,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cluster_interval: Duration::from_secs(10),
            usage_interval: Duration::from_secs(60),
            backup_hour: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackupConfig {
    /// Directory backup artifacts are written to
    pub dir: PathBuf,
    #[serde(with = "humantime_serde")]
    pub pg_dump_timeout: Duration,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./backups"),
            pg_dump_timeout: Duration::from_secs(600),
        }
    }
}

impl Config {
    /// Load configuration from file and environment, then validate.
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Cross-field checks that serde cannot express.
    pub fn validate(&self) -> Result<(), Error> {
        if self.database_url.is_empty() {
            return Err(Error::BadRequest {
                message: "Config validation: database_url must be set (or DATABASE_URL exported)".to_string(),
            });
        }
        if self.shared_cluster.jwt_secret.is_empty() {
            return Err(Error::BadRequest {
                message: "Config validation: shared_cluster.jwt_secret must be set".to_string(),
            });
        }
        if self.port_range_start < 1024 {
            return Err(Error::BadRequest {
                message: format!(
                    "Config validation: port_range_start ({}) must not be in the privileged range",
                    self.port_range_start
                ),
            });
        }
        if self.scheduler.backup_hour > 23 {
            return Err(Error::BadRequest {
                message: format!(
                    "Config validation: scheduler.backup_hour ({}) must be 0-23",
                    self.scheduler.backup_hour
                ),
            });
        }
        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can still override specific values
            .merge(Env::prefixed("PAASCTL_").split("__"))
            // Common DATABASE_URL pattern
            .merge(Env::raw().only(&["DATABASE_URL"]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_minimal_config() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
database_url: postgresql://localhost/paasctl
shared_cluster:
  jwt_secret: super-secret
"#,
            )?;

            let args = Args {
                config: "test.yaml".to_string(),
                validate: false,
            };

            let config = Config::load(&args)?;

            assert_eq!(config.database_url, "postgresql://localhost/paasctl");
            assert_eq!(config.shared_cluster.postgres_port, 54322); // default
            assert_eq!(config.port_range_start, 54100); // default
            assert!(matches!(config.provisioner, ProvisionerConfig::Local(_)));

            Ok(())
        });
    }

    #[test]
    fn test_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
database_url: postgresql://localhost/paasctl
shared_cluster:
  jwt_secret: super-secret
  postgres_host: db.internal
"#,
            )?;

            jail.set_env("PAASCTL_PORT_RANGE_START", "60000");
            jail.set_env("PAASCTL_SHARED_CLUSTER__POSTGRES_PORT", "6543");

            let args = Args {
                config: "test.yaml".to_string(),
                validate: false,
            };

            let config = Config::load(&args)?;

            // Env vars should override
            assert_eq!(config.port_range_start, 60000);
            assert_eq!(config.shared_cluster.postgres_port, 6543);

            // YAML values should be preserved
            assert_eq!(config.shared_cluster.postgres_host, "db.internal");

            Ok(())
        });
    }

    #[test]
    fn test_database_url_env_special_case() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
database_url: postgresql://localhost/from_yaml
shared_cluster:
  jwt_secret: super-secret
"#,
            )?;

            jail.set_env("DATABASE_URL", "postgresql://localhost/from_env");

            let args = Args {
                config: "test.yaml".to_string(),
                validate: false,
            };

            let config = Config::load(&args)?;
            assert_eq!(config.database_url, "postgresql://localhost/from_env");

            Ok(())
        });
    }

    #[test]
    fn test_remote_provisioner_config() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
database_url: postgresql://localhost/paasctl
shared_cluster:
  jwt_secret: super-secret
provisioner:
  remote:
    api_url: https://deploy.example.com/api
    api_token: tok-abc
    domain_suffix: apps.example.com
"#,
            )?;

            let args = Args {
                config: "test.yaml".to_string(),
                validate: false,
            };

            let config = Config::load(&args)?;
            match config.provisioner {
                ProvisionerConfig::Remote(remote) => {
                    assert_eq!(remote.api_url.as_str(), "https://deploy.example.com/api");
                    assert_eq!(remote.api_token, "tok-abc");
                    assert_eq!(remote.domain_suffix, "apps.example.com");
                }
                other => panic!("expected remote provisioner, got {other:?}"),
            }

            Ok(())
        });
    }

    #[test]
    fn test_durations_parse_humantime() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
database_url: postgresql://localhost/paasctl
shared_cluster:
  jwt_secret: super-secret
scheduler:
  cluster_interval: 5s
  usage_interval: 2m
provisioner:
  local:
    provision_timeout: 15m
"#,
            )?;

            let args = Args {
                config: "test.yaml".to_string(),
                validate: false,
            };

            let config = Config::load(&args)?;
            assert_eq!(config.scheduler.cluster_interval, Duration::from_secs(5));
            assert_eq!(config.scheduler.usage_interval, Duration::from_secs(120));
            match config.provisioner {
                ProvisionerConfig::Local(local) => {
                    assert_eq!(local.provision_timeout, Duration::from_secs(900));
                    assert_eq!(local.command_timeout, Duration::from_secs(45)); // default
                }
                other => panic!("expected local provisioner, got {other:?}"),
            }

            Ok(())
        });
    }

    #[test]
    fn test_validation_rejects_missing_jwt_secret() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "database_url: postgresql://localhost/paasctl\n")?;

            let args = Args {
                config: "test.yaml".to_string(),
                validate: false,
            };

            assert!(Config::load(&args).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_validation_rejects_privileged_port_range() {
        let config = Config {
            database_url: "postgresql://localhost/paasctl".to_string(),
            shared_cluster: SharedClusterConfig {
                jwt_secret: "s".to_string(),
                ..Default::default()
            },
            port_range_start: 80,
            ..Default::default()
        };

        assert!(config.validate().is_err());
    }
}
