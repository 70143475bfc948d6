//! Secret material and host-port allocation for project stacks.
//!
//! Every project gets a fresh database password, JWT signing secret and a
//! pair of pre-minted API keys. Dedicated projects additionally get a block
//! of host ports for their compose stack; shared projects reuse the global
//! cluster's listeners and only carry the coordinates.

use crate::db::models::projects::Placement;
use crate::errors::{Error, Result};
use crate::types::ProjectId;
use anyhow::Context;
use chrono::{Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::net::TcpListener;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

/// Service keys a dedicated stack binds on the host, in allocation order.
const DEDICATED_PORT_KEYS: [&str; 7] = [
    "DB_PORT",
    "REST_PORT",
    "REALTIME_PORT",
    "STORAGE_PORT",
    "AUTH_PORT",
    "FUNCTIONS_PORT",
    "GATEWAY_PORT",
];

/// API keys are minted far in the future; rotation goes through
/// re-provisioning, not expiry.
const API_KEY_TTL_DAYS: i64 = 3650;

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[derive(Debug, Serialize)]
struct ApiKeyClaims<'a> {
    role: &'a str,
    iss: &'a str,
    iat: i64,
    exp: i64,
}

/// Mint a gateway API key: an HS256 JWT whose `role` claim the tenant
/// database switches into (`anon` or `service_role`).
pub fn mint_api_key(jwt_secret: &str, role: &str) -> Result<String> {
    let now = Utc::now();
    let claims = ApiKeyClaims {
        role,
        iss: "supabase",
        iat: now.timestamp(),
        exp: (now + Duration::days(API_KEY_TTL_DAYS)).timestamp(),
    };

    let token = jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(jwt_secret.as_bytes()),
    )
    .context("signing gateway API key")?;

    Ok(token)
}

/// Generate the full secret bundle for a project.
///
/// Shared projects carry the tenant database name, its login role and the
/// shared cluster's port, and sign their API keys with the shared cluster's
/// JWT secret since they sit behind its gateway. Dedicated projects own a
/// whole stack, so they get their own JWT secret, a `SECRET_KEY_BASE` for
/// realtime and one host port per service from the allocator.
#[instrument(skip(allocator, shared_db_port, shared_jwt_secret, reserved), err)]
pub async fn generate_project_secrets(
    project_id: &ProjectId,
    placement: Placement,
    shared_db_port: u16,
    shared_jwt_secret: &str,
    allocator: &PortAllocator,
    reserved: &HashSet<u16>,
) -> Result<BTreeMap<String, String>> {
    let jwt_secret = match placement {
        Placement::Shared => shared_jwt_secret.to_string(),
        Placement::Dedicated => random_token(40),
    };

    let mut secrets = BTreeMap::new();
    secrets.insert("DB_PASSWORD".into(), random_token(24));
    secrets.insert("ANON_KEY".into(), mint_api_key(&jwt_secret, "anon")?);
    secrets.insert("SERVICE_ROLE_KEY".into(), mint_api_key(&jwt_secret, "service_role")?);
    secrets.insert("JWT_SECRET".into(), jwt_secret);

    match placement {
        Placement::Shared => {
            secrets.insert("POSTGRES_DB".into(), format!("project_{project_id}"));
            secrets.insert("POSTGRES_USER".into(), format!("project_{project_id}_user"));
            secrets.insert("DB_PORT".into(), shared_db_port.to_string());
        }
        Placement::Dedicated => {
            secrets.insert("POSTGRES_DB".into(), "postgres".into());
            secrets.insert("POSTGRES_USER".into(), "postgres".into());
            secrets.insert("SECRET_KEY_BASE".into(), random_token(64));

            let ports = allocator.allocate(DEDICATED_PORT_KEYS.len(), reserved).await?;
            for (key, port) in DEDICATED_PORT_KEYS.iter().zip(ports) {
                secrets.insert((*key).into(), port.to_string());
            }
        }
    }

    Ok(secrets)
}

/// Render the env file a compose stack is launched with. Keys are emitted
/// in sorted order so re-renders of the same bundle are byte-identical.
pub fn render_env_file(project_id: &ProjectId, secrets: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    out.push_str(&format!("PROJECT_ID={project_id}\n"));
    for (key, value) in secrets {
        out.push_str(&format!("{key}={value}\n"));
    }
    out
}

/// Finds free host ports for dedicated stacks.
///
/// Ports published by containers whose stack is stopped are invisible to a
/// plain bind probe, so candidates are checked against `docker ps` output
/// first, then bind-probed, then re-checked against a fresh container
/// listing before being handed out. Callers additionally pass the ports
/// already persisted for projects whose stacks have not started yet; those
/// are invisible to both docker and the probe.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range_start: u16,
}

const PORT_RANGE_END: u16 = 65000;

impl PortAllocator {
    pub fn new(range_start: u16) -> Self {
        Self { range_start }
    }

    #[instrument(skip(self, reserved), err)]
    pub async fn allocate(&self, count: usize, reserved: &HashSet<u16>) -> Result<Vec<u16>> {
        let published = self.published_container_ports().await;
        let mut taken: HashSet<u16> = published.union(reserved).copied().collect();
        let mut ports = Vec::with_capacity(count);

        for candidate in self.range_start..=PORT_RANGE_END {
            if ports.len() == count {
                break;
            }
            if taken.contains(&candidate) || !Self::can_bind(candidate) {
                continue;
            }
            taken.insert(candidate);
            ports.push(candidate);
        }

        if ports.len() < count {
            return Err(Error::AllocationConflict {
                message: format!(
                    "exhausted port range {}..{} looking for {count} free ports",
                    self.range_start, PORT_RANGE_END
                ),
            });
        }

        // A stack may have started between the listing and the probe; take a
        // second listing and reject the block if anything now overlaps.
        let recheck = self.published_container_ports().await;
        if let Some(clash) = ports.iter().find(|p| recheck.contains(p) && !published.contains(p)) {
            return Err(Error::AllocationConflict {
                message: format!("port {clash} was claimed by another stack during allocation"),
            });
        }

        debug!(?ports, "allocated host ports");
        Ok(ports)
    }

    /// Host ports currently published by running containers. A failure to
    /// run docker degrades to an empty set; the bind probe still stands.
    async fn published_container_ports(&self) -> HashSet<u16> {
        let output = Command::new("docker")
            .args(["ps", "--format", "{{.Ports}}"])
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => parse_published_ports(&String::from_utf8_lossy(&out.stdout)),
            Ok(out) => {
                warn!(status = %out.status, "docker ps failed, falling back to bind probing only");
                HashSet::new()
            }
            Err(err) => {
                warn!(%err, "could not run docker ps, falling back to bind probing only");
                HashSet::new()
            }
        }
    }

    fn can_bind(port: u16) -> bool {
        TcpListener::bind(("0.0.0.0", port)).is_ok()
    }
}

/// Parse `docker ps --format {{.Ports}}` output into the set of published
/// host ports. Lines look like
/// `0.0.0.0:54321->5432/tcp, :::54321->5432/tcp, 8080/tcp`.
fn parse_published_ports(stdout: &str) -> HashSet<u16> {
    let mut ports = HashSet::new();
    for mapping in stdout.split(|c| c == ',' || c == '\n') {
        let mapping = mapping.trim();
        let Some((host_part, _)) = mapping.split_once("->") else {
            continue;
        };
        if let Some(port) = host_part.rsplit(':').next().and_then(|p| p.parse::<u16>().ok()) {
            ports.insert(port);
        }
    }
    ports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_and_ipv6_published_ports() {
        let stdout = "0.0.0.0:54321->5432/tcp, :::54321->5432/tcp, 8080/tcp\n0.0.0.0:8100->8000/tcp\n";
        let ports = parse_published_ports(stdout);
        assert_eq!(ports, HashSet::from([54321, 8100]));
    }

    #[test]
    fn unpublished_ports_are_ignored() {
        let ports = parse_published_ports("5432/tcp, 8080/tcp\n");
        assert!(ports.is_empty());
    }

    #[test]
    fn empty_docker_output_yields_no_ports() {
        assert!(parse_published_ports("").is_empty());
    }

    #[test]
    fn env_file_is_deterministic_and_sorted() {
        let mut secrets = BTreeMap::new();
        secrets.insert("JWT_SECRET".to_string(), "s3cret".to_string());
        secrets.insert("DB_PASSWORD".to_string(), "pw".to_string());

        let rendered = render_env_file(&"abc123".to_string(), &secrets);
        assert_eq!(rendered, "PROJECT_ID=abc123\nDB_PASSWORD=pw\nJWT_SECRET=s3cret\n");
        assert_eq!(rendered, render_env_file(&"abc123".to_string(), &secrets));
    }

    #[test]
    fn api_keys_carry_role_and_issuer() {
        let secret = "0123456789abcdef0123456789abcdef";
        let token = mint_api_key(secret, "anon").unwrap();

        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.set_issuer(&["supabase"]);
        validation.set_required_spec_claims(&["exp", "iss"]);
        let decoded = jsonwebtoken::decode::<serde_json::Value>(
            &token,
            &jsonwebtoken::DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        )
        .unwrap();

        assert_eq!(decoded.claims["role"], "anon");
        assert!(decoded.claims["exp"].as_i64().unwrap() > Utc::now().timestamp());
    }

    #[tokio::test]
    async fn shared_secrets_reference_tenant_database() {
        let allocator = PortAllocator::new(54000);
        let secrets = generate_project_secrets(
            &"deadbeef0123".to_string(),
            Placement::Shared,
            54322,
            "shared-jwt",
            &allocator,
            &HashSet::new(),
        )
        .await
        .unwrap();

        assert_eq!(secrets["POSTGRES_DB"], "project_deadbeef0123");
        assert_eq!(secrets["POSTGRES_USER"], "project_deadbeef0123_user");
        assert_eq!(secrets["DB_PORT"], "54322");
        assert_eq!(secrets["JWT_SECRET"], "shared-jwt");
        assert!(secrets.contains_key("ANON_KEY"));
        assert!(secrets.contains_key("SERVICE_ROLE_KEY"));
        assert!(!secrets.contains_key("SECRET_KEY_BASE"));
    }

    #[tokio::test]
    async fn dedicated_secrets_allocate_distinct_ports() {
        let allocator = PortAllocator::new(55000);
        let secrets = generate_project_secrets(
            &"cafebabe4567".to_string(),
            Placement::Dedicated,
            54322,
            "shared-jwt",
            &allocator,
            &HashSet::new(),
        )
        .await
        .unwrap();

        let ports: HashSet<&String> = DEDICATED_PORT_KEYS.iter().map(|k| &secrets[*k]).collect();
        assert_eq!(ports.len(), DEDICATED_PORT_KEYS.len());
        assert!(secrets.contains_key("SECRET_KEY_BASE"));
        assert_eq!(secrets["POSTGRES_DB"], "postgres");
    }

    #[tokio::test]
    async fn reserved_ports_are_never_allocated() {
        let allocator = PortAllocator::new(56200);
        let reserved: HashSet<u16> = (56200..56210).collect();

        let ports = allocator.allocate(3, &reserved).await.unwrap();
        assert!(ports.iter().all(|p| !reserved.contains(p)));
        assert!(ports.iter().all(|p| *p >= 56210));
    }
}
