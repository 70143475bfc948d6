//! Common identifier types shared across the orchestrator.
//!
//! Projects and clusters use short, human-pasteable string identifiers
//! (`a1b2c3d4e5f6`, `global-shared`, `private-<org>-<suffix>`) because they leak
//! into database names, container names and remote platform resource names,
//! all of which have stricter character rules than a UUID. Organizations are
//! plain UUIDs.

use rand::Rng;
use uuid::Uuid;

pub type OrgId = Uuid;
pub type ProjectId = String;
pub type ClusterId = String;

/// Identifier of the single global shared cluster row.
pub const GLOBAL_CLUSTER_ID: &str = "global-shared";

/// Mint a fresh project identifier: 12 lowercase hex characters.
///
/// Short enough to embed in `project_{id}` database names and
/// `project-{id}` remote resource names, long enough (48 bits) that
/// collisions are not a practical concern at control-plane scale.
pub fn new_project_id() -> ProjectId {
    let bytes: [u8; 6] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Mint an identifier for a private cluster owned by `org_id`.
pub fn new_private_cluster_id(org_id: &OrgId) -> ClusterId {
    let bytes: [u8; 3] = rand::thread_rng().gen();
    let suffix: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("private-{org_id}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_ids_are_twelve_hex_chars() {
        let id = new_project_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn private_cluster_ids_embed_the_org() {
        let org = Uuid::new_v4();
        let id = new_private_cluster_id(&org);
        assert!(id.starts_with(&format!("private-{org}-")));
    }
}
