//! Repository implementations for the control-plane tables.
//!
//! Each repository wraps a `&mut PgConnection` so callers decide the
//! transaction boundary: one transaction per lifecycle state transition,
//! committed only after the corresponding external side effect has
//! observably succeeded.

mod clusters;
mod entitlements;
mod projects;
mod secrets;

pub use clusters::Clusters;
pub use entitlements::Entitlements;
pub use projects::Projects;
pub use secrets::Secrets;
