//! Database record models matching table schemas.
//!
//! Each struct here corresponds to a control-plane table row and derives
//! `sqlx::FromRow` for query results. Status and strategy enums map to
//! PostgreSQL enum types created by the migrations.

pub mod clusters;
pub mod plans;
pub mod projects;
pub mod secrets;
