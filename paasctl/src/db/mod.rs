//! Database access layer: models, repositories and error categorization.

pub mod errors;
pub mod handlers;
pub mod models;

pub use errors::DbError;
