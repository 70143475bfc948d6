//! Tracing setup.

use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize tracing-subscriber with console output.
///
/// Log levels come from `RUST_LOG`, defaulting to `info`. Every lifecycle
/// and repository operation is instrumented with `project_id` / `cluster_id`
/// fields, so a single grep over the output follows one project end to end.
pub fn init_telemetry() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    info!("Telemetry initialized");
    Ok(())
}
