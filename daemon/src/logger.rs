use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

// Log to the terminal, the level is taken from RUST_LOG when it is set
pub fn init_logging() {
    let level = if cfg!(debug_assertions) { "trace" } else { "info" };

    let (filter, from_env) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (EnvFilter::new(level), false),
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    // Only visible once the subscriber is installed
    if !from_env {
        info!("\"RUST_LOG\" variable not set, defaulting to {level}");
    }
}
