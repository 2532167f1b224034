//! Tracing subscriber setup for hosts embedding the engine.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::OrchestratorConfig;

/// Installs a global fmt subscriber filtered by `config.log_level`.
///
/// `RUST_LOG` wins when set. Returns false if a global subscriber was
/// already installed, which makes repeated calls from tests harmless.
pub fn init_tracing(config: &OrchestratorConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
