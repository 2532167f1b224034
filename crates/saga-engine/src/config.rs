//! Orchestrator configuration loaded from environment variables.

/// Orchestrator configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `SAGA_CONCURRENCY_RETRIES` — how often a step or compensate message is
///   reloaded and rerun after a stale save (default: `0`, the caller retries)
/// - `RUST_LOG` — tracing filter directive (default: `"info"`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub concurrency_retries: u32,
    pub log_level: String,
}

impl OrchestratorConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            concurrency_retries: lookup("SAGA_CONCURRENCY_RETRIES")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.concurrency_retries),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
        }
    }

    /// Sets the number of engine-side reruns after a concurrency conflict.
    pub fn with_concurrency_retries(mut self, retries: u32) -> Self {
        self.concurrency_retries = retries;
        self
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency_retries: 0,
            log_level: "info".to_string(),
        }
    }
}
