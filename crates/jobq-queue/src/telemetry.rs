//! Tracing setup

/// Logging configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Filter used when RUST_LOG is unset
    pub default_filter: String,
    /// Include the event target (module path)
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_filter: "info,jobq=debug".to_string(),
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Reads JOBQ_LOG (fallback filter) and JOBQ_LOG_TARGET ("0"/"false" hides targets)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_filter: std::env::var("JOBQ_LOG").unwrap_or(defaults.default_filter),
            with_target: std::env::var("JOBQ_LOG_TARGET")
                .map(|v| v != "0" && v != "false")
                .unwrap_or(defaults.with_target),
        }
    }
}

/// Install the global subscriber. Returns false if one was already set.
pub fn init_tracing(config: &TelemetryConfig) -> bool {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(config.with_target)
        .with_level(true)
        .with_thread_ids(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config_default() {
        let config = TelemetryConfig::default();
        assert_eq!(config.default_filter, "info,jobq=debug");
        assert!(config.with_target);
    }

    #[test]
    fn test_second_init_is_rejected() {
        let config = TelemetryConfig::default();
        init_tracing(&config);
        assert!(!init_tracing(&config));
    }
}
