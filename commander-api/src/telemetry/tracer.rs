//! Tracing subscriber initialization.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{ApiError, ApiResult};

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: String,
    /// Environment (production, development)
    pub environment: String,
    /// Emit JSON lines; otherwise human-readable output.
    pub json: bool,
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: std::env::var("COMMANDER_SERVICE_NAME")
                .unwrap_or_else(|_| "commander-api".to_string()),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: std::env::var("COMMANDER_ENVIRONMENT")
                .unwrap_or_else(|_| "development".to_string()),
            json: std::env::var("COMMANDER_LOG_FORMAT")
                .map(|s| s != "pretty")
                .unwrap_or(true),
            default_filter: "commander_api=debug,commander_storage=info,commander_agents=info,tower_http=info,info"
                .to_string(),
        }
    }
}

/// Install the global subscriber. Call once, before anything logs.
pub fn init_tracer(config: &TelemetryConfig) -> ApiResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    result.map_err(|e| ApiError::internal_error(format!("Failed to init subscriber: {}", e)))?;

    tracing::info!(
        service_name = %config.service_name,
        service_version = %config.service_version,
        environment = %config.environment,
        "Telemetry initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_covers_workspace_crates() {
        let config = TelemetryConfig {
            json: true,
            ..TelemetryConfig::default()
        };
        assert!(config.default_filter.contains("commander_api"));
        assert!(config.default_filter.contains("commander_storage"));
        assert!(EnvFilter::try_new(&config.default_filter).is_ok());
    }

    #[test]
    fn test_second_init_fails_cleanly() {
        let config = TelemetryConfig::default();
        let _ = init_tracer(&config);
        assert!(init_tracer(&config).is_err());
    }
}
