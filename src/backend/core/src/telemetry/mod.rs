//! Telemetry: logging, tracing and metrics.
//!
//! - **Logging**: structured JSON/pretty/compact output through `tracing-subscriber`
//! - **Tracing**: optional OTLP span export
//! - **Metrics**: Prometheus exposition of the `tenantguard_*` series
//!
//! # Example
//!
//! ```rust,no_run
//! use tenantguard_core::telemetry::{init_telemetry, TelemetryConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let handle = init_telemetry(&TelemetryConfig::default())?;
//! // ... serve ...
//! handle.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod logging;
pub mod metrics;
pub mod tracing;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{init_metrics, MetricsConfig, MetricsRegistry};
pub use tracing::{init_tracing, shutdown_tracing, SamplingStrategy, TraceContext, TracingConfig};

use serde::Deserialize;

/// Unified telemetry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// development, staging, production
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub tracing: TracingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            environment: default_environment(),
            logging: LoggingConfig::default(),
            tracing: TracingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

fn default_service_name() -> String {
    "tenantguard".to_string()
}

fn default_environment() -> String {
    "production".to_string()
}

/// Initialize metrics, trace export and logging, in that order.
///
/// Call once at startup, from inside the Tokio runtime when trace export is
/// configured.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<TelemetryHandle> {
    let metrics = init_metrics(&config.metrics, &config.service_name)?;
    let tracer = init_tracing(&config.tracing, &config.service_name, &config.environment)?;
    let exporting = tracer.is_some();

    init_logging(&config.logging, &config.environment, tracer)?;

    ::tracing::info!(
        service_name = %config.service_name,
        environment = %config.environment,
        trace_export = exporting,
        metrics = metrics.is_enabled(),
        "Telemetry initialized"
    );

    Ok(TelemetryHandle { metrics, exporting })
}

/// Telemetry lifecycle handle.
#[derive(Debug)]
pub struct TelemetryHandle {
    pub metrics: MetricsRegistry,
    exporting: bool,
}

impl TelemetryHandle {
    /// Flush spans. Metrics need no shutdown.
    pub fn shutdown(self) {
        if self.exporting {
            shutdown_tracing();
        }
        ::tracing::info!("Telemetry shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "tenantguard");
        assert_eq!(config.environment, "production");
        assert!(!config.tracing.is_enabled());
    }

    #[test]
    fn test_telemetry_config_from_toml() {
        let config: TelemetryConfig = toml::from_str(
            r#"
            environment = "staging"

            [logging]
            format = "compact"
            level = "debug"

            [tracing]
            otlp_endpoint = "http://collector:4317"
            sampling = "trace_id_ratio"
            sample_ratio = 0.25
            "#,
        )
        .unwrap();

        assert_eq!(config.service_name, "tenantguard");
        assert_eq!(config.logging.format, LogFormat::Compact);
        assert!(config.tracing.is_enabled());
        assert_eq!(config.tracing.sampling, SamplingStrategy::TraceIdRatio);
    }
}
