//! Structured logging.
//!
//! - JSON format for production
//! - Pretty and compact formats for development
//! - Per-module log levels layered onto an `EnvFilter`
//! - An optional OpenTelemetry layer for span export

use opentelemetry_sdk::trace::Tracer;
use serde::Deserialize;
use std::collections::HashMap;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Global level or full filter directive (`info`, `tenantguard_core=debug,info`)
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Per-module log levels
    #[serde(default)]
    pub module_levels: HashMap<String, String>,

    /// Include file/line information
    #[serde(default)]
    pub include_location: bool,

    #[serde(default = "default_include_target")]
    pub include_target: bool,

    /// Emit an event when spans close (carries the span's duration)
    #[serde(default)]
    pub span_close_events: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            module_levels: HashMap::new(),
            include_location: false,
            include_target: default_include_target(),
            span_close_events: false,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    Compact,
}

fn default_log_level() -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
}

fn default_include_target() -> bool {
    true
}

/// Build the filter from the global level plus per-module overrides.
pub fn build_filter(config: &LoggingConfig) -> anyhow::Result<EnvFilter> {
    let mut filter = EnvFilter::try_new(&config.level)?;
    for (module, level) in &config.module_levels {
        filter = filter.add_directive(format!("{}={}", module, level).parse()?);
    }
    Ok(filter)
}

/// Install the global subscriber.
///
/// In `development` a JSON default is swapped for pretty output; an explicit
/// `compact` is honoured everywhere.
pub fn init_logging(
    config: &LoggingConfig,
    environment: &str,
    tracer: Option<Tracer>,
) -> anyhow::Result<()> {
    let filter = build_filter(config)?;

    let format = if environment == "development" && config.format == LogFormat::Json {
        &LogFormat::Pretty
    } else {
        &config.format
    };

    let span_events = if config.span_close_events {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let otel_layer = tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

    match format {
        LogFormat::Json => {
            let fmt_layer = fmt::layer()
                .json()
                .with_span_events(span_events)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_target(config.include_target);

            tracing_subscriber::registry()
                .with(otel_layer)
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .pretty()
                .with_span_events(span_events)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_target(config.include_target);

            tracing_subscriber::registry()
                .with(otel_layer)
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
        LogFormat::Compact => {
            let fmt_layer = fmt::layer()
                .compact()
                .with_span_events(span_events)
                .with_target(config.include_target);

            tracing_subscriber::registry()
                .with(otel_layer)
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_config_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.include_target);
        assert!(!config.span_close_events);
    }

    #[test]
    fn test_build_filter_with_module_levels() {
        let mut config = LoggingConfig {
            level: "warn".into(),
            ..LoggingConfig::default()
        };
        config
            .module_levels
            .insert("tenantguard_core::audit".into(), "debug".into());
        let filter = build_filter(&config).unwrap();
        let rendered = filter.to_string();
        assert!(rendered.contains("tenantguard_core::audit=debug"));
        assert!(rendered.contains("warn"));
    }

    #[test]
    fn test_build_filter_rejects_garbage() {
        let config = LoggingConfig {
            level: "info".into(),
            module_levels: HashMap::from([("a".to_string(), "loud".to_string())]),
            ..LoggingConfig::default()
        };
        assert!(build_filter(&config).is_err());
    }
}
