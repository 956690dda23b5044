//! Prometheus metrics.
//!
//! Call sites record through the `metrics` macros; this module installs the
//! Prometheus recorder, registers descriptions, and hands out a
//! [`MetricsRegistry`] that renders the text exposition for `GET /metrics`.

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Buckets for `tenantguard_evaluation_duration_seconds`. Decisions are
    /// expected well under a millisecond when relations are in memory.
    #[serde(default = "default_evaluation_buckets")]
    pub evaluation_buckets: Vec<f64>,

    /// Labels added to every series
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            evaluation_buckets: default_evaluation_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_evaluation_buckets() -> Vec<f64> {
    vec![
        0.00005, 0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1,
    ]
}

/// Handle for rendering the exposition.
#[derive(Clone)]
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry that renders nothing.
    pub fn disabled() -> Self {
        Self {
            prometheus_handle: None,
        }
    }

    /// A recorder that is not installed globally. Renders only what is
    /// recorded through it directly, which for tests is an empty exposition.
    pub fn detached() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        Self {
            prometheus_handle: Some(recorder.handle()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Install the global Prometheus recorder.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new().add_global_label("service", service_name);
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder = builder.set_buckets_for_metric(
        Matcher::Full("tenantguard_evaluation_duration_seconds".to_string()),
        &config.evaluation_buckets,
    )?;

    let handle = builder.install_recorder()?;
    register_metric_descriptions();

    tracing::info!(service_name = %service_name, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    // Decisions
    describe_counter!(
        "tenantguard_decisions_total",
        "Access decisions by outcome and reason code"
    );
    describe_histogram!(
        "tenantguard_evaluation_duration_seconds",
        Unit::Seconds,
        "Time to reach an access decision"
    );
    describe_counter!(
        "tenantguard_ownership_timeouts_total",
        "Ownership lookups that exceeded their deadline"
    );
    describe_counter!(
        "tenantguard_ownership_failures_total",
        "Ownership lookups that failed"
    );

    // Policy
    describe_gauge!("tenantguard_policy_version", "Version of the live policy");
    describe_counter!(
        "tenantguard_policy_reloads_total",
        "Policy reload attempts by outcome"
    );

    // Audit
    describe_gauge!(
        "tenantguard_audit_queue_depth",
        "Audit records waiting to be written"
    );
    describe_counter!(
        "tenantguard_audit_dropped_total",
        "Audit records dropped before reaching the sink"
    );
    describe_counter!(
        "tenantguard_audit_written_total",
        "Audit records written to the sink"
    );
    describe_counter!(
        "tenantguard_audit_sink_failures_total",
        "Failed audit batch writes"
    );
    describe_counter!(
        "tenantguard_audit_backlog_alerts_total",
        "Times the audit backlog stayed above threshold"
    );

    // Auth and errors
    describe_counter!(
        "tenantguard_auth_failures_total",
        "Credential resolution failures by error code"
    );
    describe_counter!(
        "tenantguard_errors_total",
        "Errors by code, category and severity"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_config_defaults() {
        let config = MetricsConfig::default();
        assert!(config.enabled);
        assert!(config.evaluation_buckets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_disabled_registry_renders_nothing() {
        let registry = MetricsRegistry::disabled();
        assert!(!registry.is_enabled());
        assert!(registry.render().is_empty());
    }

    #[test]
    fn test_disabled_config_skips_install() {
        let config = MetricsConfig {
            enabled: false,
            ..MetricsConfig::default()
        };
        let registry = init_metrics(&config, "tenantguard").unwrap();
        assert!(!registry.is_enabled());
    }
}
