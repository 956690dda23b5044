//! OpenTelemetry trace export.
//!
//! Export is off unless an OTLP endpoint is configured. When it is on, the
//! returned tracer is attached to the subscriber as a
//! `tracing-opentelemetry` layer by [`init_logging`](super::init_logging).

use opentelemetry::trace::TraceContextExt;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{self as sdktrace, Sampler, Tracer};
use opentelemetry_sdk::Resource;
use serde::Deserialize;
use std::collections::HashMap;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Trace export configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TracingConfig {
    /// OTLP gRPC endpoint, e.g. `http://otel-collector:4317`.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,

    /// Sampling strategy
    #[serde(default)]
    pub sampling: SamplingStrategy,

    /// Ratio for ratio-based sampling (0.0 to 1.0)
    #[serde(default = "default_sample_ratio")]
    pub sample_ratio: f64,

    /// Extra resource attributes
    #[serde(default)]
    pub resource_attributes: HashMap<String, String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            sampling: SamplingStrategy::default(),
            sample_ratio: default_sample_ratio(),
            resource_attributes: HashMap::new(),
        }
    }
}

impl TracingConfig {
    pub fn is_enabled(&self) -> bool {
        self.otlp_endpoint
            .as_deref()
            .is_some_and(|endpoint| !endpoint.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    AlwaysOn,
    AlwaysOff,
    TraceIdRatio,
    /// Follow the parent's decision, ratio-sample roots
    #[default]
    ParentBased,
}

fn default_sample_ratio() -> f64 {
    1.0
}

/// Build the OTLP pipeline. Returns `None` when export is disabled.
pub fn init_tracing(
    config: &TracingConfig,
    service_name: &str,
    environment: &str,
) -> anyhow::Result<Option<Tracer>> {
    let Some(endpoint) = config.otlp_endpoint.as_deref().filter(|_| config.is_enabled()) else {
        return Ok(None);
    };

    let mut resource_attrs = vec![
        opentelemetry::KeyValue::new("service.name", service_name.to_string()),
        opentelemetry::KeyValue::new("service.version", env!("CARGO_PKG_VERSION").to_string()),
        opentelemetry::KeyValue::new("deployment.environment", environment.to_string()),
    ];
    for (key, value) in &config.resource_attributes {
        resource_attrs.push(opentelemetry::KeyValue::new(key.clone(), value.clone()));
    }

    let sampler = match config.sampling {
        SamplingStrategy::AlwaysOn => Sampler::AlwaysOn,
        SamplingStrategy::AlwaysOff => Sampler::AlwaysOff,
        SamplingStrategy::TraceIdRatio => Sampler::TraceIdRatioBased(config.sample_ratio),
        SamplingStrategy::ParentBased => {
            Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(config.sample_ratio)))
        }
    };

    let trace_config = sdktrace::Config::default()
        .with_resource(Resource::new(resource_attrs))
        .with_sampler(sampler);

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(trace_config)
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    opentelemetry::global::set_text_map_propagator(
        opentelemetry_sdk::propagation::TraceContextPropagator::new(),
    );

    Ok(Some(tracer))
}

/// Flush remaining spans.
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// Accessors for the active trace.
pub struct TraceContext;

impl TraceContext {
    /// Trace id of the current `tracing` span, when it is exported.
    pub fn current_trace_id() -> Option<String> {
        let ctx = ::tracing::Span::current().context();
        let span = ctx.span();
        let span_ctx = span.span_context();

        span_ctx
            .is_valid()
            .then(|| span_ctx.trace_id().to_string())
    }
}
