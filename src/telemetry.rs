use crate::config::Config;
use anyhow::Result;
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::runtime::Tokio;
use opentelemetry_sdk::trace::{Config as OTelTraceConfig, Sampler};
use opentelemetry_sdk::Resource;
use prometheus::{Encoder, Registry, TextEncoder};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Process-wide observability context: log subscriber, optional OTLP trace
/// pipeline, and the metrics exporter. Initialized once before the first
/// cycle and shut down once after the loop exits.
pub struct Telemetry {
    meter_provider: Option<SdkMeterProvider>,
    tracing_enabled: bool,
}

impl Telemetry {
    pub async fn init(config: &Config) -> Result<Self> {
        let resource = Resource::new(vec![
            KeyValue::new("service.name", config.tracing_service.clone()),
            KeyValue::new("service.version", config.tracing_version.clone()),
        ]);

        init_subscriber(config, resource.clone())?;

        let meter_provider = if config.metrics_enabled {
            Some(init_metrics(config, resource).await?)
        } else {
            None
        };

        Ok(Self {
            meter_provider,
            tracing_enabled: config.tracing_enabled,
        })
    }

    pub fn shutdown(self) {
        if self.tracing_enabled {
            opentelemetry::global::shutdown_tracer_provider();
        }
        if let Some(provider) = self.meter_provider {
            if let Err(err) = provider.shutdown() {
                tracing::warn!(error = %err, "failed to shut down meter provider");
            }
        }
    }
}

fn init_subscriber(config: &Config, resource: Resource) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| "error".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if config.tracing_enabled {
        let mut exporter = opentelemetry_otlp::new_exporter().http();
        if let Some(endpoint) = normalize_otlp_http_endpoint(config.otlp_endpoint.as_deref()) {
            exporter = exporter.with_endpoint(endpoint);
        }
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(
                OTelTraceConfig::default()
                    .with_sampler(Sampler::TraceIdRatioBased(config.tracing_sample_rate))
                    .with_resource(resource),
            )
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

async fn init_metrics(config: &Config, resource: Resource) -> Result<SdkMeterProvider> {
    // LOCAL switches the exporter from the scrape endpoint to OTLP push.
    if config.local {
        let mut exporter = opentelemetry_otlp::new_exporter().tonic();
        if let Some(endpoint) = config.otlp_endpoint.as_deref() {
            exporter = exporter.with_endpoint(endpoint.to_string());
        }
        let provider = opentelemetry_otlp::new_pipeline()
            .metrics(Tokio)
            .with_exporter(exporter)
            .with_resource(resource)
            .build()?;
        opentelemetry::global::set_meter_provider(provider.clone());
        return Ok(provider);
    }

    let registry = Registry::new();
    let reader = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();
    opentelemetry::global::set_meter_provider(provider.clone());

    let app = Router::new()
        .route("/metrics", get(serve_metrics))
        .with_state(registry);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.metrics_port)).await?;
    tracing::info!(port = config.metrics_port, "metrics endpoint listening");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(error = %err, "metrics server exited");
        }
    });

    Ok(provider)
}

async fn serve_metrics(State(registry): State<Registry>) -> String {
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %err, "failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

fn normalize_otlp_http_endpoint(endpoint: Option<&str>) -> Option<String> {
    let trimmed = endpoint?.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.contains("/v1/traces") {
        return Some(trimmed.to_string());
    }
    Some(format!("{}/v1/traces", trimmed.trim_end_matches('/')))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_otlp_endpoint() {
        assert_eq!(normalize_otlp_http_endpoint(None), None);
        assert_eq!(normalize_otlp_http_endpoint(Some("  ")), None);
        assert_eq!(
            normalize_otlp_http_endpoint(Some("http://otel:4318")),
            Some("http://otel:4318/v1/traces".to_string())
        );
        assert_eq!(
            normalize_otlp_http_endpoint(Some("http://otel:4318/")),
            Some("http://otel:4318/v1/traces".to_string())
        );
        assert_eq!(
            normalize_otlp_http_endpoint(Some("http://otel:4318/v1/traces")),
            Some("http://otel:4318/v1/traces".to_string())
        );
    }
}
