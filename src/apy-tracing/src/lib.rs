use anyhow::{Context, Result};
use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::{Protocol, WithExportConfig};
use opentelemetry_sdk::{Resource, trace as sdktrace};
use std::borrow::Cow;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::{Registry, prelude::*};

/// Keeps the tracer provider alive; flushes and shuts it down on drop.
#[must_use = "dropping the guard stops span export"]
pub struct TracingGuard {
    provider: Option<sdktrace::SdkTracerProvider>,
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("tracer provider shutdown failed: {e}");
            }
        }
    }
}

/// Install the global subscriber.
///
/// `log_level` is an `EnvFilter` directive (`info`, `apy_core=debug,warn`, ...)
/// and is overridden by `RUST_LOG` when set. `log_format` picks the fmt layer:
/// `json`, `pretty`, anything else is plain text. Spans are exported over
/// OTLP/HTTP only when `otlp_endpoint` is non-empty.
pub fn init(
    service_name: &str,
    otlp_endpoint: Option<&str>,
    log_level: &str,
    log_format: &str,
) -> Result<TracingGuard> {
    let filter = filter_for(log_level, std::env::var("RUST_LOG").ok().as_deref());

    let fmt_layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = match log_format {
        "json" => Box::new(
            fmt::layer()
                .json()
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_filter(filter),
        ),
        "pretty" => Box::new(fmt::layer().pretty().with_filter(filter)),
        _ => Box::new(fmt::layer().with_filter(filter)),
    };

    let provider = match otlp_endpoint.filter(|e| !e.trim().is_empty()) {
        Some(endpoint) => Some(otlp_provider(service_name, endpoint)?),
        None => None,
    };
    let otel_layer = provider
        .as_ref()
        .map(|p| OpenTelemetryLayer::new(p.tracer(Cow::Owned(service_name.to_string()))));

    let subscriber = Registry::default().with(fmt_layer).with(otel_layer);
    tracing::subscriber::set_global_default(subscriber).context("install tracing subscriber")?;

    Ok(TracingGuard { provider })
}

/// Stderr subscriber for the stretch before [`init`] runs, so warnings raised
/// while the config itself is loaded are not lost. Meant for
/// `tracing::subscriber::with_default`.
pub fn bootstrap_subscriber() -> impl tracing::Subscriber + Send + Sync {
    fmt::Subscriber::builder()
        .with_env_filter(filter_for("warn", std::env::var("RUST_LOG").ok().as_deref()))
        .with_writer(std::io::stderr)
        .finish()
}

fn otlp_provider(service_name: &str, endpoint: &str) -> Result<sdktrace::SdkTracerProvider> {
    let resource = Resource::builder()
        .with_service_name(Cow::Owned(service_name.to_string()))
        .with_attributes(vec![KeyValue::new(
            "service.version",
            env!("CARGO_PKG_VERSION"),
        )])
        .build();

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .with_context(|| format!("build otlp exporter for {endpoint}"))?;

    Ok(sdktrace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build())
}

/// `RUST_LOG` wins over the configured level; an unparsable directive
/// falls back to `info`.
fn filter_for(configured: &str, env: Option<&str>) -> EnvFilter {
    env.filter(|v| !v.trim().is_empty())
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_new(configured).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}
