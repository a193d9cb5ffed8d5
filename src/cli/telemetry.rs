//! Structured logging for portier, with optional OTLP trace export.
//!
//! Logs are JSON lines on stdout. Spans (login, refresh, store calls, the
//! per-request `http` span) are additionally shipped to an OTLP/gRPC collector
//! once `OTEL_EXPORTER_OTLP_ENDPOINT` is set. The exporter honours the usual
//! `OTEL_EXPORTER_OTLP_HEADERS` and `OTEL_SERVICE_INSTANCE_ID` variables.

use anyhow::{anyhow, Context, Result};
use base64ct::{Base64, Encoding};
use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry::{global, trace::TracerProvider as _, KeyValue};
use opentelemetry_otlp::{Compression, WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::{
    propagation::{BaggagePropagator, TraceContextPropagator},
    trace::{SdkTracerProvider, Tracer},
    Resource,
};
use std::{env, sync::OnceLock, time::Duration};
use tonic::metadata::{Ascii, Binary, MetadataKey, MetadataMap, MetadataValue};
use tracing::{debug, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};
use ulid::Ulid;

const ENDPOINT_VAR: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
const HEADERS_VAR: &str = "OTEL_EXPORTER_OTLP_HEADERS";
const PROTOCOL_VAR: &str = "OTEL_EXPORTER_OTLP_PROTOCOL";
const INSTANCE_VAR: &str = "OTEL_SERVICE_INSTANCE_ID";

const SERVICE_NAMESPACE: &str = "portier";
const EXPORT_TIMEOUT: Duration = Duration::from_secs(3);

/// Noisy dependencies, capped regardless of `-v`.
const QUIET_TARGETS: [&str; 5] = [
    "hyper=error",
    "tokio=error",
    "tower_http=warn",
    "sqlx=warn",
    "opentelemetry_sdk=warn",
];

static PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// `key=value` pairs separated by commas. Entries without `=` are dropped.
fn header_pairs(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|entry| {
            let (name, value) = entry.split_once('=')?;
            let name = name.trim().to_ascii_lowercase();
            (!name.is_empty()).then(|| (name, value.trim().to_string()))
        })
        .collect()
}

/// gRPC metadata for the exporter; `-bin` keys carry base64 payloads.
fn exporter_metadata(pairs: &[(String, String)]) -> Result<MetadataMap> {
    let mut metadata = MetadataMap::with_capacity(pairs.len());
    for (name, value) in pairs {
        if name.ends_with("-bin") {
            let key = MetadataKey::<Binary>::from_bytes(name.as_bytes())
                .map_err(|e| anyhow!("bad exporter header name {name}: {e}"))?;
            let bytes = Base64::decode_vec(value)
                .map_err(|e| anyhow!("exporter header {name} is not base64: {e}"))?;
            metadata.insert_bin(key, MetadataValue::from_bytes(&bytes));
        } else {
            let key = MetadataKey::<Ascii>::from_bytes(name.as_bytes())
                .map_err(|e| anyhow!("bad exporter header name {name}: {e}"))?;
            let value: MetadataValue<Ascii> = value
                .parse()
                .map_err(|e| anyhow!("exporter header {name} has a non-ASCII value: {e}"))?;
            metadata.insert(key, value);
        }
    }
    Ok(metadata)
}

/// Collector address with a scheme; bare `host:port` means TLS.
fn collector_endpoint(raw: &str) -> String {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("https://{}", raw.trim_end_matches('/'))
    }
}

fn resource(instance_id: String) -> Resource {
    Resource::builder_empty()
        .with_attributes([
            KeyValue::new("service.name", env!("CARGO_PKG_NAME")),
            KeyValue::new("service.namespace", SERVICE_NAMESPACE),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("service.instance.id", instance_id),
        ])
        .build()
}

fn start_exporter(endpoint: &str) -> Result<Tracer> {
    if let Ok(protocol) = env::var(PROTOCOL_VAR) {
        if protocol != "grpc" {
            debug!(protocol, "only grpc export is supported, ignoring {PROTOCOL_VAR}");
        }
    }

    let mut exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(collector_endpoint(endpoint))
        .with_compression(Compression::Gzip)
        .with_timeout(EXPORT_TIMEOUT);
    let headers = env::var(HEADERS_VAR).map(|raw| header_pairs(&raw)).unwrap_or_default();
    if !headers.is_empty() {
        exporter = exporter.with_metadata(exporter_metadata(&headers)?);
    }
    let exporter = exporter.build().context("failed to build the span exporter")?;

    let instance_id = env::var(INSTANCE_VAR).unwrap_or_else(|_| Ulid::new().to_string());
    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource(instance_id))
        .build();

    global::set_tracer_provider(provider.clone());
    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ]));
    let tracer = provider.tracer(SERVICE_NAMESPACE);
    let _ = PROVIDER.set(provider);
    Ok(tracer)
}

fn filter(level: Level) -> Result<EnvFilter> {
    let mut filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    for directive in QUIET_TARGETS {
        filter = filter.add_directive(directive.parse()?);
    }
    Ok(filter)
}

/// Install the global subscriber. `None` logs errors only.
///
/// # Errors
/// The exporter cannot be built or a subscriber is already installed.
pub fn init(verbosity_level: Option<Level>) -> Result<()> {
    let json = fmt::layer()
        .json()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false);
    let filter = filter(verbosity_level.unwrap_or(Level::ERROR))?;

    match env::var(ENDPOINT_VAR) {
        Ok(endpoint) => {
            let traces = tracing_opentelemetry::layer().with_tracer(start_exporter(&endpoint)?);
            tracing::subscriber::set_global_default(
                Registry::default().with(json).with(traces).with(filter),
            )?;
        }
        Err(_) => {
            tracing::subscriber::set_global_default(Registry::default().with(json).with(filter))?;
        }
    }
    Ok(())
}

/// Flush buffered spans before exit. Does nothing when export is off.
pub fn shutdown_tracer() {
    if let Some(provider) = PROVIDER.get() {
        debug!("flushing spans");
        if let Err(err) = provider.shutdown() {
            eprintln!("span export shutdown failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_pairs_skip_malformed_entries() {
        assert!(header_pairs("").is_empty());

        let pairs = header_pairs("X-Tenant = portier ,garbage, authorization=Bearer a=b");
        assert_eq!(
            pairs,
            vec![
                ("x-tenant".to_string(), "portier".to_string()),
                ("authorization".to_string(), "Bearer a=b".to_string()),
            ]
        );
    }

    #[test]
    fn exporter_metadata_decodes_binary_keys() -> Result<()> {
        let pairs = header_pairs("x-tenant=portier,trace-bin=cG9ydGllcg==");
        let metadata = exporter_metadata(&pairs)?;
        assert_eq!(metadata.len(), 2);
        assert_eq!(
            metadata.get("x-tenant").and_then(|v| v.to_str().ok()),
            Some("portier")
        );
        Ok(())
    }

    #[test]
    fn exporter_metadata_rejects_bad_base64() {
        let pairs = vec![("trace-bin".to_string(), "%%%".to_string())];
        let err = exporter_metadata(&pairs).err().map(|e| e.to_string());
        assert!(err.is_some_and(|e| e.contains("is not base64")));
    }

    #[test]
    fn bare_collector_address_defaults_to_tls() {
        assert_eq!(collector_endpoint("http://localhost:4317"), "http://localhost:4317");
        assert_eq!(
            collector_endpoint("otel.internal:4317/"),
            "https://otel.internal:4317"
        );
    }

    #[test]
    fn quiet_targets_parse() -> Result<()> {
        filter(Level::DEBUG)?;
        Ok(())
    }

    #[test]
    fn shutdown_without_exporter_is_a_no_op() {
        shutdown_tracer();
    }
}
