mod config;
mod convert;
mod line_protocol;
mod mqtt;
mod pipeline;
mod retention;
mod store;

use crate::config::Config;
use crate::convert::Converter;
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::store::InfluxClient;
use anyhow::{Context, Result};
use rolling_file::{BasicRollingFileAppender, RollingConditionBasic};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::{Filtered, LevelFilter};
use tracing_subscriber::fmt::{
    self,
    format::{DefaultFields, Format},
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const ERROR_LOG_MAX_BYTES: u64 = 200 * 1024;
const ERROR_LOG_BACKUPS: usize = 10;

type ErrorLogLayer<S> = Filtered<fmt::Layer<S, DefaultFields, Format, NonBlocking>, LevelFilter, S>;

/// Returns the error log flush guard, which must live until exit.
fn init_tracing(config: &Config) -> Result<Option<WorkerGuard>> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,ppmp_connector=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    let (error_layer, guard) = match &config.error_log_path {
        Some(path) => {
            let (writer, guard) = error_log_writer(path)?;
            (Some(error_log_layer(writer)), Some(guard))
        }
        None => (None, None),
    };

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let endpoint = normalize_otlp_http_endpoint(endpoint);
            let exporter = opentelemetry_otlp::new_exporter()
                .http()
                .with_endpoint(endpoint);
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                    KeyValue::new("service.name", "ppmp-connector"),
                ])))
                .install_batch(Tokio)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(error_layer)
        .with(otel_layer)
        .try_init()?;

    Ok(guard)
}

/// Size-rotated file (`path`, `path.1` .. `path.10`) behind a non-blocking writer.
fn error_log_writer(path: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    }
    let appender = BasicRollingFileAppender::new(
        path,
        RollingConditionBasic::new().max_size(ERROR_LOG_MAX_BYTES),
        ERROR_LOG_BACKUPS,
    )
    .with_context(|| format!("failed to open error log {}", path.display()))?;
    Ok(tracing_appender::non_blocking(appender))
}

fn error_log_layer<S>(writer: NonBlocking) -> ErrorLogLayer<S>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_filter(LevelFilter::ERROR)
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    let _error_log_guard = init_tracing(&config)?;

    tracing::info!(
        topic = %config.mqtt.topic_filter(),
        broker = %format!("{}:{}", config.mqtt.host, config.mqtt.port),
        database = %config.influx.database,
        batch_size = config.batch_size,
        flush_interval_ms = config.flush_interval_ms,
        "starting ppmp-connector"
    );
    // Filters are carried for configuration compatibility; conversion does not consult them.
    if !config.measurement_filters.is_empty() {
        tracing::info!(filters = ?config.measurement_filters, "measurement filters configured");
    }

    let store = InfluxClient::new(&config.influx)?;
    tracing::info!(url = %store.base_url(), "using InfluxDB");
    let outcome = retention::reconcile(&store, &config.retention).await;
    tracing::debug!(?outcome, "retention reconciliation finished");

    let cancel = CancellationToken::new();
    let mut pipeline = Pipeline::start(
        store,
        Converter::new(),
        PipelineSettings {
            flush_count: config.batch_size,
            flush_interval: config.flush_interval(),
        },
        cancel.clone(),
    );
    let mqtt_settings = config.mqtt.clone();
    pipeline.spawn_source(move |ingest, cancel| mqtt::run_listener(mqtt_settings, ingest, cancel));

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(err) = res {
                tracing::warn!(error=%err, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown signal received");
        }
        _ = cancel.cancelled() => {}
    }

    pipeline.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn error_log_keeps_only_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("ppmp-connector.log");
        let (writer, guard) = error_log_writer(&path).unwrap();
        let subscriber = tracing_subscriber::registry().with(error_log_layer(writer));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("InfluxDB batch size: 3, wrote 3 entries/sec");
            tracing::error!(len = 3, "failed to write batch; dropping it");
        });
        drop(guard);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("ERROR"));
        assert!(contents.contains("failed to write batch"));
        assert!(!contents.contains("entries/sec"));
    }

    #[test]
    fn otlp_endpoint_gets_traces_path() {
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/v1/traces"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(normalize_otlp_http_endpoint("  "), "");
    }
}
