use std::path::Path;

use metrics_exporter_prometheus::Matcher;
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_exporter_prometheus::PrometheusHandle;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

use crate::config::LogFormat;
use crate::config::LoggerConfig;

/// Prometheus default histogram buckets, in seconds.
const DURATION_SECONDS_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Debug, thiserror::Error)]
pub enum ObservabilityError {
    #[error("failed to initialize log file `{path}`: {reason}")]
    LogFile { path: String, reason: String },

    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
}

/// Initializes the global tracing subscriber.
///
/// The level comes from the config but `RUST_LOG` wins when set. Returns
/// the file writer's guard, which must stay alive for the process
/// lifetime.
pub fn init_tracing(config: &LoggerConfig) -> Result<Option<WorkerGuard>, ObservabilityError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_target(false)
            .boxed(),
        LogFormat::Console => fmt::layer().boxed(),
    });

    let mut guard = None;
    if !config.file_path.is_empty() {
        let (writer, file_guard) = file_writer(config)?;
        guard = Some(file_guard);
        layers.push(match config.format {
            LogFormat::Json => fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .with_target(false)
                .with_writer(writer)
                .boxed(),
            LogFormat::Console => fmt::layer().with_ansi(false).with_writer(writer).boxed(),
        });
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .init();
    Ok(guard)
}

fn file_writer(
    config: &LoggerConfig,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard), ObservabilityError> {
    let path = Path::new(&config.file_path);
    let directory = path.parent().unwrap_or_else(|| Path::new("."));
    let prefix = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "flowmeter.log".to_string());

    let mut builder = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix);
    if config.max_backups > 0 {
        builder = builder.max_log_files(config.max_backups);
    }
    let appender = builder
        .build(directory)
        .map_err(|err| ObservabilityError::LogFile {
            path: config.file_path.clone(),
            reason: err.to_string(),
        })?;

    Ok(tracing_appender::non_blocking(appender))
}

/// Installs the process-global Prometheus recorder and returns the handle
/// rendered by the metrics endpoint.
pub fn install_metrics_recorder() -> Result<PrometheusHandle, ObservabilityError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("qps_counter_request_duration_seconds".to_string()),
            DURATION_SECONDS_BUCKETS,
        )
        .map_err(|err| ObservabilityError::Metrics(err.to_string()))?
        .install_recorder()
        .map_err(|err| ObservabilityError::Metrics(err.to_string()))
}
