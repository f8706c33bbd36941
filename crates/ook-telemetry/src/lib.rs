mod metrics;
mod spans;

pub use metrics::{names, HistogramSummary, MetricSample, MetricType, MetricsRecorder, HISTOGRAM_WINDOW};
pub use spans::{RpcSpan, SpanCounts, SpanStatus, Tracer};

use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Log record formatter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Where log records are written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogTarget {
    #[default]
    Stdout,
    /// Used when stdout carries protocol frames.
    Stderr,
}

/// Log levels, format and destination.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub log_level: Level,
    /// Target-prefix overrides, e.g. `("ook", DEBUG)`.
    pub module_levels: Vec<(String, Level)>,
    pub format: LogFormat,
    pub target: LogTarget,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            format: LogFormat::Json,
            target: LogTarget::Stdout,
        }
    }
}

impl TelemetryConfig {
    /// Render the configured levels as an `EnvFilter` directive string.
    pub fn filter_directives(&self) -> String {
        std::iter::once(level_name(self.log_level))
            .chain(
                self.module_levels
                    .iter()
                    .map(|(module, level)| format!("{module}={}", level_name(*level))),
            )
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn level_name(level: Level) -> String {
    level.to_string().to_ascii_lowercase()
}

/// Metrics and span sinks handed to the components that report telemetry.
#[derive(Clone, Default)]
pub struct Telemetry {
    pub metrics: Arc<MetricsRecorder>,
    pub tracer: Arc<Tracer>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Keeps the telemetry sinks alive for the lifetime of the process.
pub struct TelemetryGuard {
    telemetry: Telemetry,
}

impl TelemetryGuard {
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.telemetry.metrics
    }

    pub fn tracer(&self) -> &Tracer {
        &self.telemetry.tracer
    }
}

/// Install the global subscriber and hand back fresh sinks. Call once at
/// startup; `RUST_LOG` wins over the configured levels.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let writer = match config.target {
        LogTarget::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogTarget::Stderr => BoxMakeWriter::new(std::io::stderr),
    };
    let records = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_span_list(true)
            .with_writer(writer)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer().pretty().with_writer(writer).boxed(),
    };

    tracing_subscriber::registry()
        .with(records.with_filter(filter))
        .init();

    TelemetryGuard {
        telemetry: Telemetry::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.target, LogTarget::Stdout);
    }

    #[test]
    fn filter_directives_without_modules() {
        assert_eq!(TelemetryConfig::default().filter_directives(), "info");
    }

    #[test]
    fn filter_directives_include_modules() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("ook_bridge".into(), Level::DEBUG)],
            ..Default::default()
        };
        assert_eq!(config.filter_directives(), "warn,ook_bridge=debug");
    }

    #[test]
    fn telemetry_clones_share_sinks() {
        let telemetry = Telemetry::new();
        let clone = telemetry.clone();
        clone.metrics.counter_inc("shared", &[], 1);
        assert_eq!(telemetry.metrics.counter_get("shared", &[]), 1);
        assert!(Arc::ptr_eq(&telemetry.tracer, &clone.tracer));
    }

    #[test]
    fn guard_exposes_sinks() {
        let guard = TelemetryGuard {
            telemetry: Telemetry::new(),
        };
        guard.metrics().gauge_inc("g", &[], 2.0);
        assert_eq!(guard.telemetry().metrics.gauge_get("g", &[]), 2.0);
        assert_eq!(guard.tracer().counts().started, 0);
    }
}
