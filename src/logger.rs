use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use opentelemetry::{KeyValue, global, metrics::{Counter, Histogram}};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{
    logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider,
};
use serde::{Deserialize, Serialize};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};
use value_add::message::LogLevel;

const SERVICE_NAME: &str = "peerchain";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LogConfig {
    pub log_level: LogLevel,
    pub log_dir: PathBuf,
    pub log_file: String,
    pub event_file: String,
    pub otel_logs_endpoint: Option<String>,
    pub otel_events_endpoint: Option<String>,
}

impl LogConfig {
    pub fn new(log_level: LogLevel, log_dir: PathBuf) -> Self {
        Self {
            log_level,
            log_dir,
            log_file: "peerchain.log".into(),
            event_file: "channel_events.json".into(),
            otel_logs_endpoint: None,
            otel_events_endpoint: None,
        }
    }

    pub fn with_otel(mut self, logs: Option<String>, events: Option<String>) -> Self {
        self.otel_logs_endpoint = logs;
        self.otel_events_endpoint = events;
        self
    }

    /// `EnvFilter` directive for the configured level.
    pub fn directive(&self) -> String {
        match self.log_level {
            LogLevel::Critical => "error".to_string(),
            level => level.as_ref().to_ascii_lowercase(),
        }
    }
}

/// Keeps the OTLP providers alive; files need no guard.
pub enum TelemetryGuard {
    Otel(Telemetry),
    Files,
}

impl TelemetryGuard {
    pub fn shutdown(self) {
        if let TelemetryGuard::Otel(telemetry) = self {
            telemetry.shutdown();
        }
    }
}

/// Install the global tracing subscriber. With an OTLP endpoint everything is
/// exported, otherwise a daily rolling text log and a JSON log of channel
/// events are written under `log_dir`.
pub fn init_tracing(config: &LogConfig) -> Result<TelemetryGuard> {
    let level = config.directive();
    let otel_enabled = config.otel_logs_endpoint.is_some() || config.otel_events_endpoint.is_some();

    if otel_enabled {
        let logs = config.otel_logs_endpoint.as_deref().unwrap_or_default();
        let events = config.otel_events_endpoint.as_deref().unwrap_or(logs);
        let telemetry = Telemetry::init(&level, logs, logs, events)?;
        Ok(TelemetryGuard::Otel(telemetry))
    } else {
        FileTelemetry::init_files(
            &level,
            config.log_dir.join(&config.log_file),
            config.log_dir.join(&config.event_file),
        )?;
        Ok(TelemetryGuard::Files)
    }
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn get_resource() -> Resource {
    RESOURCE.get_or_init(|| {
        Resource::builder()
            .with_service_name(SERVICE_NAME)
            .build()
    }).clone()
}

fn init_logs(end_point: &str) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(end_point)
        .build()
        .context("building the OTLP log exporter")?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_traces(end_point: &str) -> Result<SdkTracerProvider> {
    let exporter = SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(end_point)
        .build()
        .context("building the OTLP span exporter")?;
    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_metrics(end_point: &str) -> Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(end_point)
        .build()
        .context("building the OTLP metric exporter")?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn filter(level: &str, directives: &[&str]) -> Result<EnvFilter> {
    let mut filter = EnvFilter::new(level);
    for directive in directives {
        filter = filter.add_directive(directive.parse()?);
    }
    Ok(filter)
}

pub struct Telemetry {
    /// emits OTel Logs from `tracing::event!`
    pub logger_provider: SdkLoggerProvider,
    pub tracer_provider: SdkTracerProvider,
    /// backs every [`ChannelMetrics`] created after init
    pub meter_provider: SdkMeterProvider,
}

impl Telemetry {
    pub fn init(log_level: &str, logger_endpoint: &str, tracer_endpoint: &str, meter_endpoint: &str) -> Result<Self> {
        let logger_provider = init_logs(logger_endpoint)?;
        let tracer_provider = init_traces(tracer_endpoint)?;
        let meter_provider = init_metrics(meter_endpoint)?;

        let otel_logs_layer = OpenTelemetryTracingBridge::new(&logger_provider)
            .with_filter(filter(log_level, &["hyper=off", "tonic=off", "h2=off", "reqwest=off"])?);

        // still show events locally
        let fmt_layer = fmt::layer()
            .with_thread_names(true)
            .with_filter(filter(log_level, &["opentelemetry=debug"])?);

        Registry::default()
            .with(otel_logs_layer)
            .with(fmt_layer)
            .try_init()
            .context("installing the tracing subscriber")?;

        global::set_tracer_provider(tracer_provider.clone());
        global::set_meter_provider(meter_provider.clone());

        Ok(Telemetry { logger_provider, tracer_provider, meter_provider })
    }

    /// Flush and stop the exporters.
    pub fn shutdown(&self) {
        let _ = self.tracer_provider.shutdown();
        let _ = self.meter_provider.shutdown();
        let _ = self.logger_provider.shutdown();
    }
}

fn split(path: &Path) -> Result<(PathBuf, PathBuf)> {
    let file = path
        .file_name()
        .with_context(|| format!("log path {} has no file name", path.display()))?;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).with_context(|| format!("creating log directory {}", dir.display()))?;
    Ok((dir, PathBuf::from(file)))
}

/// File-only logging.
pub struct FileTelemetry;

impl FileTelemetry {
    /// - `log_level` is an `EnvFilter` directive (e.g. `"info"`).
    /// - `log_file` receives every event as plain text.
    /// - `event_file` receives only `channel_event` records, one JSON object per line.
    pub fn init_files(log_level: &str, log_file: PathBuf, event_file: PathBuf) -> Result<()> {
        let (txt_dir, txt_name) = split(&log_file)?;
        let txt_layer = fmt::Layer::default()
            .with_writer(RollingFileAppender::new(Rotation::DAILY, txt_dir, txt_name))
            .with_ansi(false)
            .with_filter(EnvFilter::new(log_level));

        let (json_dir, json_name) = split(&event_file)?;
        let json_layer = fmt::layer()
            .json()
            .with_writer(RollingFileAppender::new(Rotation::DAILY, json_dir, json_name))
            .with_target(true)
            .with_filter(EnvFilter::new("channel_event=info"));

        Registry::default()
            .with(txt_layer)
            .with(json_layer)
            .try_init()
            .context("installing the tracing subscriber")?;
        Ok(())
    }
}

/// Counters for channel lifecycles, recorded on whatever meter provider is
/// installed globally (a no-op one unless OTLP is configured).
#[derive(Clone)]
pub struct ChannelMetrics {
    channels_opened: Counter<u64>,
    channels_failed: Counter<u64>,
    channels_closed: Counter<u64>,
    open_latency_ms: Histogram<f64>,
}

impl Default for ChannelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelMetrics {
    pub fn new() -> Self {
        let meter = global::meter(SERVICE_NAME);
        Self {
            channels_opened: meter
                .u64_counter("channels_opened")
                .with_description("Channels that reached the open state")
                .build(),
            channels_failed: meter.u64_counter("channels_failed").build(),
            channels_closed: meter.u64_counter("channels_closed").build(),
            open_latency_ms: meter
                .f64_histogram("open_latency_ms")
                .with_description("Time from open request to open channel")
                .with_unit("ms")
                .build(),
        }
    }

    pub fn record_open(&self, peer: &str, elapsed_ms: f64) {
        let attrs = [KeyValue::new("peer", peer.to_string())];
        self.channels_opened.add(1, &attrs);
        self.open_latency_ms.record(elapsed_ms, &attrs);
    }

    pub fn record_failure(&self, peer: &str) {
        self.channels_failed.add(1, &[KeyValue::new("peer", peer.to_string())]);
    }

    pub fn record_close(&self, peer: &str) {
        self.channels_closed.add(1, &[KeyValue::new("peer", peer.to_string())]);
    }
}
