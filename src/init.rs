use crate::env::{self, lookup_or, lookup_parsed};
use crate::event::EventLogger;
use crate::exporter::{make_exporter, ExporterKind, OtlpProtocol, SpanExporter};
use crate::processor::{BatchSpanProcessor, ProcessorConfig, ProcessorError};
use crate::record::Fields;
use crate::request::{RequestInfo, RequestScope};
use crate::resource::{Resource, DEFAULT_ENVIRONMENT, DEFAULT_SERVICE_NAME};
use crate::span::{task_scope, Tracer};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Duration;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Telemetry configuration.
///
/// **Fields**
/// - `service_name`, `environment`: resource attributes.
/// - `exporter`: which span exporter to build.
/// - `otlp_protocol`: gRPC or HTTP JSON, used only for [`ExporterKind::Otlp`].
/// - `otlp_endpoint`: collector URL; `None` means the protocol's standard
///   local port (4317 for gRPC, 4318 for HTTP).
/// - `processor`: span queueing and batching.
/// - `enable_stderr`: if `true`, [`init_telemetry_with_config`] installs a
///   `tracing` fmt subscriber on stderr so the short mirror lines and the
///   crate's own warnings are visible.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub environment: String,
    pub exporter: ExporterKind,
    pub otlp_protocol: OtlpProtocol,
    pub otlp_endpoint: Option<String>,
    pub processor: ProcessorConfig,
    pub enable_stderr: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            environment: DEFAULT_ENVIRONMENT.to_string(),
            exporter: ExporterKind::Console,
            otlp_protocol: OtlpProtocol::default(),
            otlp_endpoint: None,
            processor: ProcessorConfig::default(),
            enable_stderr: true,
        }
    }
}

impl TelemetryConfig {
    /// Read configuration from the process environment. Missing or invalid
    /// values fall back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`TelemetryConfig::from_env`] against any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let raw_exporter = lookup_or(&lookup, env::OTEL_TRACES_EXPORTER_ENV, "console");
        let exporter = raw_exporter.parse::<ExporterKind>().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "using console span exporter");
            ExporterKind::Console
        });

        let raw_protocol = lookup_or(&lookup, env::OTEL_EXPORTER_OTLP_PROTOCOL_ENV, "grpc");
        let otlp_protocol = raw_protocol.parse::<OtlpProtocol>().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "using OTLP over gRPC");
            OtlpProtocol::Grpc
        });

        let schedule_delay_ms = lookup_parsed(
            &lookup,
            env::OTEL_BSP_SCHEDULE_DELAY_ENV,
            defaults.processor.flush_interval.as_millis() as u64,
        );

        Self {
            service_name: lookup_or(&lookup, env::OTEL_SERVICE_NAME_ENV, DEFAULT_SERVICE_NAME),
            environment: lookup_or(&lookup, env::ENVIRONMENT_ENV, DEFAULT_ENVIRONMENT),
            exporter,
            otlp_protocol,
            otlp_endpoint: lookup(env::OTEL_EXPORTER_OTLP_ENDPOINT_ENV)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            processor: ProcessorConfig {
                channel_buffer: lookup_parsed(
                    &lookup,
                    env::OTEL_BSP_MAX_QUEUE_SIZE_ENV,
                    defaults.processor.channel_buffer,
                ),
                batch_size: lookup_parsed(
                    &lookup,
                    env::OTEL_BSP_MAX_EXPORT_BATCH_SIZE_ENV,
                    defaults.processor.batch_size,
                ),
                flush_interval: Duration::from_millis(schedule_delay_ms),
                ..defaults.processor
            },
            enable_stderr: defaults.enable_stderr,
        }
    }

    pub fn resource(&self) -> Resource {
        Resource::new(&self.service_name, &self.environment)
    }
}

/// Error type returned when bootstrapping telemetry.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum InitError {
    #[error("telemetry is already initialized for this process")]
    AlreadyInitialized,

    #[error("telemetry must be initialized from within a Tokio runtime")]
    NoRuntime,
}

/// The process's telemetry context: resource, event logger, tracer and the
/// span pipeline behind it.
///
/// Created once at startup and passed by reference (or cheap clones of the
/// logger and tracer) to whatever needs it. Call [`Telemetry::shutdown`]
/// before exit so buffered spans are exported.
pub struct Telemetry {
    resource: Arc<Resource>,
    logger: EventLogger,
    tracer: Tracer,
    processor: Arc<BatchSpanProcessor>,
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("resource", &self.resource)
            .field("tracer", &self.tracer)
            .finish()
    }
}

impl Telemetry {
    /// Build a context around an explicit exporter, logging to stdout.
    ///
    /// Unlike [`init_telemetry_with_config`] this touches no process-wide
    /// state, so it can be called any number of times.
    pub fn new(config: &TelemetryConfig, exporter: Arc<dyn SpanExporter>) -> Result<Self, InitError> {
        let resource = Arc::new(config.resource());
        let logger = EventLogger::new(&resource);
        Self::assemble(config, resource, logger, exporter)
    }

    /// Like [`Telemetry::new`] with a caller-chosen event logger.
    pub fn with_logger(
        config: &TelemetryConfig,
        logger: EventLogger,
        exporter: Arc<dyn SpanExporter>,
    ) -> Result<Self, InitError> {
        let resource = Arc::new(config.resource());
        Self::assemble(config, resource, logger, exporter)
    }

    fn assemble(
        config: &TelemetryConfig,
        resource: Arc<Resource>,
        logger: EventLogger,
        exporter: Arc<dyn SpanExporter>,
    ) -> Result<Self, InitError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(InitError::NoRuntime);
        }

        let processor = Arc::new(BatchSpanProcessor::new(exporter, config.processor.clone()));
        let tracer = Tracer::new(resource.service_name.clone(), Arc::clone(&processor));

        Ok(Telemetry {
            resource,
            logger,
            tracer,
            processor,
        })
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn logger(&self) -> &EventLogger {
        &self.logger
    }

    pub fn processor(&self) -> &BatchSpanProcessor {
        &self.processor
    }

    /// Shorthand for [`EventLogger::log_event_with_level`].
    pub fn log_event(&self, event_type: &str, message: &str, level: &str, fields: Fields) {
        self.logger
            .log_event_with_level(event_type, message, level, fields);
    }

    /// Open a [`RequestScope`] for an inbound request.
    pub fn begin_request(&self, request: RequestInfo) -> RequestScope {
        RequestScope::begin(&self.tracer, &self.logger, request)
    }

    /// Handle one request in its own [`task_scope`].
    ///
    /// The scope is opened inside the task scope, so spans and log events of
    /// concurrent requests never mix even when they share a worker thread.
    /// The returned future is `Send` whenever `handler`'s future is, and
    /// can be handed to `tokio::spawn`.
    pub fn handle_request<F, Fut>(
        &self,
        request: RequestInfo,
        handler: F,
    ) -> impl Future<Output = Fut::Output>
    where
        F: FnOnce(RequestScope) -> Fut,
        Fut: Future,
    {
        let tracer = self.tracer.clone();
        let logger = self.logger.clone();
        task_scope(async move {
            let scope = RequestScope::begin(&tracer, &logger, request);
            handler(scope).await
        })
    }

    /// Export every span closed so far.
    pub async fn force_flush(&self) -> Result<(), ProcessorError> {
        self.processor.force_flush().await
    }

    /// Flush buffered spans and stop the export pipeline.
    ///
    /// A failed final export is logged and returned; it never panics.
    pub async fn shutdown(&self) -> Result<(), ProcessorError> {
        self.processor.shutdown().await
    }
}

/// Initialize telemetry from the environment.
///
/// Equivalent to [`init_telemetry_with_config`] with
/// [`TelemetryConfig::from_env`], except that the stderr subscriber is
/// installed before the environment is read, so warnings about malformed
/// variables are visible. This is the recommended entrypoint for the
/// service binary.
pub fn init_telemetry() -> Result<Telemetry, InitError> {
    bootstrap(Some(std::io::stderr), TelemetryConfig::from_env)
}

/// Initialize process-wide telemetry.
///
/// **Effects**
///
/// Installs a [`Registry`] with an [`EnvFilter`] (from `RUST_LOG`, default
/// `info`) and a stderr fmt layer as the global `tracing` subscriber when
/// `enable_stderr` is set and no subscriber is installed yet, then builds
/// the configured exporter and batch processor.
///
/// **Returns**
/// - `Err(InitError::AlreadyInitialized)` on every call after the first
///   successful one; the existing pipeline is left untouched.
/// - `Err(InitError::NoRuntime)` outside a Tokio runtime.
pub fn init_telemetry_with_config(config: TelemetryConfig) -> Result<Telemetry, InitError> {
    bootstrap(config.enable_stderr.then_some(std::io::stderr), move || config)
}

/// Claim the once-guard, install the subscriber writing to `stderr`, and
/// only then call `load` for the configuration.
fn bootstrap<W, F>(stderr: Option<W>, load: F) -> Result<Telemetry, InitError>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
    F: FnOnce() -> TelemetryConfig,
{
    if tokio::runtime::Handle::try_current().is_err() {
        return Err(InitError::NoRuntime);
    }
    if INITIALIZED
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        tracing::warn!("init_telemetry called more than once; keeping the first pipeline");
        return Err(InitError::AlreadyInitialized);
    }

    if let Some(writer) = stderr {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer().with_writer(writer);
        let subscriber = Registry::default().with(filter).with(fmt_layer);
        if tracing::subscriber::set_global_default(subscriber).is_err() {
            tracing::debug!("global tracing subscriber already set, keeping it");
        }
    }

    let config = load();
    let resource = Arc::new(config.resource());
    let (exporter, selected) = make_exporter(
        config.exporter,
        config.otlp_protocol,
        config.otlp_endpoint.as_deref(),
        Arc::clone(&resource),
    );
    let logger = EventLogger::new(&resource);
    let telemetry = Telemetry::assemble(&config, Arc::clone(&resource), logger, exporter)?;

    tracing::info!(
        service = %resource.service_name,
        environment = %resource.environment,
        exporter = %selected,
        "telemetry initialized"
    );
    Ok(telemetry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_exporter::InMemorySpanExporter;
    use crate::writer::SharedBuffer;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let config = TelemetryConfig::from_lookup(|_| None);
        assert_eq!(config.service_name, DEFAULT_SERVICE_NAME);
        assert_eq!(config.environment, "development");
        assert_eq!(config.exporter, ExporterKind::Console);
        assert_eq!(config.otlp_protocol, OtlpProtocol::Grpc);
        assert_eq!(config.otlp_endpoint, None);
        assert_eq!(config.processor.flush_interval, Duration::from_secs(5));
    }

    #[test]
    fn overrides_are_read() {
        let config = TelemetryConfig::from_lookup(lookup_from(&[
            ("OTEL_SERVICE_NAME", "posts-api"),
            ("ENVIRONMENT", "production"),
            ("OTEL_TRACES_EXPORTER", "OTLP"),
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://collector:4318"),
            ("OTEL_EXPORTER_OTLP_PROTOCOL", "http/json"),
            ("OTEL_BSP_MAX_EXPORT_BATCH_SIZE", "64"),
            ("OTEL_BSP_SCHEDULE_DELAY", "250"),
        ]));
        assert_eq!(config.service_name, "posts-api");
        assert_eq!(config.environment, "production");
        assert_eq!(config.exporter, ExporterKind::Otlp);
        assert_eq!(config.otlp_protocol, OtlpProtocol::HttpJson);
        assert_eq!(config.otlp_endpoint.as_deref(), Some("http://collector:4318"));
        assert_eq!(config.processor.batch_size, 64);
        assert_eq!(config.processor.flush_interval, Duration::from_millis(250));

        let resource = config.resource();
        assert_eq!(resource.service_name, "posts-api");
        assert_eq!(resource.environment, "production");
    }

    #[test]
    fn unknown_exporter_falls_back_to_console() {
        let config = TelemetryConfig::from_lookup(lookup_from(&[("OTEL_TRACES_EXPORTER", "zipkin")]));
        assert_eq!(config.exporter, ExporterKind::Console);
    }

    #[test]
    fn unsupported_protocol_falls_back_to_grpc() {
        let config = TelemetryConfig::from_lookup(lookup_from(&[
            ("OTEL_EXPORTER_OTLP_PROTOCOL", "http/protobuf"),
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "  "),
        ]));
        assert_eq!(config.otlp_protocol, OtlpProtocol::Grpc);
        assert_eq!(config.otlp_endpoint, None);
    }

    // The only test in this binary that installs the global subscriber.
    #[tokio::test]
    async fn configuration_warnings_reach_the_installed_subscriber() {
        let buffer = SharedBuffer::new();
        let telemetry = bootstrap(Some(buffer.clone()), || {
            TelemetryConfig::from_lookup(lookup_from(&[
                ("OTEL_TRACES_EXPORTER", "zipkin"),
                ("OTEL_BSP_SCHEDULE_DELAY", "soon"),
            ]))
        })
        .unwrap();

        let output = buffer.contents();
        assert!(output.contains("zipkin"), "{output}");
        assert!(output.contains("soon"), "{output}");
        assert!(output.contains("telemetry initialized"), "{output}");

        assert_eq!(
            init_telemetry_with_config(TelemetryConfig::default()).unwrap_err(),
            InitError::AlreadyInitialized
        );
        telemetry.shutdown().await.unwrap();
    }

    #[test]
    fn context_requires_runtime() {
        let err = Telemetry::new(
            &TelemetryConfig::default(),
            Arc::new(InMemorySpanExporter::default()),
        )
        .unwrap_err();
        assert_eq!(err, InitError::NoRuntime);
    }

    #[tokio::test]
    async fn shutdown_exports_buffered_spans() {
        let exporter = InMemorySpanExporter::default();
        let telemetry =
            Telemetry::new(&TelemetryConfig::default(), Arc::new(exporter.clone())).unwrap();

        telemetry.tracer().start_span("startup").end();
        telemetry.shutdown().await.unwrap();

        assert_eq!(exporter.finished_spans().len(), 1);
        assert_eq!(exporter.finished_spans()[0].instrumentation_scope, DEFAULT_SERVICE_NAME);
        assert_eq!(telemetry.shutdown().await, Err(ProcessorError::AlreadyShutdown));
    }
}
