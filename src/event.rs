use crate::record::{self, Fields, LogEvent};
use crate::resource::Resource;
use crate::span::{current_span_context, SpanContext};
use std::fmt;
use std::io::Write;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;

/// Emits one JSON line per event and mirrors a short summary through
/// `tracing`.
///
/// Logging never fails the caller: serialization problems degrade to
/// placeholders and write errors are ignored. Each record is written with a
/// single `write_all`, so concurrent callers never interleave partial lines.
#[derive(Clone)]
pub struct EventLogger {
    inner: Arc<Inner>,
}

struct Inner {
    writer: BoxMakeWriter,
    service: String,
    version: String,
}

impl fmt::Debug for EventLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLogger")
            .field("service", &self.inner.service)
            .field("version", &self.inner.version)
            .finish()
    }
}

impl EventLogger {
    /// Logger writing to standard output.
    pub fn new(resource: &Resource) -> Self {
        Self::with_writer(resource, std::io::stdout)
    }

    pub fn with_writer<W>(resource: &Resource, writer: W) -> Self
    where
        W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
    {
        EventLogger {
            inner: Arc::new(Inner {
                writer: BoxMakeWriter::new(writer),
                service: resource.service_name.clone(),
                version: resource.service_version.clone(),
            }),
        }
    }

    /// Log at `INFO`.
    pub fn log_event(&self, event_type: &str, message: &str, fields: Fields) {
        self.log_event_with_level(event_type, message, record::level::INFO, fields);
    }

    /// Log at an explicit level. The level string is recorded verbatim;
    /// the `tracing` mirror uses its case-insensitive interpretation.
    pub fn log_event_with_level(&self, event_type: &str, message: &str, level: &str, fields: Fields) {
        // Correlate with the active span when there is one.
        let context = current_span_context().unwrap_or_else(SpanContext::random);

        let event = LogEvent::new(event_type, message, level, fields)
            .with_origin(&self.inner.service, &self.inner.version)
            .with_ids(context.trace_id.to_string(), context.span_id.to_string());

        self.emit(&event);
    }

    fn emit(&self, event: &LogEvent) {
        let mut line = event.to_line();
        line.push('\n');
        let _ = self.inner.writer.make_writer().write_all(line.as_bytes());

        let event_type = event.event_type.as_str();
        let message = event.message.as_str();
        match record::tracing_level(&event.level) {
            Level::ERROR => tracing::error!("{}: {}", event_type, message),
            Level::WARN => tracing::warn!("{}: {}", event_type, message),
            Level::DEBUG => tracing::debug!("{}: {}", event_type, message),
            Level::TRACE => tracing::trace!("{}: {}", event_type, message),
            _ => tracing::info!("{}: {}", event_type, message),
        }
    }
}
