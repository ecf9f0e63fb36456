use crate::exporter::SpanExporter;
use crate::resource::Resource;
use crate::span::{AttributeValue, SpanContext, SpanData, SpanEvent, SpanId, SpanKind, SpanStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::error::Error;
use std::io::Write;
use std::sync::Arc;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;

/// Human-readable span dump, one pretty-printed JSON document per span.
pub struct ConsoleSpanExporter {
    writer: BoxMakeWriter,
    resource: Arc<Resource>,
}

impl ConsoleSpanExporter {
    /// Exporter writing to the process's standard output.
    pub fn stdout(resource: Arc<Resource>) -> Self {
        Self::with_writer(resource, std::io::stdout)
    }

    pub fn with_writer<W>(resource: Arc<Resource>, writer: W) -> Self
    where
        W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
    {
        ConsoleSpanExporter {
            writer: BoxMakeWriter::new(writer),
            resource,
        }
    }

    fn render(&self, span: &SpanData) -> Result<String, serde_json::Error> {
        let view = ConsoleSpan {
            name: &span.name,
            context: &span.context,
            kind: span.kind,
            parent_id: span.parent_span_id,
            start_time: span.start_time,
            end_time: span.end_time,
            duration_ms: span.duration_ms(),
            status: &span.status,
            attributes: &span.attributes,
            events: &span.events,
            instrumentation_scope: &span.instrumentation_scope,
            resource: self.resource.attributes(),
        };
        serde_json::to_string_pretty(&view)
    }
}

#[derive(Serialize)]
struct ConsoleSpan<'a> {
    name: &'a str,
    context: &'a SpanContext,
    kind: SpanKind,
    parent_id: Option<SpanId>,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    duration_ms: f64,
    status: &'a SpanStatus,
    attributes: &'a BTreeMap<String, AttributeValue>,
    events: &'a [SpanEvent],
    instrumentation_scope: &'a str,
    resource: BTreeMap<&'static str, String>,
}

#[async_trait]
impl SpanExporter for ConsoleSpanExporter {
    async fn export(&self, batch: &[SpanData]) -> Result<(), Box<dyn Error + Send + Sync>> {
        for span in batch {
            let mut text = self.render(span)?;
            text.push('\n');
            // One write per span keeps dumps from interleaving with log lines.
            self.writer.make_writer().write_all(text.as_bytes())?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.writer.make_writer().flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::SharedBuffer;
    use serde_json::Value;

    #[tokio::test]
    async fn dumps_span_with_resource_and_status() {
        let buffer = SharedBuffer::new();
        let resource = Arc::new(Resource::new("posts", "test"));
        let exporter = ConsoleSpanExporter::with_writer(resource, buffer.clone());

        let now = Utc::now();
        let span = SpanData {
            name: "save_post".to_string(),
            context: SpanContext::random(),
            parent_span_id: None,
            kind: SpanKind::Server,
            start_time: now,
            end_time: now,
            status: SpanStatus::error("disk full"),
            attributes: BTreeMap::from([("post.id".to_string(), AttributeValue::from("p1"))]),
            events: Vec::new(),
            instrumentation_scope: "posts".to_string(),
        };
        exporter.export(&[span]).await.unwrap();

        let dump: Value = serde_json::from_str(buffer.contents().trim()).unwrap();
        assert_eq!(dump["name"], "save_post");
        assert_eq!(dump["kind"], "server");
        assert_eq!(dump["status"]["status_code"], "ERROR");
        assert_eq!(dump["status"]["description"], "disk full");
        assert_eq!(dump["attributes"]["post.id"], "p1");
        assert_eq!(dump["resource"]["service.name"], "posts");
        assert_eq!(dump["context"]["trace_id"].as_str().unwrap().len(), 32);
        assert!(dump["parent_id"].is_null());
    }
}
