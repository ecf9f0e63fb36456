use crate::exporter::{OtlpProtocol, SpanExporter};
use crate::resource::Resource;
use crate::span::{AttributeValue, SpanData, SpanEvent, SpanKind, SpanStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry_proto::tonic as pb;
use pb::collector::trace::v1::trace_service_client::TraceServiceClient;
use reqwest::Client;
use serde::Serialize;
use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue};
use tonic::transport::{Channel, Endpoint};

const TRACES_PATH: &str = "/v1/traces";

/// Configuration for [`OtlpSpanExporter`].
///
/// **Fields**
/// - `protocol`: gRPC (standard port 4317) or HTTP JSON (4318).
/// - `endpoint`: collector base URL. For HTTP JSON, `/v1/traces` is
///   appended unless already present.
/// - `timeout`: per-export deadline.
/// - `headers`: extra headers (gRPC metadata), e.g. collector auth.
#[derive(Clone, Debug)]
pub struct OtlpConfig {
    pub protocol: OtlpProtocol,
    pub endpoint: String,
    pub timeout: Duration,
    pub headers: Vec<(String, String)>,
}

impl OtlpConfig {
    /// Config pointing at the protocol's standard local collector port.
    pub fn new(protocol: OtlpProtocol) -> Self {
        OtlpConfig {
            protocol,
            endpoint: protocol.default_endpoint().to_string(),
            timeout: Duration::from_secs(10),
            headers: Vec::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// URL the exporter talks to.
    pub fn target_url(&self) -> String {
        let base = self.endpoint.trim().trim_end_matches('/');
        match self.protocol {
            OtlpProtocol::Grpc => base.to_string(),
            OtlpProtocol::HttpJson if base.ends_with(TRACES_PATH) => base.to_string(),
            OtlpProtocol::HttpJson => format!("{base}{TRACES_PATH}"),
        }
    }
}

impl Default for OtlpConfig {
    fn default() -> Self {
        OtlpConfig::new(OtlpProtocol::default())
    }
}

/// Error type returned when building an [`OtlpSpanExporter`].
#[derive(thiserror::Error, Debug)]
pub enum OtlpError {
    #[error("OTLP endpoint must be an http(s) URL, got {0:?}")]
    InvalidEndpoint(String),

    #[error("invalid OTLP header {0:?}")]
    InvalidHeader(String),

    #[error("failed to build OTLP HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to configure OTLP gRPC channel: {0}")]
    Grpc(#[from] tonic::transport::Error),
}

enum Transport {
    Grpc {
        client: TraceServiceClient<Channel>,
        metadata: Vec<(AsciiMetadataKey, AsciiMetadataValue)>,
    },
    HttpJson {
        client: Client,
        headers: Vec<(String, String)>,
    },
}

/// OTLP implementation of [`SpanExporter`].
///
/// gRPC uses the generated OTLP trace service client; HTTP JSON posts
/// `ExportTraceServiceRequest` bodies with `reqwest`.
pub struct OtlpSpanExporter {
    transport: Transport,
    url: String,
    resource: Arc<Resource>,
}

impl OtlpSpanExporter {
    /// **Parameters**
    /// - `config`: protocol, collector location, timeout and headers.
    /// - `resource`: process metadata sent with every request.
    ///
    /// **Returns**
    /// - `Err(OtlpError::InvalidEndpoint)` when the endpoint is not http(s).
    /// - `Err(OtlpError::InvalidHeader)` when a header is not valid gRPC
    ///   metadata.
    /// - `Err(OtlpError::Http | OtlpError::Grpc)` when the client cannot be
    ///   built.
    ///
    /// The gRPC channel connects lazily, so this must run inside a Tokio
    /// runtime but never waits on the network.
    pub fn new(config: OtlpConfig, resource: Arc<Resource>) -> Result<Self, OtlpError> {
        let endpoint = config.endpoint.trim();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(OtlpError::InvalidEndpoint(config.endpoint.clone()));
        }
        let url = config.target_url();

        let transport = match config.protocol {
            OtlpProtocol::Grpc => {
                let metadata = config
                    .headers
                    .iter()
                    .map(|(name, value)| grpc_metadata(name, value))
                    .collect::<Result<Vec<_>, _>>()?;
                let channel = Endpoint::from_shared(url.clone())?
                    .connect_timeout(config.timeout)
                    .timeout(config.timeout)
                    .connect_lazy();
                Transport::Grpc {
                    client: TraceServiceClient::new(channel),
                    metadata,
                }
            }
            OtlpProtocol::HttpJson => Transport::HttpJson {
                client: Client::builder().timeout(config.timeout).build()?,
                headers: config.headers,
            },
        };

        Ok(Self {
            transport,
            url,
            resource,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn grpc_metadata(name: &str, value: &str) -> Result<(AsciiMetadataKey, AsciiMetadataValue), OtlpError> {
    let key = AsciiMetadataKey::from_bytes(name.to_ascii_lowercase().as_bytes())
        .map_err(|_| OtlpError::InvalidHeader(name.to_string()))?;
    let value =
        AsciiMetadataValue::try_from(value).map_err(|_| OtlpError::InvalidHeader(name.to_string()))?;
    Ok((key, value))
}

#[async_trait]
impl SpanExporter for OtlpSpanExporter {
    async fn export(&self, batch: &[SpanData]) -> Result<(), Box<dyn Error + Send + Sync>> {
        if batch.is_empty() {
            return Ok(());
        }

        match &self.transport {
            Transport::Grpc { client, metadata } => {
                let mut request = tonic::Request::new(build_proto_request(&self.resource, batch));
                for (key, value) in metadata {
                    request.metadata_mut().insert(key.clone(), value.clone());
                }

                let response = client.clone().export(request).await?.into_inner();
                if let Some(partial) = response.partial_success {
                    if partial.rejected_spans > 0 {
                        tracing::warn!(
                            rejected = partial.rejected_spans,
                            error = %partial.error_message,
                            "collector rejected part of a span batch"
                        );
                    }
                }
                Ok(())
            }
            Transport::HttpJson { client, headers } => {
                let body = build_json_request(&self.resource, batch);
                let mut request = client.post(&self.url).json(&body);
                for (name, value) in headers {
                    request = request.header(name.as_str(), value.as_str());
                }

                let resp = request.send().await?;
                if resp.status().is_success() {
                    Ok(())
                } else {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_else(|_| "<no body>".to_string());
                    Err(format!("OTLP export failed with status {}: {}", status, text).into())
                }
            }
        }
    }
}

fn group_by_scope<T>(batch: &[SpanData], map: impl Fn(&SpanData) -> T) -> BTreeMap<&str, Vec<T>> {
    let mut by_scope: BTreeMap<&str, Vec<T>> = BTreeMap::new();
    for span in batch {
        by_scope
            .entry(span.instrumentation_scope.as_str())
            .or_default()
            .push(map(span));
    }
    by_scope
}

fn unix_nanos(at: DateTime<Utc>) -> u64 {
    u64::try_from(at.timestamp_nanos_opt().unwrap_or_default()).unwrap_or(0)
}

fn status_parts(status: &SpanStatus) -> (i32, Option<String>) {
    match status {
        SpanStatus::Unset => (0, None),
        SpanStatus::Ok => (1, None),
        SpanStatus::Error { description } => (2, Some(description.clone())),
    }
}

// gRPC body

fn build_proto_request(
    resource: &Resource,
    batch: &[SpanData],
) -> pb::collector::trace::v1::ExportTraceServiceRequest {
    let resource_attributes = resource
        .attributes()
        .into_iter()
        .map(|(key, value)| proto_key_value(key, &AttributeValue::String(value)))
        .collect();

    let scope_spans = group_by_scope(batch, proto_span)
        .into_iter()
        .map(|(name, spans)| pb::trace::v1::ScopeSpans {
            scope: Some(pb::common::v1::InstrumentationScope {
                name: name.to_string(),
                version: resource.service_version.clone(),
                ..Default::default()
            }),
            spans,
            ..Default::default()
        })
        .collect();

    pb::collector::trace::v1::ExportTraceServiceRequest {
        resource_spans: vec![pb::trace::v1::ResourceSpans {
            resource: Some(pb::resource::v1::Resource {
                attributes: resource_attributes,
                ..Default::default()
            }),
            scope_spans,
            ..Default::default()
        }],
    }
}

fn proto_span(span: &SpanData) -> pb::trace::v1::Span {
    use pb::trace::v1::span::SpanKind as ProtoKind;

    let (code, message) = status_parts(&span.status);
    pb::trace::v1::Span {
        trace_id: span.context.trace_id.to_u128().to_be_bytes().to_vec(),
        span_id: span.context.span_id.to_u64().to_be_bytes().to_vec(),
        parent_span_id: span
            .parent_span_id
            .map(|id| id.to_u64().to_be_bytes().to_vec())
            .unwrap_or_default(),
        name: span.name.clone(),
        kind: match span.kind {
            SpanKind::Internal => ProtoKind::Internal as i32,
            SpanKind::Server => ProtoKind::Server as i32,
        },
        start_time_unix_nano: unix_nanos(span.start_time),
        end_time_unix_nano: unix_nanos(span.end_time),
        attributes: span
            .attributes
            .iter()
            .map(|(key, value)| proto_key_value(key, value))
            .collect(),
        events: span
            .events
            .iter()
            .map(|event| pb::trace::v1::span::Event {
                time_unix_nano: unix_nanos(event.timestamp),
                name: event.name.clone(),
                attributes: event
                    .attributes
                    .iter()
                    .map(|(key, value)| proto_key_value(key, value))
                    .collect(),
                ..Default::default()
            })
            .collect(),
        status: Some(pb::trace::v1::Status {
            code,
            message: message.unwrap_or_default(),
        }),
        ..Default::default()
    }
}

fn proto_key_value(key: &str, value: &AttributeValue) -> pb::common::v1::KeyValue {
    use pb::common::v1::any_value::Value;

    let value = match value {
        AttributeValue::String(s) => Value::StringValue(s.clone()),
        AttributeValue::Int(i) => Value::IntValue(*i),
        AttributeValue::Float(f) => Value::DoubleValue(*f),
        AttributeValue::Bool(b) => Value::BoolValue(*b),
    };
    pb::common::v1::KeyValue {
        key: key.to_string(),
        value: Some(pb::common::v1::AnyValue { value: Some(value) }),
    }
}

// HTTP JSON body

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportTraceServiceRequest {
    resource_spans: Vec<ResourceSpans>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourceSpans {
    resource: OtlpResource,
    scope_spans: Vec<ScopeSpans>,
}

#[derive(Serialize)]
struct OtlpResource {
    attributes: Vec<KeyValue>,
}

#[derive(Serialize)]
struct ScopeSpans {
    scope: InstrumentationScope,
    spans: Vec<OtlpSpan>,
}

#[derive(Serialize)]
struct InstrumentationScope {
    name: String,
    version: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OtlpSpan {
    trace_id: String,
    span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_span_id: Option<String>,
    name: String,
    kind: u8,
    start_time_unix_nano: String,
    end_time_unix_nano: String,
    attributes: Vec<KeyValue>,
    events: Vec<OtlpEvent>,
    status: OtlpStatus,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OtlpEvent {
    time_unix_nano: String,
    name: String,
    attributes: Vec<KeyValue>,
}

#[derive(Serialize)]
struct OtlpStatus {
    code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Serialize)]
struct KeyValue {
    key: String,
    value: AnyValue,
}

#[derive(Serialize)]
enum AnyValue {
    #[serde(rename = "stringValue")]
    String(String),
    /// int64 travels as a decimal string in OTLP JSON.
    #[serde(rename = "intValue")]
    Int(String),
    #[serde(rename = "doubleValue")]
    Double(f64),
    #[serde(rename = "boolValue")]
    Bool(bool),
}

impl From<&AttributeValue> for AnyValue {
    fn from(value: &AttributeValue) -> Self {
        match value {
            AttributeValue::String(s) => AnyValue::String(s.clone()),
            AttributeValue::Int(i) => AnyValue::Int(i.to_string()),
            AttributeValue::Float(f) => AnyValue::Double(*f),
            AttributeValue::Bool(b) => AnyValue::Bool(*b),
        }
    }
}

fn build_json_request(resource: &Resource, batch: &[SpanData]) -> ExportTraceServiceRequest {
    ExportTraceServiceRequest {
        resource_spans: vec![ResourceSpans {
            resource: OtlpResource {
                attributes: resource
                    .attributes()
                    .into_iter()
                    .map(|(key, value)| KeyValue {
                        key: key.to_string(),
                        value: AnyValue::String(value),
                    })
                    .collect(),
            },
            scope_spans: group_by_scope(batch, json_span)
                .into_iter()
                .map(|(name, spans)| ScopeSpans {
                    scope: InstrumentationScope {
                        name: name.to_string(),
                        version: resource.service_version.clone(),
                    },
                    spans,
                })
                .collect(),
        }],
    }
}

fn json_span(span: &SpanData) -> OtlpSpan {
    let (code, message) = status_parts(&span.status);

    OtlpSpan {
        trace_id: span.context.trace_id.to_string(),
        span_id: span.context.span_id.to_string(),
        parent_span_id: span.parent_span_id.map(|id| id.to_string()),
        name: span.name.clone(),
        kind: match span.kind {
            SpanKind::Internal => 1,
            SpanKind::Server => 2,
        },
        start_time_unix_nano: unix_nanos(span.start_time).to_string(),
        end_time_unix_nano: unix_nanos(span.end_time).to_string(),
        attributes: json_key_values(&span.attributes),
        events: span.events.iter().map(json_event).collect(),
        status: OtlpStatus { code, message },
    }
}

fn json_event(event: &SpanEvent) -> OtlpEvent {
    OtlpEvent {
        time_unix_nano: unix_nanos(event.timestamp).to_string(),
        name: event.name.clone(),
        attributes: json_key_values(&event.attributes),
    }
}

fn json_key_values(attributes: &BTreeMap<String, AttributeValue>) -> Vec<KeyValue> {
    attributes
        .iter()
        .map(|(key, value)| KeyValue {
            key: key.clone(),
            value: value.into(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{BatchSpanProcessor, ProcessorConfig, ProcessorError};
    use crate::span::{SpanContext, SpanId};
    use serde_json::Value;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn span(name: &str, parent: Option<SpanId>, status: SpanStatus) -> SpanData {
        let now = Utc::now();
        SpanData {
            name: name.to_string(),
            context: SpanContext::random(),
            parent_span_id: parent,
            kind: SpanKind::Server,
            start_time: now,
            end_time: now,
            status,
            attributes: BTreeMap::from([
                ("http.method".to_string(), AttributeValue::from("POST")),
                ("http.status_code".to_string(), AttributeValue::from(201)),
            ]),
            events: vec![SpanEvent {
                name: "exception".to_string(),
                timestamp: now,
                attributes: BTreeMap::from([(
                    "exception.message".to_string(),
                    AttributeValue::from("boom"),
                )]),
            }],
            instrumentation_scope: "posts".to_string(),
        }
    }

    fn http_config(endpoint: &str) -> OtlpConfig {
        OtlpConfig::new(OtlpProtocol::HttpJson)
            .with_endpoint(endpoint)
            .with_header("x-api-key", "secret")
    }

    /// Serve exactly one HTTP request with a canned response and hand back
    /// the raw request text.
    async fn serve_once(status_line: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            while !request_complete(&received) {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&received).into_owned()
        });
        (format!("http://{addr}"), handle)
    }

    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..header_end]
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        raw.len() >= header_end + 4 + length
    }

    #[test]
    fn target_url_depends_on_protocol() {
        assert_eq!(OtlpConfig::default().target_url(), "http://localhost:4317");
        assert_eq!(
            OtlpConfig::new(OtlpProtocol::HttpJson).target_url(),
            "http://localhost:4318/v1/traces"
        );
        assert_eq!(
            OtlpConfig::new(OtlpProtocol::HttpJson)
                .with_endpoint("http://collector:4318/")
                .target_url(),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(
            OtlpConfig::new(OtlpProtocol::HttpJson)
                .with_endpoint("https://otel.example/v1/traces")
                .target_url(),
            "https://otel.example/v1/traces"
        );
    }

    #[tokio::test]
    async fn rejects_bad_endpoint_and_header() {
        let resource = Arc::new(Resource::default());
        let err = OtlpSpanExporter::new(
            OtlpConfig::default().with_endpoint("grpc://x:4317"),
            Arc::clone(&resource),
        );
        assert!(matches!(err, Err(OtlpError::InvalidEndpoint(_))));

        let err = OtlpSpanExporter::new(OtlpConfig::default().with_header("bad header", "x"), resource);
        assert!(matches!(err, Err(OtlpError::InvalidHeader(_))));
    }

    #[test]
    fn proto_body_carries_binary_ids_and_status() {
        let resource = Resource::new("posts", "test");
        let parent = span("parent", None, SpanStatus::error("boom"));
        let child = span("child", Some(parent.context.span_id), SpanStatus::Ok);
        let request = build_proto_request(&resource, &[child, parent.clone()]);

        let rs = &request.resource_spans[0];
        let resource_attrs = &rs.resource.as_ref().unwrap().attributes;
        assert!(resource_attrs.iter().any(|kv| kv.key == "service.name"));

        let spans = &rs.scope_spans[0].spans;
        assert_eq!(rs.scope_spans[0].scope.as_ref().unwrap().name, "posts");
        assert_eq!(spans.len(), 2);

        let child = &spans[0];
        assert_eq!(child.trace_id.len(), 16);
        assert_eq!(child.span_id.len(), 8);
        assert_eq!(child.parent_span_id, parent.context.span_id.to_u64().to_be_bytes().to_vec());
        assert_eq!(child.kind, 2);
        assert_eq!(child.status.as_ref().unwrap().code, 1);

        let root = &spans[1];
        assert_eq!(
            root.trace_id,
            parent.context.trace_id.to_u128().to_be_bytes().to_vec()
        );
        assert!(root.parent_span_id.is_empty());
        assert_eq!(root.status.as_ref().unwrap().code, 2);
        assert_eq!(root.status.as_ref().unwrap().message, "boom");
        assert_eq!(root.events[0].name, "exception");
        assert!(root.start_time_unix_nano > 0);
    }

    #[test]
    fn json_body_follows_otlp_shape() {
        let resource = Resource::new("posts", "test");
        let parent = span("parent", None, SpanStatus::error("boom"));
        let child = span("child", Some(parent.context.span_id), SpanStatus::Ok);
        let body = serde_json::to_value(build_json_request(&resource, &[child, parent])).unwrap();

        let rs = &body["resourceSpans"][0];
        let attrs = rs["resource"]["attributes"].as_array().unwrap();
        assert!(attrs
            .iter()
            .any(|kv| kv["key"] == "service.name" && kv["value"]["stringValue"] == "posts"));

        let spans = rs["scopeSpans"][0]["spans"].as_array().unwrap();
        assert_eq!(rs["scopeSpans"][0]["scope"]["name"], "posts");
        assert_eq!(spans.len(), 2);

        let child: &Value = &spans[0];
        assert_eq!(child["name"], "child");
        assert_eq!(child["status"]["code"], 1);
        assert_eq!(child["kind"], 2);
        assert_eq!(child["parentSpanId"].as_str().unwrap().len(), 16);
        assert_eq!(child["traceId"].as_str().unwrap().len(), 32);
        assert!(child["startTimeUnixNano"].as_str().unwrap().parse::<u64>().is_ok());

        let parent: &Value = &spans[1];
        assert!(parent.get("parentSpanId").is_none());
        assert_eq!(parent["status"]["code"], 2);
        assert_eq!(parent["status"]["message"], "boom");
        assert_eq!(parent["events"][0]["name"], "exception");

        let status_attr = parent["attributes"]
            .as_array()
            .unwrap()
            .iter()
            .find(|kv| kv["key"] == "http.status_code")
            .unwrap();
        assert_eq!(status_attr["value"]["intValue"], "201");
    }

    #[tokio::test]
    async fn http_export_succeeds_on_2xx() {
        let (endpoint, server) = serve_once("200 OK", "").await;
        let exporter =
            OtlpSpanExporter::new(http_config(&endpoint), Arc::new(Resource::new("posts", "test"))).unwrap();

        exporter
            .export(&[span("save_post", None, SpanStatus::Ok)])
            .await
            .unwrap();

        let received = server.await.unwrap();
        assert!(received.starts_with("POST /v1/traces HTTP/1.1"), "{received}");
        let lowered = received.to_ascii_lowercase();
        assert!(lowered.contains("content-type: application/json"), "{received}");
        assert!(lowered.contains("x-api-key: secret"), "{received}");
        assert!(received.contains("\"resourceSpans\""), "{received}");
        assert!(received.contains("\"save_post\""), "{received}");
    }

    #[tokio::test]
    async fn http_export_reports_status_and_body_on_failure() {
        let (endpoint, server) = serve_once("503 Service Unavailable", "collector overloaded").await;
        let exporter = OtlpSpanExporter::new(http_config(&endpoint), Arc::new(Resource::default())).unwrap();

        let err = exporter
            .export(&[span("save_post", None, SpanStatus::Ok)])
            .await
            .unwrap_err()
            .to_string();
        server.await.unwrap();

        assert!(err.contains("503"), "{err}");
        assert!(err.contains("collector overloaded"), "{err}");
    }

    #[tokio::test]
    async fn rejected_batch_surfaces_through_processor_shutdown() {
        let (endpoint, server) = serve_once("500 Internal Server Error", "disk full").await;
        let exporter = OtlpSpanExporter::new(http_config(&endpoint), Arc::new(Resource::default())).unwrap();
        let processor = BatchSpanProcessor::new(
            Arc::new(exporter),
            ProcessorConfig {
                max_export_attempts: 1,
                ..ProcessorConfig::default()
            },
        );

        processor.on_end(span("save_post", None, SpanStatus::Ok));
        let err = processor.shutdown().await.unwrap_err();
        server.await.unwrap();

        match err {
            ProcessorError::Export(message) => assert!(message.contains("500"), "{message}"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(processor.exported_spans.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn grpc_export_to_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut config = OtlpConfig::new(OtlpProtocol::Grpc).with_endpoint(format!("http://{addr}"));
        config.timeout = Duration::from_secs(2);
        let exporter = OtlpSpanExporter::new(config, Arc::new(Resource::default())).unwrap();
        assert_eq!(exporter.url(), format!("http://{addr}"));

        let result = exporter.export(&[span("save_post", None, SpanStatus::Ok)]).await;
        assert!(result.is_err());
    }
}
