use crate::event::EventLogger;
use crate::record::{level, Fields};
use crate::span::{SpanGuard, SpanKind, SpanStatus, Tracer};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

/// `event_type` of every request/response record.
pub const REQUEST_RESPONSE_EVENT: &str = "request_response";

/// `event_type` logged by [`RequestScope::fail`].
pub const REQUEST_ERROR_EVENT: &str = "request_error";

/// Sentinel `response_size_bytes` for payloads that cannot be serialized.
pub const UNSERIALIZABLE_SIZE: i64 = -1;

/// What the logger needs to know about an inbound HTTP request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    pub query_params: BTreeMap<String, String>,
    pub client_ip: Option<String>,
    headers: BTreeMap<String, String>,
}

impl RequestInfo {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        RequestInfo {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    /// Build from a raw request target such as `/tweets?author=bob%20m`.
    ///
    /// Query values are percent-decoded (`+` counts as a space); a key that
    /// repeats keeps its last value.
    pub fn from_target(method: impl Into<String>, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (target, ""),
        };

        let mut request = RequestInfo::new(method, if path.is_empty() { "/" } else { path });
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            request
                .query_params
                .insert(decode_component(key), decode_component(value));
        }
        request
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(key.into(), value.into());
        self
    }

    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    /// Header names are case-insensitive.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// `User-Agent` header, or `unknown`.
    pub fn user_agent(&self) -> &str {
        self.header("user-agent").unwrap_or("unknown")
    }
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

/// Wall-clock stopwatch for request latency.
#[derive(Debug, Clone, Copy)]
pub struct RequestTimer {
    started: Instant,
}

impl RequestTimer {
    pub fn start() -> Self {
        RequestTimer {
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }
}

/// Fresh per-request correlation id (UUID v4).
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// `ERROR` for 5xx codes, `INFO` otherwise.
pub fn status_level(status_code: u16) -> &'static str {
    if (500..600).contains(&status_code) {
        level::ERROR
    } else {
        level::INFO
    }
}

/// Round to two decimals; negative or non-finite inputs become 0.
pub fn round_ms(ms: f64) -> f64 {
    if !ms.is_finite() || ms <= 0.0 {
        return 0.0;
    }
    (ms * 100.0).round() / 100.0
}

/// Serialized size in bytes and JSON kind of a response payload.
///
/// Null or empty payloads (`{}`, `[]`, `""`, `0`, `false`) count as 0
/// bytes. Payloads that fail to serialize yield [`UNSERIALIZABLE_SIZE`].
pub fn describe_payload<T: Serialize + ?Sized>(data: &T) -> (i64, &'static str) {
    let value = match serde_json::to_value(data) {
        Ok(value) => value,
        Err(_) => return (UNSERIALIZABLE_SIZE, "unserializable"),
    };

    let kind = match &value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };

    let empty = match &value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    };
    if empty {
        return (0, kind);
    }

    let size = serde_json::to_string(&value)
        .map(|text| i64::try_from(text.len()).unwrap_or(i64::MAX))
        .unwrap_or(UNSERIALIZABLE_SIZE);
    (size, kind)
}

impl EventLogger {
    /// Emit exactly one `request_response` record describing a finished
    /// request.
    ///
    /// **Parameters**
    /// - `request`: the inbound request.
    /// - `response_data`: payload returned to the client; pass `&()` or
    ///   `&None::<T>` when there is none.
    /// - `status_code`: HTTP result; 5xx codes log at `ERROR`. Written as
    ///   `http.status_code` and `http_status_code`, never as a bare
    ///   `status_code` key.
    /// - `response_time_ms`: caller-measured latency.
    /// - `request_id`: caller-minted correlation id.
    /// - `extra`: additional fields. Derived fields take precedence.
    pub fn log_request_response<T: Serialize + ?Sized>(
        &self,
        request: &RequestInfo,
        response_data: &T,
        status_code: u16,
        response_time_ms: f64,
        request_id: &str,
        extra: Fields,
    ) {
        let (size_bytes, data_type) = describe_payload(response_data);

        let mut fields = extra;
        fields.insert("request_id", request_id);
        fields.insert("method", &request.method);
        fields.insert("path", &request.path);
        fields.insert("query_params", &request.query_params);
        fields.insert("client_ip", &request.client_ip);
        fields.insert("user_agent", request.user_agent());
        fields.insert("status_code", status_code);
        fields.insert("http_status_code", status_code);
        fields.insert("response_time_ms", round_ms(response_time_ms));
        fields.insert("response_size_bytes", size_bytes);
        fields.insert("response_data_type", data_type);

        let message = format!("Request completed: {} {}", request.method, request.path);
        self.log_event_with_level(
            REQUEST_RESPONSE_EVENT,
            &message,
            status_level(status_code),
            fields,
        );
    }
}

/// One inbound request's telemetry: a server span, a request id, a timer
/// and the closing request/response record.
///
/// Events logged through the scope carry its `request_id` and, while the
/// span is open, its trace and span ids.
pub struct RequestScope {
    logger: EventLogger,
    request: RequestInfo,
    request_id: String,
    timer: RequestTimer,
    span: SpanGuard,
}

impl fmt::Debug for RequestScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestScope")
            .field("request", &self.request)
            .field("request_id", &self.request_id)
            .field("span", &self.span)
            .finish()
    }
}

impl RequestScope {
    /// Open the request's server span. It always starts a new trace.
    pub fn begin(tracer: &Tracer, logger: &EventLogger, request: RequestInfo) -> Self {
        let request_id = new_request_id();
        let span = tracer.start_root_span(
            format!("{} {}", request.method, request.path),
            SpanKind::Server,
        );
        span.set_attribute("http.method", &request.method);
        span.set_attribute("url.path", &request.path);
        span.set_attribute("user_agent.original", request.user_agent());
        if let Some(ip) = &request.client_ip {
            span.set_attribute("client.address", ip);
        }
        span.set_attribute("request_id", &request_id);

        RequestScope {
            logger: logger.clone(),
            request,
            request_id,
            timer: RequestTimer::start(),
            span,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn request(&self) -> &RequestInfo {
        &self.request
    }

    pub fn span(&self) -> &SpanGuard {
        &self.span
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.timer.elapsed_ms()
    }

    /// Log an event tagged with this request's id.
    pub fn log_event(&self, event_type: &str, message: &str, level: &str, fields: Fields) {
        let fields = fields.with("request_id", &self.request_id);
        self.logger
            .log_event_with_level(event_type, message, level, fields);
    }

    /// Close the request successfully (or with a non-exception HTTP error):
    /// the span gets `http.status_code`, 5xx marks it `ERROR`, and one
    /// `request_response` record is logged.
    pub fn finish<T: Serialize + ?Sized>(self, response_data: &T, status_code: u16, extra: Fields) {
        self.span.set_attribute("http.status_code", status_code);
        if (500..600).contains(&status_code) {
            self.span
                .set_status(SpanStatus::error(format!("HTTP {status_code}")));
        }
        self.logger.log_request_response(
            &self.request,
            response_data,
            status_code,
            self.timer.elapsed_ms(),
            &self.request_id,
            extra,
        );
    }

    /// Close the request after a handler error. The span records the
    /// exception and an `ERROR` status; a `request_error` record carries
    /// `error.type`, `error.message` and `http.status_code`.
    pub fn fail<E: fmt::Display + ?Sized>(self, err: &E, status_code: u16, extra: Fields) {
        self.span.set_attribute("http.status_code", status_code);
        self.span.record_error(err);

        let error_type = std::any::type_name::<E>()
            .rsplit("::")
            .next()
            .unwrap_or("Error")
            .to_string();
        let fields = extra
            .with("request_id", &self.request_id)
            .with("method", &self.request.method)
            .with("path", &self.request.path)
            .with("response_time_ms", round_ms(self.timer.elapsed_ms()))
            .with("error_type", error_type)
            .with("error_message", err.to_string())
            .with("status_code", status_code);

        let message = format!(
            "Request failed: {} {}: {}",
            self.request.method, self.request.path, err
        );
        self.logger
            .log_event_with_level(REQUEST_ERROR_EVENT, &message, level::ERROR, fields);
    }
}
