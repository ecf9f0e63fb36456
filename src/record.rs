use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Placeholder stored in place of a field value that failed to serialize.
pub const UNSERIALIZABLE: &str = "<unserializable>";

/// Keys owned by the logger. Extra fields with these names are dropped.
pub const CORE_KEYS: [&str; 11] = [
    "timestamp",
    "level",
    "event_type",
    "message",
    "service",
    "version",
    "trace_id",
    "span_id",
    "http.status_code",
    "error.message",
    "error.type",
];

/// Level strings understood by the logger. Any casing is accepted.
pub mod level {
    pub const DEBUG: &str = "DEBUG";
    pub const INFO: &str = "INFO";
    pub const WARNING: &str = "WARNING";
    pub const ERROR: &str = "ERROR";
}

/// Map a caller-supplied level string onto a `tracing` level.
///
/// Unknown strings map to `INFO`.
pub fn tracing_level(level: &str) -> tracing::Level {
    match level.trim().to_ascii_uppercase().as_str() {
        "TRACE" => tracing::Level::TRACE,
        "DEBUG" => tracing::Level::DEBUG,
        "WARN" | "WARNING" => tracing::Level::WARN,
        "ERROR" | "CRITICAL" | "FATAL" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

/// Open-ended extra context attached to a log event.
///
/// Values are stored as JSON. Inserting a value that cannot be serialized
/// stores [`UNSERIALIZABLE`] instead of failing.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Fields(BTreeMap<String, Value>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`Fields::insert`].
    pub fn with<T: Serialize>(mut self, key: impl Into<String>, value: T) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert<T: Serialize>(&mut self, key: impl Into<String>, value: T) {
        self.0.insert(key.into(), to_field_value(&value));
    }

    pub fn insert_value(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Add every field of `other`, overwriting keys already present.
    pub fn merge(&mut self, other: Fields) {
        self.0.extend(other.0);
    }
}

impl From<BTreeMap<String, Value>> for Fields {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Fields(map)
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Fields {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Fields(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl IntoIterator for Fields {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Serialize `value` into a JSON field value, substituting
/// [`UNSERIALIZABLE`] on failure.
pub fn to_field_value<T: Serialize + ?Sized>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|_| Value::String(UNSERIALIZABLE.to_string()))
}

/// Build [`Fields`] inline.
///
/// ```
/// use post_telemetry::fields;
///
/// let f = fields!(author = "bob", content_length = 5, has_ascii = false);
/// assert_eq!(f.len(), 3);
///
/// let dotted = fields!("db.system" => "fs");
/// assert!(dotted.contains_key("db.system"));
/// ```
#[macro_export]
macro_rules! fields {
    () => {
        $crate::record::Fields::new()
    };
    ($($key:ident = $value:expr),+ $(,)?) => {{
        let mut fields = $crate::record::Fields::new();
        $( fields.insert(stringify!($key), $value); )+
        fields
    }};
    ($($key:literal => $value:expr),+ $(,)?) => {{
        let mut fields = $crate::record::Fields::new();
        $( fields.insert($key, $value); )+
        fields
    }};
}

/// One structured log record, serialized as a single JSON line.
///
/// Reserved caller keys `status_code`, `error_message` and `error_type` are
/// lifted into `http.status_code`, `error.message` and `error.type`. Null
/// values are never serialized.
#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub event_type: String,
    pub message: String,
    pub service: String,
    pub version: String,
    pub trace_id: String,
    pub span_id: String,
    #[serde(rename = "http.status_code", skip_serializing_if = "Option::is_none")]
    pub status_code: Option<Value>,
    #[serde(rename = "error.message", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<Value>,
    #[serde(rename = "error.type", skip_serializing_if = "Option::is_none")]
    pub error_type: Option<Value>,
    #[serde(flatten)]
    pub fields: Fields,
}

impl LogEvent {
    /// Shape a record from caller input. Service, version and correlation
    /// ids are left empty for the logger to fill in.
    pub fn new(event_type: &str, message: &str, level: &str, mut fields: Fields) -> Self {
        let event_type = match event_type.trim() {
            "" => "unknown".to_string(),
            t => t.to_string(),
        };
        let message = if message.trim().is_empty() {
            event_type.clone()
        } else {
            message.to_string()
        };

        let status_code = take_non_null(&mut fields, "status_code");
        let error_message = take_non_null(&mut fields, "error_message");
        let error_type = take_non_null(&mut fields, "error_type");

        fields
            .0
            .retain(|key, value| !value.is_null() && !CORE_KEYS.contains(&key.as_str()));

        LogEvent {
            timestamp: Utc::now(),
            level: level.to_string(),
            event_type,
            message,
            service: String::new(),
            version: String::new(),
            trace_id: String::new(),
            span_id: String::new(),
            status_code,
            error_message,
            error_type,
            fields,
        }
    }

    pub fn with_origin(mut self, service: &str, version: &str) -> Self {
        self.service = service.to_string();
        self.version = version.to_string();
        self
    }

    pub fn with_ids(mut self, trace_id: String, span_id: String) -> Self {
        self.trace_id = trace_id;
        self.span_id = span_id;
        self
    }

    /// Serialize to one line of JSON without the trailing newline.
    pub fn to_line(&self) -> String {
        match serde_json::to_string(self) {
            Ok(line) => line,
            Err(err) => serde_json::json!({
                "timestamp": self.timestamp,
                "level": self.level,
                "event_type": self.event_type,
                "message": self.message,
                "service": self.service,
                "version": self.version,
                "trace_id": self.trace_id,
                "span_id": self.span_id,
                "error.type": "LogSerializationError",
                "error.message": err.to_string(),
            })
            .to_string(),
        }
    }
}

fn take_non_null(fields: &mut Fields, key: &str) -> Option<Value> {
    fields.remove(key).filter(|v| !v.is_null())
}
