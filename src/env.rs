//! Environment variable names read by [`TelemetryConfig::from_env`].
//!
//! These are purely helpers; the core types never read
//! the environment themselves.
//!
//! [`TelemetryConfig::from_env`]: crate::init::TelemetryConfig::from_env

/// Overrides the `service.name` resource attribute.
pub const OTEL_SERVICE_NAME_ENV: &str = "OTEL_SERVICE_NAME";

/// Deployment environment tag, e.g. `production`.
pub const ENVIRONMENT_ENV: &str = "ENVIRONMENT";

/// Span exporter selection: `console` or `otlp`.
pub const OTEL_TRACES_EXPORTER_ENV: &str = "OTEL_TRACES_EXPORTER";

/// OTLP collector base URL. Defaults to the protocol's standard port.
pub const OTEL_EXPORTER_OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// OTLP wire protocol: `grpc` (default) or `http/json`.
pub const OTEL_EXPORTER_OTLP_PROTOCOL_ENV: &str = "OTEL_EXPORTER_OTLP_PROTOCOL";

/// Capacity of the span queue in front of the batch processor.
pub const OTEL_BSP_MAX_QUEUE_SIZE_ENV: &str = "OTEL_BSP_MAX_QUEUE_SIZE";

/// Maximum number of spans per export call.
pub const OTEL_BSP_MAX_EXPORT_BATCH_SIZE_ENV: &str = "OTEL_BSP_MAX_EXPORT_BATCH_SIZE";

/// Delay between periodic flushes, in milliseconds.
pub const OTEL_BSP_SCHEDULE_DELAY_ENV: &str = "OTEL_BSP_SCHEDULE_DELAY";

/// Read `key` through `lookup`, falling back to `default`.
///
/// Empty values count as unset.
pub fn lookup_or<F>(lookup: F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Parse a numeric variable, keeping `default` when it is unset or malformed.
pub fn lookup_parsed<F, T>(lookup: F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring malformed numeric setting");
                default
            }
        },
        None => default,
    }
}
