use crate::console::ConsoleSpanExporter;
use crate::resource::Resource;
use crate::span::SpanData;
use async_trait::async_trait;
use std::error::Error;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Asynchronous destination for finished spans.
///
/// Implementations transport [`SpanData`] to a concrete backend (console,
/// OTLP collector, memory). The batch processor calls them from its
/// background task and never from the thread that closed the span.
#[async_trait]
pub trait SpanExporter: Send + Sync {
    /// Export one batch of spans.
    ///
    /// **Returns**
    /// - `Ok(())` if the backend accepted the batch.
    /// - `Err(..)` on any failure (network, serialization, HTTP status).
    ///   The processor treats this as transient and retries the batch with
    ///   backoff up to its attempt limit.
    async fn export(&self, batch: &[SpanData]) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Flush anything the exporter buffers itself. Default is a no-op.
    async fn flush(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }

    /// Release resources. Called once, after the final export.
    async fn shutdown(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.flush().await
    }
}

/// Exporter implementations selectable through configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExporterKind {
    #[default]
    Console,
    Otlp,
}

impl fmt::Display for ExporterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExporterKind::Console => f.write_str("console"),
            ExporterKind::Otlp => f.write_str("otlp"),
        }
    }
}

/// Error returned when an exporter name is not recognised.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("unknown span exporter {0:?}, expected \"console\" or \"otlp\"")]
pub struct ExporterKindError(pub String);

impl FromStr for ExporterKind {
    type Err = ExporterKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "console" => Ok(ExporterKind::Console),
            "otlp" => Ok(ExporterKind::Otlp),
            other => Err(ExporterKindError(other.to_string())),
        }
    }
}

/// Default collector address for OTLP over gRPC.
pub const DEFAULT_OTLP_GRPC_ENDPOINT: &str = "http://localhost:4317";

/// Default collector address for OTLP over HTTP.
pub const DEFAULT_OTLP_HTTP_ENDPOINT: &str = "http://localhost:4318";

/// Wire protocol used by the OTLP exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OtlpProtocol {
    #[default]
    Grpc,
    HttpJson,
}

impl OtlpProtocol {
    /// Standard collector port for the protocol.
    pub fn default_endpoint(self) -> &'static str {
        match self {
            OtlpProtocol::Grpc => DEFAULT_OTLP_GRPC_ENDPOINT,
            OtlpProtocol::HttpJson => DEFAULT_OTLP_HTTP_ENDPOINT,
        }
    }
}

impl fmt::Display for OtlpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OtlpProtocol::Grpc => f.write_str("grpc"),
            OtlpProtocol::HttpJson => f.write_str("http/json"),
        }
    }
}

/// Error returned when an OTLP protocol name is not supported.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("unsupported OTLP protocol {0:?}, expected \"grpc\" or \"http/json\"")]
pub struct OtlpProtocolError(pub String);

impl FromStr for OtlpProtocol {
    type Err = OtlpProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "grpc" => Ok(OtlpProtocol::Grpc),
            "http/json" | "http" => Ok(OtlpProtocol::HttpJson),
            other => Err(OtlpProtocolError(other.to_string())),
        }
    }
}

/// Build the exporter for `kind`.
///
/// Never fails: when OTLP support is not compiled in, or its client cannot
/// be built, a warning is logged and the console exporter is used instead.
/// Returns the exporter together with the kind actually selected.
///
/// `otlp_endpoint` defaults to the standard port of `protocol`. Building
/// the gRPC exporter requires a Tokio runtime.
pub fn make_exporter(
    kind: ExporterKind,
    protocol: OtlpProtocol,
    otlp_endpoint: Option<&str>,
    resource: Arc<Resource>,
) -> (Arc<dyn SpanExporter>, ExporterKind) {
    match kind {
        ExporterKind::Console => (
            Arc::new(ConsoleSpanExporter::stdout(resource)),
            ExporterKind::Console,
        ),
        ExporterKind::Otlp => {
            #[cfg(feature = "otlp")]
            {
                use crate::otlp::{OtlpConfig, OtlpSpanExporter};

                let mut config = OtlpConfig::new(protocol);
                if let Some(endpoint) = otlp_endpoint {
                    config = config.with_endpoint(endpoint);
                }
                match OtlpSpanExporter::new(config, Arc::clone(&resource)) {
                    Ok(exporter) => (Arc::new(exporter), ExporterKind::Otlp),
                    Err(e) => {
                        tracing::warn!(error = %e, "OTLP exporter unavailable, falling back to console");
                        (
                            Arc::new(ConsoleSpanExporter::stdout(resource)),
                            ExporterKind::Console,
                        )
                    }
                }
            }

            #[cfg(not(feature = "otlp"))]
            {
                tracing::warn!(
                    endpoint = otlp_endpoint.unwrap_or(protocol.default_endpoint()),
                    "built without the `otlp` feature, falling back to console span exporter"
                );
                (
                    Arc::new(ConsoleSpanExporter::stdout(resource)),
                    ExporterKind::Console,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exporter_names_parse_case_insensitively() {
        assert_eq!("console".parse::<ExporterKind>(), Ok(ExporterKind::Console));
        assert_eq!(" OTLP ".parse::<ExporterKind>(), Ok(ExporterKind::Otlp));
        assert_eq!("".parse::<ExporterKind>(), Ok(ExporterKind::Console));
        assert_eq!(
            "jaeger".parse::<ExporterKind>(),
            Err(ExporterKindError("jaeger".to_string()))
        );
    }

    #[test]
    fn protocols_parse_and_pick_standard_ports() {
        assert_eq!("".parse::<OtlpProtocol>(), Ok(OtlpProtocol::Grpc));
        assert_eq!("GRPC".parse::<OtlpProtocol>(), Ok(OtlpProtocol::Grpc));
        assert_eq!("http/json".parse::<OtlpProtocol>(), Ok(OtlpProtocol::HttpJson));
        assert_eq!(
            "http/protobuf".parse::<OtlpProtocol>(),
            Err(OtlpProtocolError("http/protobuf".to_string()))
        );
        assert_eq!(OtlpProtocol::Grpc.default_endpoint(), "http://localhost:4317");
        assert_eq!(OtlpProtocol::HttpJson.default_endpoint(), "http://localhost:4318");
    }

    #[test]
    fn console_selection_is_honoured() {
        let resource = Arc::new(Resource::default());
        let (_, kind) = make_exporter(ExporterKind::Console, OtlpProtocol::Grpc, None, resource);
        assert_eq!(kind, ExporterKind::Console);
    }

    #[cfg(feature = "otlp")]
    #[tokio::test]
    async fn otlp_selection_builds_otlp_exporter() {
        for protocol in [OtlpProtocol::Grpc, OtlpProtocol::HttpJson] {
            let resource = Arc::new(Resource::default());
            let (_, kind) = make_exporter(ExporterKind::Otlp, protocol, None, resource);
            assert_eq!(kind, ExporterKind::Otlp, "{protocol}");
        }
    }

    #[cfg(feature = "otlp")]
    #[tokio::test]
    async fn bad_otlp_endpoint_falls_back_to_console() {
        let resource = Arc::new(Resource::default());
        let (_, kind) = make_exporter(
            ExporterKind::Otlp,
            OtlpProtocol::Grpc,
            Some("collector:4317"),
            resource,
        );
        assert_eq!(kind, ExporterKind::Console);
    }

    #[cfg(not(feature = "otlp"))]
    #[test]
    fn otlp_without_feature_falls_back_to_console() {
        let resource = Arc::new(Resource::default());
        let (_, kind) = make_exporter(ExporterKind::Otlp, OtlpProtocol::Grpc, None, resource);
        assert_eq!(kind, ExporterKind::Console);
    }
}
