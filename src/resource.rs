use serde::Serialize;
use std::collections::BTreeMap;

/// Fallback `service.name` when `OTEL_SERVICE_NAME` is not set.
pub const DEFAULT_SERVICE_NAME: &str = "ascii-post-backend";

/// Version reported as `service.version` and in every log event.
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fallback `deployment.environment`.
pub const DEFAULT_ENVIRONMENT: &str = "development";

/// Static metadata describing this process, attached to every exported
/// span and used as the `service` / `version` of every log event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resource {
    pub service_name: String,
    pub service_version: String,
    pub environment: String,
}

impl Default for Resource {
    fn default() -> Self {
        Resource::new(DEFAULT_SERVICE_NAME, DEFAULT_ENVIRONMENT)
    }
}

impl Resource {
    pub fn new(service_name: impl Into<String>, environment: impl Into<String>) -> Self {
        Resource {
            service_name: service_name.into(),
            service_version: SERVICE_VERSION.to_string(),
            environment: environment.into(),
        }
    }

    /// Attributes under their semantic-convention keys.
    pub fn attributes(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("service.name", self.service_name.clone()),
            ("service.version", self.service_version.clone()),
            ("deployment.environment", self.environment.clone()),
            ("telemetry.sdk.name", env!("CARGO_PKG_NAME").to_string()),
            ("telemetry.sdk.language", "rust".to_string()),
        ])
    }
}
