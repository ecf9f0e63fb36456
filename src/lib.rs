pub mod record;
pub mod event;
pub mod request;
pub mod span;
pub mod processor;
pub mod exporter;
pub mod console;

#[cfg(feature = "otlp")]
pub mod otlp;

pub mod resource;
pub mod env;
pub mod init;
pub mod memory_exporter;
pub mod noop_exporter;
pub mod writer;
