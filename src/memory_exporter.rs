use crate::exporter::SpanExporter;
use crate::span::SpanData;
use async_trait::async_trait;
use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Keeps every exported span in memory. Clones share storage.
#[derive(Clone, Default)]
pub struct InMemorySpanExporter {
    spans: Arc<Mutex<Vec<SpanData>>>,
    shut_down: Arc<AtomicBool>,
}

impl InMemorySpanExporter {
    /// Spans exported so far, in export order.
    pub fn finished_spans(&self) -> Vec<SpanData> {
        self.spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// First exported span with the given name.
    pub fn span_named(&self, name: &str) -> Option<SpanData> {
        self.finished_spans().into_iter().find(|s| s.name == name)
    }

    pub fn reset(&self) {
        self.spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

#[async_trait]
impl SpanExporter for InMemorySpanExporter {
    async fn export(&self, batch: &[SpanData]) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(batch);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.shut_down.store(true, Ordering::Release);
        Ok(())
    }
}
