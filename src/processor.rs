use crate::exporter::SpanExporter;
use crate::span::SpanData;
use std::error::Error;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Queueing and batching knobs for [`BatchSpanProcessor`].
///
/// **Fields**
/// - `channel_buffer`: spans that may wait in the queue before new ones are
///   dropped.
/// - `batch_size`: spans per export call.
/// - `flush_interval`: longest time a partial batch waits before export.
/// - `max_export_attempts`: tries per batch before it is given up.
#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    pub channel_buffer: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_export_attempts: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            channel_buffer: 2048,
            batch_size: 512,
            flush_interval: Duration::from_secs(5),
            max_export_attempts: 3,
        }
    }
}

/// Errors reported by [`BatchSpanProcessor::force_flush`] and
/// [`BatchSpanProcessor::shutdown`].
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ProcessorError {
    #[error("span processor already shut down")]
    AlreadyShutdown,

    #[error("span processor task is no longer running")]
    ChannelClosed,

    #[error("final span export failed: {0}")]
    Export(String),
}

enum Control {
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<Result<(), String>>),
}

/// Buffers finished spans and hands them to a [`SpanExporter`] in batches
/// from a background task.
///
/// Producers only ever `try_send` into a bounded channel, so closing a span
/// never waits on exporter I/O.
pub struct BatchSpanProcessor {
    sender: mpsc::Sender<SpanData>,
    control: mpsc::UnboundedSender<Control>,
    /// Spans handed to the processor.
    pub total_spans: Arc<AtomicU64>,
    /// Spans accepted into the queue.
    pub enqueued_spans: Arc<AtomicU64>,
    /// Spans dropped because the queue was full or closed.
    pub dropped_spans: Arc<AtomicU64>,
    /// Spans the exporter accepted.
    pub exported_spans: Arc<AtomicU64>,
    is_shutdown: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BatchSpanProcessor {
    /// Create the processor and spawn its export task.
    ///
    /// Must be called from within a Tokio runtime. Minimal thresholds are
    /// enforced on the config to avoid degenerate setups.
    pub fn new(exporter: Arc<dyn SpanExporter>, config: ProcessorConfig) -> Self {
        let buffer = config.channel_buffer.max(16);
        let batch_size = config.batch_size.max(1);
        let flush_interval = config.flush_interval.max(Duration::from_millis(10));
        let max_attempts = config.max_export_attempts.max(1);

        let (tx, mut rx) = mpsc::channel::<SpanData>(buffer);
        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Control>();

        let exported_spans = Arc::new(AtomicU64::new(0));
        let exported_bg = Arc::clone(&exported_spans);

        let handle = tokio::spawn(async move {
            let mut batch: Vec<SpanData> = Vec::with_capacity(batch_size);
            let mut ticker = interval(flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    maybe_span = rx.recv() => match maybe_span {
                        Some(span) => {
                            batch.push(span);
                            if batch.len() >= batch_size {
                                let _ = export_pending(&*exporter, &mut batch, batch_size, max_attempts, &exported_bg).await;
                            }
                        }
                        None => {
                            // Processor dropped without shutdown.
                            let _ = export_pending(&*exporter, &mut batch, batch_size, max_attempts, &exported_bg).await;
                            if let Err(e) = exporter.flush().await {
                                tracing::warn!(error = %e, "span exporter flush failed");
                            }
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        if !batch.is_empty() {
                            let _ = export_pending(&*exporter, &mut batch, batch_size, max_attempts, &exported_bg).await;
                        }
                    }
                    Some(command) = control_rx.recv() => match command {
                        Control::Flush(reply) => {
                            drain_queue(&mut rx, &mut batch);
                            let _ = export_pending(&*exporter, &mut batch, batch_size, max_attempts, &exported_bg).await;
                            if let Err(e) = exporter.flush().await {
                                tracing::warn!(error = %e, "span exporter flush failed");
                            }
                            let _ = reply.send(());
                        }
                        Control::Shutdown(reply) => {
                            rx.close();
                            drain_queue(&mut rx, &mut batch);
                            let exported = export_pending(&*exporter, &mut batch, batch_size, max_attempts, &exported_bg).await;
                            let closed = exporter.shutdown().await.map_err(|e| e.to_string());
                            let _ = reply.send(exported.and(closed));
                            break;
                        }
                    }
                }
            }
        });

        Self {
            sender: tx,
            control: control_tx,
            total_spans: Arc::new(AtomicU64::new(0)),
            enqueued_spans: Arc::new(AtomicU64::new(0)),
            dropped_spans: Arc::new(AtomicU64::new(0)),
            exported_spans,
            is_shutdown: AtomicBool::new(false),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queue a finished span. Never blocks; drops the span when the queue
    /// is full or the processor has shut down.
    pub fn on_end(&self, span: SpanData) {
        self.total_spans.fetch_add(1, Ordering::Relaxed);
        match self.sender.try_send(span) {
            Ok(()) => {
                self.enqueued_spans.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_spans.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("span queue full, dropping span");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped_spans.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Export everything queued so far and wait for it.
    pub async fn force_flush(&self) -> Result<(), ProcessorError> {
        if self.is_shutdown.load(Ordering::Acquire) {
            return Err(ProcessorError::AlreadyShutdown);
        }
        let (reply, done) = oneshot::channel();
        self.control
            .send(Control::Flush(reply))
            .map_err(|_| ProcessorError::ChannelClosed)?;
        done.await.map_err(|_| ProcessorError::ChannelClosed)
    }

    /// Export everything queued, shut the exporter down and stop the
    /// background task. Spans closed afterwards are dropped.
    pub async fn shutdown(&self) -> Result<(), ProcessorError> {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            return Err(ProcessorError::AlreadyShutdown);
        }

        let (reply, done) = oneshot::channel();
        self.control
            .send(Control::Shutdown(reply))
            .map_err(|_| ProcessorError::ChannelClosed)?;
        let result = done.await.map_err(|_| ProcessorError::ChannelClosed)?;

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "span processor task ended abnormally");
            }
        }

        result.map_err(|e| {
            tracing::warn!(error = %e, "final span export failed");
            ProcessorError::Export(e)
        })
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::Acquire)
    }
}

fn drain_queue(rx: &mut mpsc::Receiver<SpanData>, batch: &mut Vec<SpanData>) {
    while let Ok(span) = rx.try_recv() {
        batch.push(span);
    }
}

/// Export `batch` in chunks of `batch_size`. Chunks that keep failing are
/// dropped; the last failure is returned.
async fn export_pending(
    exporter: &dyn SpanExporter,
    batch: &mut Vec<SpanData>,
    batch_size: usize,
    max_attempts: u32,
    exported: &AtomicU64,
) -> Result<(), String> {
    let mut outcome = Ok(());
    for chunk in batch.chunks(batch_size) {
        match export_with_retry(exporter, chunk, max_attempts).await {
            Ok(()) => {
                exported.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::warn!(spans = chunk.len(), error = %e, "dropping span batch after failed export");
                outcome = Err(e.to_string());
            }
        }
    }
    batch.clear();
    outcome
}

async fn export_with_retry(
    exporter: &dyn SpanExporter,
    chunk: &[SpanData],
    max_attempts: u32,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 1;
    loop {
        match exporter.export(chunk).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(e) => {
                tracing::warn!(attempt, error = %e, "span export failed, retrying in {:?}", backoff);
                sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_exporter::InMemorySpanExporter;
    use crate::span::{SpanContext, SpanKind, SpanStatus};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    fn span(name: &str) -> SpanData {
        let now = Utc::now();
        SpanData {
            name: name.to_string(),
            context: SpanContext::random(),
            parent_span_id: None,
            kind: SpanKind::Internal,
            start_time: now,
            end_time: now,
            status: SpanStatus::Ok,
            attributes: BTreeMap::new(),
            events: Vec::new(),
            instrumentation_scope: "test".to_string(),
        }
    }

    /// Fails the first `failures` export calls.
    struct FlakyExporter {
        failures: usize,
        calls: AtomicUsize,
        inner: InMemorySpanExporter,
    }

    #[async_trait]
    impl SpanExporter for FlakyExporter {
        async fn export(&self, batch: &[SpanData]) -> Result<(), Box<dyn Error + Send + Sync>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err("collector unavailable".into());
            }
            self.inner.export(batch).await
        }
    }

    #[tokio::test]
    async fn full_batches_are_exported_without_flush() {
        let exporter = InMemorySpanExporter::default();
        let config = ProcessorConfig {
            batch_size: 2,
            flush_interval: Duration::from_secs(3600),
            ..ProcessorConfig::default()
        };
        let processor = BatchSpanProcessor::new(Arc::new(exporter.clone()), config);

        processor.on_end(span("a"));
        processor.on_end(span("b"));

        for _ in 0..100 {
            if exporter.finished_spans().len() == 2 {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(exporter.finished_spans().len(), 2);
    }

    #[tokio::test]
    async fn shutdown_flushes_and_rejects_repeat() {
        let exporter = InMemorySpanExporter::default();
        let processor = BatchSpanProcessor::new(Arc::new(exporter.clone()), ProcessorConfig::default());

        for i in 0..5 {
            processor.on_end(span(&format!("s{i}")));
        }
        processor.shutdown().await.unwrap();

        assert_eq!(exporter.finished_spans().len(), 5);
        assert!(exporter.is_shutdown());
        assert_eq!(processor.exported_spans.load(Ordering::Relaxed), 5);
        assert_eq!(processor.shutdown().await, Err(ProcessorError::AlreadyShutdown));
        assert_eq!(processor.force_flush().await, Err(ProcessorError::AlreadyShutdown));

        processor.on_end(span("late"));
        assert_eq!(processor.dropped_spans.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn transient_export_failures_are_retried() {
        let inner = InMemorySpanExporter::default();
        let exporter = Arc::new(FlakyExporter {
            failures: 1,
            calls: AtomicUsize::new(0),
            inner: inner.clone(),
        });
        let processor = BatchSpanProcessor::new(exporter.clone(), ProcessorConfig::default());

        processor.on_end(span("retry-me"));
        processor.force_flush().await.unwrap();

        assert_eq!(inner.finished_spans().len(), 1);
        assert_eq!(exporter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persistent_failure_surfaces_on_shutdown() {
        let exporter = Arc::new(FlakyExporter {
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
            inner: InMemorySpanExporter::default(),
        });
        let config = ProcessorConfig {
            max_export_attempts: 1,
            ..ProcessorConfig::default()
        };
        let processor = BatchSpanProcessor::new(exporter, config);

        processor.on_end(span("doomed"));
        let err = processor.shutdown().await.unwrap_err();
        assert!(matches!(err, ProcessorError::Export(_)));
        assert_eq!(processor.exported_spans.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let exporter = InMemorySpanExporter::default();
        let config = ProcessorConfig {
            channel_buffer: 16,
            batch_size: 10_000,
            flush_interval: Duration::from_secs(3600),
            ..ProcessorConfig::default()
        };
        let processor = BatchSpanProcessor::new(Arc::new(exporter.clone()), config);

        // The background task cannot run while this test body holds the
        // current-thread runtime, so the queue fills up.
        for i in 0..20 {
            processor.on_end(span(&format!("s{i}")));
        }
        assert_eq!(processor.total_spans.load(Ordering::Relaxed), 20);
        assert_eq!(processor.enqueued_spans.load(Ordering::Relaxed), 16);
        assert_eq!(processor.dropped_spans.load(Ordering::Relaxed), 4);

        processor.force_flush().await.unwrap();
        assert_eq!(exporter.finished_spans().len(), 16);
    }
}
