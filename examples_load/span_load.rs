use std::sync::Arc;
use std::time::Instant;
use tokio::time::Duration;

use post_telemetry::init::{Telemetry, TelemetryConfig};
use post_telemetry::noop_exporter::NoopSpanExporter;
use post_telemetry::processor::ProcessorConfig;

#[tokio::main]
async fn main() {
    let config = TelemetryConfig {
        processor: ProcessorConfig {
            channel_buffer: 50_000,
            batch_size: 1_000,
            flush_interval: Duration::from_millis(200),
            ..ProcessorConfig::default()
        },
        enable_stderr: false,
        ..TelemetryConfig::default()
    };

    let telemetry = match Telemetry::new(&config, Arc::new(NoopSpanExporter)) {
        Ok(telemetry) => telemetry,
        Err(e) => {
            eprintln!("failed to build telemetry: {e}");
            return;
        }
    };

    let n: u64 = 100_000;
    let start = Instant::now();

    for i in 0..n {
        let span = telemetry.tracer().start_span("load_span");
        span.set_attribute("iteration", i);
    }

    let elapsed = start.elapsed();
    println!("span load: recorded {} spans in {:?} (~{:.0} spans/s)",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64()
    );

    if let Err(e) = telemetry.shutdown().await {
        eprintln!("shutdown failed: {e}");
    }

    let processor = telemetry.processor();
    println!("total={} exported={} dropped={}",
        processor.total_spans.load(std::sync::atomic::Ordering::Relaxed),
        processor.exported_spans.load(std::sync::atomic::Ordering::Relaxed),
        processor.dropped_spans.load(std::sync::atomic::Ordering::Relaxed),
    );
}
