use std::time::Instant;

use post_telemetry::event::EventLogger;
use post_telemetry::fields;
use post_telemetry::resource::Resource;

fn main() {
    // Discard output so the numbers measure record building, not the terminal.
    let logger = EventLogger::with_writer(&Resource::default(), std::io::sink);

    let n: u64 = 100_000;
    let start = Instant::now();

    for i in 0..n {
        logger.log_event(
            "tweet_post_start",
            "load test event",
            fields!(iteration = i, author = "load", has_ascii = i % 2 == 0),
        );
    }

    let elapsed = start.elapsed();
    println!("event load: logged {} events in {:?} (~{:.0} ev/s)",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64()
    );
}
