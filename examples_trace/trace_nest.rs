use post_telemetry::fields;
use post_telemetry::init::init_telemetry;
use post_telemetry::record::level;
use post_telemetry::span::SpanStatus;

#[tokio::main]
async fn main() {
    let telemetry = match init_telemetry() {
        Ok(telemetry) => telemetry,
        Err(e) => {
            eprintln!("telemetry init failed: {e}");
            return;
        }
    };
    let tracer = telemetry.tracer();

    let parent = tracer.start_span("parent_endpoint_span");
    parent.set_attribute("endpoint", "/trace-demo");
    telemetry.log_event("trace_demo_start", "parent span opened", level::INFO, fields!());

    {
        let level1 = tracer.start_span("child_func_level1_span");
        level1.set_attribute("depth", 1);
        {
            let level2 = tracer.start_span("child_func_level2_span");
            level2.set_attribute("depth", 2);
            level2.add_event("work_done", [("items", 3)]);
            telemetry.log_event("trace_demo_leaf", "deepest span", level::DEBUG, fields!(depth = 2));
        }
    }

    let converted: Result<(), std::num::ParseIntError> =
        tracer.in_span("parse_dimensions", |_| "80x24".parse::<u32>().map(|_| ()));
    if let Err(e) = converted {
        telemetry.log_event(
            "trace_demo_error",
            "dimension parsing failed",
            level::WARNING,
            fields!(error_type = "ParseIntError", error_message = e.to_string()),
        );
        parent.set_status(SpanStatus::error("child failed"));
    }
    drop(parent);

    if let Err(e) = telemetry.shutdown().await {
        eprintln!("shutdown failed: {e}");
    }
}
