use post_telemetry::fields;
use post_telemetry::init::init_telemetry;
use post_telemetry::record::level;
use post_telemetry::request::RequestInfo;
use serde_json::json;

#[tokio::main]
async fn main() {
    let telemetry = match init_telemetry() {
        Ok(telemetry) => telemetry,
        Err(e) => {
            eprintln!("telemetry init failed: {e}");
            return;
        }
    };

    // A post that converts its image and is stored.
    let request = RequestInfo::new("POST", "/tweet")
        .with_client_ip("127.0.0.1")
        .with_header("User-Agent", "post-flow-demo");
    let tracer = telemetry.tracer().clone();
    telemetry
        .handle_request(request, |scope| async move {
            scope.log_event(
                "tweet_post_start",
                "Starting tweet post",
                level::INFO,
                fields!(author = "bob", content_length = 11, has_image = true),
            );
            {
                let convert = tracer.start_span("convert_to_ascii");
                convert.set_attribute("ascii.width", 80);
                tokio::task::yield_now().await;
                scope.log_event(
                    "ascii_conversion_done",
                    "Image converted",
                    level::DEBUG,
                    fields!(width = 80, height = 24),
                );
            }
            let saved = json!({"id": "tweet-1", "author": "bob", "content": "hello world"});
            scope.finish(&saved, 201, fields!(tweet_id = "tweet-1"));
        })
        .await;

    // A listing that fails while reading storage.
    let scope = telemetry.begin_request(RequestInfo::from_target("GET", "/tweets?limit=10"));
    let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "tweets dir unreadable");
    scope.fail(&err, 500, fields!());

    if let Err(e) = telemetry.shutdown().await {
        eprintln!("shutdown failed: {e}");
    }
}
