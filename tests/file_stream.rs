//! File Stream Tests
//!
//! End-to-end uploader behavior against a scripted transport: data posts,
//! status posts, dropped-data accounting, collector limits and the finish
//! sentinel.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use telemetry_core::config::DynamicSettings;
use telemetry_core::ServiceConfig;
use telemetry_core::filestream::{
    BinaryFilePolicy, Chunk, CrDedupeFilePolicy, FileOutput, FilePolicy, FileStream, FileStreamConfig,
    FileStreamError, HttpResponse, HttpTransport, JsonlFilePolicy, MockTransport, RetryPolicy, SummaryFilePolicy,
};

fn settings() -> DynamicSettings {
    let settings = DynamicSettings::new();
    settings.set("base_url", json!("https://collector.test"));
    settings.set("entity", json!("team"));
    settings.set("project", json!("vision"));
    settings
}

fn fast_config() -> FileStreamConfig {
    FileStreamConfig {
        retry: RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
        },
        ..FileStreamConfig::default()
    }
}

fn start(transport: &Arc<MockTransport>, settings: DynamicSettings) -> FileStream {
    FileStream::start(fast_config(), settings, transport.clone(), "run-1").unwrap()
}

fn data_posts(bodies: &[Value]) -> Vec<&Value> {
    bodies.iter().filter(|b| b.get("files").is_some()).collect()
}

// =============================================================================
// Data and final posts
// =============================================================================

#[test]
fn test_chunks_then_final_post() {
    let transport = Arc::new(MockTransport::new());
    let mut stream = start(&transport, settings());

    stream.push("output.log", "a");
    stream.push("output.log", "b");
    stream.push("events.txt", "x");
    stream.finish(0).unwrap();

    let requests = transport.requests();
    assert!(requests
        .iter()
        .all(|r| r.url == "https://collector.test/files/team/vision/run-1/file_stream"));

    let bodies = transport.bodies();
    assert_eq!(bodies.len(), 2, "one data post and the final post: {:?}", bodies);
    assert_eq!(
        bodies[0],
        json!({
            "files": {
                "events.txt": {"offset": 0, "content": ["x"]},
                "output.log": {"offset": 0, "content": ["a", "b"]},
            },
            "dropped": 0,
        })
    );
    assert_eq!(
        bodies[1],
        json!({"complete": true, "exitcode": 0, "dropped": 0, "uploaded": []})
    );
}

#[test]
fn test_finish_with_nothing_queued() {
    let transport = Arc::new(MockTransport::new());
    let mut stream = start(&transport, settings());
    stream.finish(7).unwrap();

    assert_eq!(
        transport.bodies(),
        vec![json!({"complete": true, "exitcode": 7, "dropped": 0, "uploaded": []})]
    );
}

#[test]
fn test_items_after_finish_are_ignored() {
    let transport = Arc::new(MockTransport::new());
    let mut stream = start(&transport, settings());
    let handle = stream.handle();

    handle.push("a.txt", "before");
    stream.finish(0).unwrap();
    handle.push("a.txt", "after");
    handle.enqueue_preempting();

    let bodies = transport.bodies();
    assert_eq!(bodies.len(), 2);
    assert!(!bodies.iter().any(|b| b.to_string().contains("after")));
    assert!(!bodies.iter().any(|b| b.get("preempting").is_some()));
}

#[test]
fn test_handles_push_from_many_threads() {
    let transport = Arc::new(MockTransport::new());
    let mut stream = start(&transport, settings());

    let workers: Vec<_> = (0..4)
        .map(|t| {
            let handle = stream.handle();
            std::thread::spawn(move || {
                for i in 0..25 {
                    handle.push(format!("thread-{}.log", t), format!("{}", i));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    stream.finish(0).unwrap();

    let bodies = transport.bodies();
    for t in 0..4 {
        let name = format!("thread-{}.log", t);
        let lines: Vec<String> = data_posts(&bodies)
            .iter()
            .filter_map(|b| b["files"].get(&name))
            .flat_map(|f| f["content"].as_array().cloned().unwrap_or_default())
            .map(|v| v.as_str().unwrap_or_default().to_string())
            .collect();
        let expected: Vec<String> = (0..25).map(|i| i.to_string()).collect();
        assert_eq!(lines, expected, "order preserved for {}", name);
    }
}

// =============================================================================
// Status posts
// =============================================================================

#[test]
fn test_preempting_posts_immediately() {
    let transport = Arc::new(MockTransport::new());
    let mut stream = start(&transport, settings());

    stream.push_success("artifact-1", "model.h5");
    stream.enqueue_preempting();
    stream.finish(0).unwrap();

    let bodies = transport.bodies();
    assert_eq!(
        bodies[0],
        json!({"complete": false, "preempting": true, "dropped": 0, "uploaded": ["model.h5"]})
    );
    // the uploaded set was reported and reset
    assert_eq!(bodies.last().unwrap()["uploaded"], json!([]));
}

#[test]
fn test_uploaded_names_reported_on_finish() {
    let transport = Arc::new(MockTransport::new());
    let mut stream = start(&transport, settings());

    stream.push_success("artifact-2", "weights.bin");
    stream.push_success("artifact-1", "config.yaml");
    stream.finish(0).unwrap();

    let last = transport.bodies().pop().unwrap();
    assert_eq!(last["complete"], json!(true));
    assert_eq!(last["uploaded"], json!(["config.yaml", "weights.bin"]));
}

#[test]
fn test_heartbeat_when_idle() {
    let settings = settings();
    settings.set("heartbeat_seconds", json!(0.05));

    let transport = Arc::new(MockTransport::new());
    let mut stream = start(&transport, settings);
    // the first queue wait is bounded by the 1s minimum rate limit
    std::thread::sleep(Duration::from_millis(1500));
    stream.finish(0).unwrap();

    let bodies = transport.bodies();
    assert!(
        bodies
            .iter()
            .any(|b| *b == json!({"complete": false, "failed": false, "dropped": 0, "uploaded": []})),
        "expected a heartbeat: {:?}",
        bodies
    );
}

// =============================================================================
// Failures and limits
// =============================================================================

#[test]
fn test_failed_post_counts_as_dropped() {
    let transport = Arc::new(MockTransport::new());
    transport.push_status(404);

    let mut stream = start(&transport, settings());
    stream.push("output.log", "lost");
    stream.finish(1).unwrap();

    assert_eq!(stream.dropped_chunks(), 1);
    let bodies = transport.bodies();
    assert_eq!(bodies.len(), 2, "404 is not retried");
    assert_eq!(
        bodies[1],
        json!({"complete": true, "exitcode": 1, "dropped": 1, "uploaded": []})
    );
}

#[test]
fn test_transient_failures_are_retried() {
    let transport = Arc::new(MockTransport::new());
    transport.push_status(503);
    transport.push_status(429);

    let mut stream = start(&transport, settings());
    stream.push("output.log", "kept");
    stream.finish(0).unwrap();

    let bodies = transport.bodies();
    assert_eq!(data_posts(&bodies).len(), 3);
    assert_eq!(stream.dropped_chunks(), 0);
    assert_eq!(bodies.last().unwrap()["dropped"], json!(0));
}

#[test]
fn test_rate_limit_callback() {
    let transport = Arc::new(MockTransport::new());
    transport.push_status(429);

    let messages = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&messages);
    let mut stream = FileStream::start_with_callback(
        fast_config(),
        settings(),
        transport.clone(),
        "run-1",
        Some(Arc::new(move |status: u16, message: &str| {
            seen.lock().push((status, message.to_string()));
        })),
    )
    .unwrap();
    stream.push("output.log", "x");
    stream.finish(0).unwrap();

    let messages = messages.lock();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].0, 429);
    assert!(messages[0].1.contains("rate limit"));
}

#[test]
fn test_limits_merged_into_settings() {
    let transport = Arc::new(MockTransport::new());
    transport.push_result(Ok(HttpResponse::ok(r#"{"limits": {"heartbeat_seconds": 3}}"#)));

    let settings = settings();
    let mut stream = start(&transport, settings.clone());
    stream.push("output.log", "x");
    stream.finish(0).unwrap();

    assert_eq!(settings.heartbeat(), Duration::from_secs(3));
}

#[test]
fn test_oversized_heartbeat_limit_does_not_stop_worker() {
    let transport = Arc::new(MockTransport::new());
    transport.push_result(Ok(HttpResponse::ok(r#"{"limits": {"heartbeat_seconds": 1e20}}"#)));

    let mut stream = start(&transport, settings());
    stream.push("a.txt", "x");
    stream.finish(0).unwrap();

    let bodies = transport.bodies();
    assert_eq!(bodies.len(), 2);
    assert_eq!(
        bodies[1],
        json!({"complete": true, "exitcode": 0, "dropped": 0, "uploaded": []})
    );
}

// =============================================================================
// Policies
// =============================================================================

#[test]
fn test_summary_policy_sends_latest_only() {
    let transport = Arc::new(MockTransport::new());
    let mut stream = start(&transport, settings());

    stream.set_file_policy("summary.json", SummaryFilePolicy::new());
    stream.push("summary.json", r#"{"acc": 0.1}"#);
    stream.push("summary.json", r#"{"acc": 0.9}"#);
    stream.finish(0).unwrap();

    let bodies = transport.bodies();
    assert_eq!(
        bodies[0]["files"]["summary.json"],
        json!({"offset": 0, "content": [r#"{"acc": 0.9}"#]})
    );
}

#[test]
fn test_default_policy_does_not_replace() {
    let transport = Arc::new(MockTransport::new());
    let mut stream = start(&transport, settings());

    stream.set_file_policy("blob.bin", BinaryFilePolicy::new());
    stream.set_default_file_policy("blob.bin", SummaryFilePolicy::new());
    stream.push("blob.bin", vec![0u8, 1, 2]);
    stream.finish(0).unwrap();

    assert_eq!(
        transport.bodies()[0]["files"]["blob.bin"],
        json!({"offset": 0, "content": "AAEC", "encoding": "base64"})
    );
}

#[test]
fn test_jsonl_rejections_count_as_dropped() {
    let transport = Arc::new(MockTransport::new());
    let mut stream = start(&transport, settings());

    stream.set_file_policy("history.jsonl", JsonlFilePolicy::with_max_line_bytes(16));
    stream.push("history.jsonl", r#"{"a": 1}"#);
    stream.push("history.jsonl", r#"{"way_too_long": "xxxxxxxxxxxxxxxx"}"#);
    stream.finish(0).unwrap();

    assert_eq!(stream.dropped_chunks(), 1);
    let bodies = transport.bodies();
    assert_eq!(
        bodies[0],
        json!({
            "files": {"history.jsonl": {"offset": 0, "content": [r#"{"a": 1}"#]}},
            "dropped": 1,
        })
    );
}

#[test]
fn test_console_redraw_reaches_collector() {
    let transport = Arc::new(MockTransport::new());
    let mut stream = start(&transport, settings());

    stream.set_file_policy("output.log", CrDedupeFilePolicy::new());
    stream.push("output.log", "T0 epoch 1\n");
    stream.push("output.log", "T1 progress 10%\n");
    stream.push("output.log", "T2 \rprogress 100%\n");
    stream.finish(0).unwrap();

    assert_eq!(
        transport.bodies()[0]["files"]["output.log"],
        json!([
            {"offset": 1, "content": ["T2 progress 100%\n"]},
            {"offset": 0, "content": ["T0 epoch 1\n"]},
        ])
    );
}

// =============================================================================
// Worker faults
// =============================================================================

struct ExplodingPolicy;

impl FilePolicy for ExplodingPolicy {
    fn process_chunks(&mut self, _chunks: &[Chunk]) -> Option<FileOutput> {
        panic!("policy exploded");
    }
}

#[test]
fn test_worker_panic_surfaces_from_finish() {
    let transport = Arc::new(MockTransport::new());
    let mut stream = start(&transport, settings());

    stream.set_file_policy("bad.txt", ExplodingPolicy);
    stream.push("bad.txt", "boom");

    match stream.finish(0) {
        Err(FileStreamError::WorkerPanicked(message)) => assert!(message.contains("policy exploded")),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn test_uploader_built_from_service_config() {
    let cli = json!({
        "api": {"base_url": "https://collector.test/", "entity": "team", "project": "vision"},
        "filestream": {"retry": {"max_retries": 1}},
    });
    let config = ServiceConfig::build(None, |_: &str| None, Some(cli)).unwrap();
    assert!(HttpTransport::new(config.http_transport_config()).is_ok());

    let transport = Arc::new(MockTransport::new());
    let mut stream = FileStream::start(
        config.file_stream_config(),
        config.dynamic_settings(),
        transport.clone(),
        "run-9",
    )
    .unwrap();
    stream.finish(0).unwrap();

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].url, "https://collector.test/files/team/vision/run-9/file_stream");
}

#[test]
fn test_missing_settings_rejected_at_start() {
    let transport = Arc::new(MockTransport::new());
    let result = FileStream::start(fast_config(), DynamicSettings::new(), transport, "run-1");
    assert!(matches!(result, Err(FileStreamError::MissingSetting("base_url"))));
}
