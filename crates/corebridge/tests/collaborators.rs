mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use common::{serve_upstream, wait_until, TestServer};
use corebridge::transfer::PROGRESS_STEP;
use event_bus::Subscriber;
use serde_json::{json, Value};
use tokio::sync::mpsc;

const PAYLOAD_LEN: usize = 300 * 1024;

async fn upstream() -> String {
    let app = Router::new()
        .route(
            "/hello",
            get(|| async { (StatusCode::ACCEPTED, [("x-upstream", "yes")], "hi there") }),
        )
        .route("/echo", post(|body: String| async move { body }))
        .route(
            "/form",
            post(|headers: HeaderMap, body: String| async move {
                let content_type = headers
                    .get("content-type")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                format!("{content_type}\n{body}")
            }),
        )
        .route(
            "/moved",
            get(|| async {
                (StatusCode::FOUND, [("location", "/hello")], "").into_response()
            }),
        )
        .route("/blob", get(|| async { vec![7u8; PAYLOAD_LEN] }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "late"
            }),
        );
    let addr = serve_upstream(app).await;
    format!("http://{addr}")
}

fn listen(server: &TestServer, event: &str) -> (Arc<Subscriber>, mpsc::Receiver<Arc<str>>) {
    let (subscriber, rx) = Subscriber::new(256);
    server.state.bus.attach(&subscriber);
    server.state.bus.subscribe(event, &subscriber);
    (subscriber, rx)
}

fn drain(rx: &mut mpsc::Receiver<Arc<str>>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(serde_json::from_str(&frame).unwrap());
    }
    frames
}

#[tokio::test]
async fn request_returns_status_headers_and_body() {
    let server = TestServer::start().await;
    let token = server.login().await;
    let base = upstream().await;

    let (status, result) = server
        .call(
            &token,
            "/api/http/request",
            json!({ "method": "get", "url": format!("{base}/hello") }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(result["ok"], true);
    assert_eq!(result["status"], 202);
    assert_eq!(result["headers"]["x-upstream"], json!(["yes"]));
    assert_eq!(result["body"], "hi there");
}

#[tokio::test]
async fn request_sends_body_and_headers() {
    let server = TestServer::start().await;
    let token = server.login().await;
    let base = upstream().await;

    let (_, result) = server
        .call(
            &token,
            "/api/http/request",
            json!({
                "method": "POST",
                "url": format!("{base}/echo"),
                "headers": { "content-type": "text/plain" },
                "body": "ping",
            }),
        )
        .await;
    assert_eq!(result["ok"], true);
    assert_eq!(result["body"], "ping");
}

#[tokio::test]
async fn redirects_are_followed_only_on_request() {
    let server = TestServer::start().await;
    let token = server.login().await;
    let base = upstream().await;

    let (_, held) = server
        .call(
            &token,
            "/api/http/request",
            json!({ "url": format!("{base}/moved") }),
        )
        .await;
    assert_eq!(held["status"], 302);

    let (_, followed) = server
        .call(
            &token,
            "/api/http/request",
            json!({ "url": format!("{base}/moved"), "options": { "redirect": true } }),
        )
        .await;
    assert_eq!(followed["status"], 202);
    assert_eq!(followed["body"], "hi there");
}

#[tokio::test]
async fn transport_failure_is_reported_in_the_body() {
    let server = TestServer::start().await;
    let token = server.login().await;
    let closed = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let (status, result) = server
        .call(
            &token,
            "/api/http/request",
            json!({ "url": format!("http://127.0.0.1:{closed}/") }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(result["ok"], false);
    assert_eq!(result["status"], 500);
    assert!(!result["body"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn request_is_cancelled_by_client_emit() {
    let server = TestServer::start().await;
    let token = server.login().await;
    let base = upstream().await;

    let call = {
        let client = server.client.clone();
        let url = server.url("/api/http/request");
        let token = token.clone();
        tokio::spawn(async move {
            client
                .post(url)
                .bearer_auth(token)
                .json(&json!({
                    "url": format!("{base}/slow"),
                    "options": { "cancelId": "cancel-1" },
                }))
                .send()
                .await
                .unwrap()
                .json::<Value>()
                .await
                .unwrap()
        })
    };

    let bus = &server.state.bus;
    wait_until("cancel handler", || bus.handler_count("cancel-1") == 1).await;
    assert_eq!(bus.dispatch_from_connection("cancel-1", &[]), 1);

    let result = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .expect("request was not cancelled")
        .unwrap();
    assert_eq!(result["ok"], false);
    assert_eq!(result["body"], "request cancelled");
    assert_eq!(bus.handler_count("cancel-1"), 0);
}

#[tokio::test]
async fn download_writes_file_and_reports_progress() {
    let server = TestServer::start().await;
    let token = server.login().await;
    let base = upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("blob.bin");
    let (_sub, mut rx) = listen(&server, "dl-progress");

    let (status, result) = server
        .call(
            &token,
            "/api/http/download",
            json!({
                "url": format!("{base}/blob"),
                "path": path,
                "event": "dl-progress",
            }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(result["ok"], true);
    assert_eq!(result["body"], "Success");
    assert_eq!(std::fs::read(&path).unwrap(), vec![7u8; PAYLOAD_LEN]);

    let total = PAYLOAD_LEN as i64;
    let reports: Vec<[i64; 2]> = drain(&mut rx)
        .iter()
        .map(|frame| {
            assert_eq!(frame["event"], "dl-progress");
            let payload = frame["payload"].as_array().unwrap();
            [payload[0].as_i64().unwrap(), payload[1].as_i64().unwrap()]
        })
        .collect();

    assert_eq!(reports.last(), Some(&[total, total]));
    assert!(reports.iter().all(|[_, t]| *t == total));
    assert!(reports.windows(2).all(|w| w[1][0] > w[0][0]));
    assert!(
        reports.windows(2).all(|w| w[1][0] - w[0][0] >= PROGRESS_STEP as i64 || w[1][0] == total),
        "{reports:?}"
    );
}

#[tokio::test]
async fn download_failure_leaves_ok_false() {
    let server = TestServer::start().await;
    let token = server.login().await;
    let dir = tempfile::tempdir().unwrap();

    let (_, result) = server
        .call(
            &token,
            "/api/http/download",
            json!({
                "url": "http://127.0.0.1:1/never",
                "path": dir.path().join("x.bin"),
            }),
        )
        .await;
    assert_eq!(result["ok"], false);
    assert_eq!(result["status"], 500);
}

#[tokio::test]
async fn upload_sends_multipart_file_and_reports_progress() {
    let server = TestServer::start().await;
    let token = server.login().await;
    let base = upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.txt");
    std::fs::write(&path, "u".repeat(PAYLOAD_LEN)).unwrap();
    let (_sub, mut rx) = listen(&server, "up-progress");

    let (status, result) = server
        .call(
            &token,
            "/api/http/upload",
            json!({
                "url": format!("{base}/form"),
                "path": path,
                "event": "up-progress",
                "options": { "fileField": "attachment" },
            }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(result["ok"], true);
    assert_eq!(result["status"], 200);

    let echoed = result["body"].as_str().unwrap();
    assert!(echoed.starts_with("multipart/form-data; boundary="), "{echoed:.80}");
    assert!(echoed.contains(r#"name="attachment"; filename="report.txt""#));
    assert!(echoed.contains(&"u".repeat(PAYLOAD_LEN)));

    let total = PAYLOAD_LEN as i64;
    let reports: Vec<[i64; 2]> = drain(&mut rx)
        .iter()
        .map(|frame| {
            let payload = frame["payload"].as_array().unwrap();
            [payload[0].as_i64().unwrap(), payload[1].as_i64().unwrap()]
        })
        .collect();
    assert_eq!(reports.last(), Some(&[total, total]));
    assert!(reports.windows(2).all(|w| w[1][0] > w[0][0]));
    assert!(reports.len() <= PAYLOAD_LEN / PROGRESS_STEP as usize + 1, "{reports:?}");
}

#[tokio::test]
async fn upload_of_missing_file_fails_without_a_request() {
    let server = TestServer::start().await;
    let token = server.login().await;
    let dir = tempfile::tempdir().unwrap();

    let (status, result) = server
        .call(
            &token,
            "/api/http/upload",
            json!({
                "url": "http://127.0.0.1:1/never",
                "path": dir.path().join("absent.bin"),
            }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(result["ok"], false);
    assert_eq!(result["status"], 500);
    assert!(result["body"].as_str().unwrap().contains("absent.bin"));
}

#[tokio::test]
async fn upload_is_cancelled_by_client_emit() {
    let server = TestServer::start().await;
    let token = server.login().await;
    let base = upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("small.txt");
    std::fs::write(&path, "hello").unwrap();

    let call = {
        let client = server.client.clone();
        let url = server.url("/api/http/upload");
        let token = token.clone();
        tokio::spawn(async move {
            client
                .post(url)
                .bearer_auth(token)
                .json(&json!({
                    "url": format!("{base}/slow"),
                    "method": "GET",
                    "path": path,
                    "options": { "cancelId": "cancel-up" },
                }))
                .send()
                .await
                .unwrap()
                .json::<Value>()
                .await
                .unwrap()
        })
    };

    let bus = &server.state.bus;
    wait_until("cancel handler", || bus.handler_count("cancel-up") == 1).await;
    assert_eq!(bus.dispatch_from_connection("cancel-up", &[]), 1);

    let result = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .expect("upload was not cancelled")
        .unwrap();
    assert_eq!(result["ok"], false);
    assert_eq!(result["body"], "request cancelled");
    assert_eq!(bus.handler_count("cancel-up"), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn background_process_streams_output_and_exit() {
    let server = TestServer::start().await;
    let token = server.login().await;
    let (_out, mut out_rx) = listen(&server, "proc-out");
    let (_end, mut end_rx) = listen(&server, "proc-end");

    let (status, result) = server
        .call(
            &token,
            "/api/exec/background",
            json!({
                "path": "sh",
                "args": ["-c", "echo first; echo second; exit 7"],
                "outEvent": "proc-out",
                "endEvent": "proc-end",
            }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(result["ok"], true);
    assert!(result["pid"].as_u64().unwrap() > 0);

    let end = tokio::time::timeout(Duration::from_secs(5), end_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let end: Value = serde_json::from_str(&end).unwrap();
    assert_eq!(end["payload"], json!([7]));

    let lines: Vec<Value> = drain(&mut out_rx)
        .into_iter()
        .map(|frame| frame["payload"][0].clone())
        .collect();
    assert_eq!(lines, [json!("first"), json!("second")]);
}

#[cfg(unix)]
#[tokio::test]
async fn kill_stops_a_background_process() {
    let server = TestServer::start().await;
    let token = server.login().await;
    let (_end, mut end_rx) = listen(&server, "sleep-end");

    let (_, started) = server
        .call(
            &token,
            "/api/exec/background",
            json!({ "path": "sleep", "args": ["30"], "endEvent": "sleep-end" }),
        )
        .await;
    let pid = started["pid"].as_u64().unwrap();

    let (status, killed) = server
        .call(&token, "/api/exec/kill", json!({ "pid": pid, "timeout": 2 }))
        .await;
    assert_eq!(status, 200);
    assert_eq!(killed, json!({ "ok": true }));

    let end = tokio::time::timeout(Duration::from_secs(5), end_rx.recv())
        .await
        .unwrap();
    assert!(end.is_some());
}

#[tokio::test]
async fn exec_errors_are_json() {
    let server = TestServer::start().await;
    let token = server.login().await;

    let (status, body) = server
        .call(&token, "/api/exec/kill", json!({ "pid": 4_000_000_000u32 }))
        .await;
    assert_eq!(status, 404);
    assert!(body["error"].as_str().unwrap().contains("4000000000"));

    let (status, body) = server
        .call(
            &token,
            "/api/exec/background",
            json!({ "path": "/definitely/not/a/binary" }),
        )
        .await;
    assert_eq!(status, 422);
    assert!(body["error"].as_str().unwrap().contains("failed to spawn"));

    let (status, _) = server
        .call(&token, "/api/exec/background", json!({ "args": [] }))
        .await;
    assert_eq!(status, 400);
}
