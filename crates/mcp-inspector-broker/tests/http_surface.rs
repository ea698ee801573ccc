//! End-to-end tests driving the broker's HTTP surface over a real socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum_server::Handle;
use reqwest::header::{ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE, ORIGIN};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};

use mcp_inspector_broker::{AppState, BrokerOptions, BrokerServer};

const TEST_TOKEN: &str = "test-token-0123456789abcdef";
const AUTH_HEADER: &str = "x-mcp-remote-auth";

struct TestBroker {
    addr: SocketAddr,
    client: reqwest::Client,
    state: Arc<AppState>,
    // Holds the storage root alive for the broker's lifetime.
    _storage_dir: tempfile::TempDir,
}

impl TestBroker {
    async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    async fn spawn_with(customize: impl FnOnce(&mut BrokerOptions)) -> Self {
        let storage_dir = tempfile::tempdir().expect("tempdir");
        let mut options = BrokerOptions {
            host: "127.0.0.1".into(),
            port: 0,
            api_token: Some(TEST_TOKEN.to_string()),
            storage_dir: storage_dir.path().to_path_buf(),
            ..Default::default()
        };
        customize(&mut options);

        let server = BrokerServer::new(options);
        let state = server.state();
        let handle = Handle::new();
        let serve_handle = handle.clone();
        tokio::spawn(async move {
            if let Err(err) = server.serve(serve_handle).await {
                panic!("broker failed to serve: {err}");
            }
        });
        let addr = tokio::time::timeout(Duration::from_secs(5), handle.listening())
            .await
            .expect("timed out waiting for bind")
            .expect("broker did not bind");

        Self {
            addr,
            client: reqwest::Client::new(),
            state,
            _storage_dir: storage_dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(path))
            .header(AUTH_HEADER, format!("Bearer {TEST_TOKEN}"))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.request(Method::POST, path)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.request(Method::GET, path)
    }

    async fn connect_stdio(&self, command: &str, args: &[&str]) -> String {
        let response = self
            .post("/api/mcp/connect")
            .json(&json!({
                "config": {"type": "stdio", "command": command, "args": args, "env": {}}
            }))
            .send()
            .await
            .expect("connect request");
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = response.json().await.expect("connect body");
        body["sessionId"]
            .as_str()
            .expect("sessionId in response")
            .to_string()
    }

    async fn open_events(&self, session_id: &str) -> reqwest::Response {
        let response = self
            .get("/api/mcp/events")
            .query(&[("sessionId", session_id)])
            .send()
            .await
            .expect("events request");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream")));
        response
    }
}

/// Reads the SSE body until `needle` shows up (or panics after `deadline`).
/// Returns everything read so far.
async fn read_sse_until(response: &mut reqwest::Response, needle: &str, deadline: Duration) -> String {
    let mut buffer = String::new();
    let result = tokio::time::timeout(deadline, async {
        while !buffer.contains(needle) {
            match response.chunk().await.expect("sse chunk") {
                Some(bytes) => buffer.push_str(&String::from_utf8_lossy(&bytes)),
                None => break,
            }
        }
    })
    .await;
    assert!(
        result.is_ok() && buffer.contains(needle),
        "did not observe {needle:?} on the event stream; got:\n{buffer}"
    );
    buffer
}

/// Extracts the `data:` payloads of every SSE event of the given type, in
/// stream order.
fn sse_data_for_event(raw: &str, event: &str) -> Vec<Value> {
    let mut out = Vec::new();
    for block in raw.split("\n\n") {
        let mut is_match = false;
        let mut data = None;
        for line in block.lines() {
            if let Some(name) = line.strip_prefix("event: ") {
                is_match = name.trim() == event;
            } else if let Some(payload) = line.strip_prefix("data: ") {
                data = Some(payload.to_string());
            }
        }
        if is_match {
            if let Some(data) = data {
                if let Ok(value) = serde_json::from_str(&data) {
                    out.push(value);
                }
            }
        }
    }
    out
}

// Scenario: connect / send / receive. `cat` echoes each frame back, so the
// broker must deliver the sent frame as a `message` event.
#[tokio::test]
async fn test_connect_send_receive_roundtrip() {
    let broker = TestBroker::spawn().await;
    let session_id = broker.connect_stdio("cat", &[]).await;

    let mut events = broker.open_events(&session_id).await;

    let frame = json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}});
    let response = broker
        .post("/api/mcp/send")
        .json(&json!({"sessionId": session_id, "message": frame}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.json::<Value>().await.unwrap(), json!({"ok": true}));

    let raw = read_sse_until(&mut events, "event: message", Duration::from_secs(5)).await;
    let messages = sse_data_for_event(&raw, "message");
    assert!(!messages.is_empty());
    assert_eq!(messages[0], frame);

    broker
        .post("/api/mcp/disconnect")
        .json(&json!({"sessionId": session_id}))
        .send()
        .await
        .unwrap();
}

// Scenario: consumer rebind / queue drain. Five frames are emitted before
// any consumer binds; they must arrive first and in order.
#[tokio::test]
async fn test_queued_events_flush_in_order_on_first_bind() {
    let broker = TestBroker::spawn().await;
    let script = r#"i=1; while [ $i -le 5 ]; do echo "{\"jsonrpc\":\"2.0\",\"id\":$i,\"result\":{}}"; i=$((i+1)); done; sleep 30"#;
    let session_id = broker.connect_stdio("sh", &["-c", script]).await;

    // Give the upstream time to emit with nobody listening.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut events = broker.open_events(&session_id).await;
    let raw = read_sse_until(&mut events, "\"id\":5", Duration::from_secs(5)).await;
    let messages = sse_data_for_event(&raw, "message");
    let ids: Vec<i64> = messages
        .iter()
        .filter_map(|m| m["id"].as_i64())
        .collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);

    broker
        .post("/api/mcp/disconnect")
        .json(&json!({"sessionId": session_id}))
        .send()
        .await
        .unwrap();
}

// Scenario: transport death propagation. The command exits immediately; the
// client observes exactly one transport_error, and a later send fails with
// the same preserved text.
#[tokio::test]
async fn test_transport_death_reaches_client_and_send_fails() {
    let broker = TestBroker::spawn().await;
    let session_id = broker.connect_stdio("sh", &["-c", "exit 7"]).await;

    let mut events = broker.open_events(&session_id).await;
    let raw = read_sse_until(&mut events, "event: transport_error", Duration::from_secs(5)).await;
    let errors = sse_data_for_event(&raw, "transport_error");
    assert_eq!(errors.len(), 1);
    let error_text = errors[0]["error"].as_str().unwrap().to_string();
    assert!(error_text.contains("exited"), "got: {error_text}");

    // The stream stays open; send on the dead session is a 500 carrying the
    // same error text.
    let response = broker
        .post("/api/mcp/send")
        .json(&json!({
            "sessionId": session_id,
            "message": {"jsonrpc": "2.0", "id": 2, "method": "ping"}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"].as_str().unwrap(), error_text);
}

// A dead session is reaped once its consumer goes away.
#[tokio::test]
async fn test_dead_session_reaped_after_consumer_abort() {
    let broker = TestBroker::spawn().await;
    let session_id = broker.connect_stdio("sh", &["-c", "exit 1"]).await;

    let mut events = broker.open_events(&session_id).await;
    let _ = read_sse_until(&mut events, "event: transport_error", Duration::from_secs(5)).await;
    drop(events);

    // The abort-side reap runs asynchronously.
    let mut reaped = false;
    for _ in 0..50 {
        if broker.state.registry.size().await == 0 {
            reaped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(reaped, "dead session was not reaped after consumer abort");
}

#[tokio::test]
async fn test_connect_then_disconnect_restores_registry_size() {
    let broker = TestBroker::spawn().await;
    assert_eq!(broker.state.registry.size().await, 0);

    let session_id = broker.connect_stdio("cat", &[]).await;
    assert_eq!(broker.state.registry.size().await, 1);

    let response = broker
        .post("/api/mcp/disconnect")
        .json(&json!({"sessionId": session_id}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(broker.state.registry.size().await, 0);

    // Disconnect is idempotent.
    let response = broker
        .post("/api/mcp/disconnect")
        .json(&json!({"sessionId": session_id}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_connect_with_missing_command_fails_500() {
    let broker = TestBroker::spawn().await;
    let response = broker
        .post("/api/mcp/connect")
        .json(&json!({
            "config": {"type": "stdio", "command": "/no/such/binary", "args": [], "env": {}}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("Failed to start transport:"));
}

#[tokio::test]
async fn test_send_to_unknown_session_is_404() {
    let broker = TestBroker::spawn().await;
    let response = broker
        .post("/api/mcp/send")
        .json(&json!({"sessionId": "nope", "message": {"jsonrpc": "2.0"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_connect_body_is_400() {
    let broker = TestBroker::spawn().await;
    let response = broker
        .post("/api/mcp/connect")
        .header(CONTENT_TYPE, "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Bad Request");
    assert!(body["message"].is_string());
}

// Scenario: origin refusal.
#[tokio::test]
async fn test_disallowed_origin_is_refused() {
    let broker = TestBroker::spawn_with(|options| {
        options.allowed_origins = vec!["http://localhost:6274".into()];
    })
    .await;

    // Preflight from a disallowed origin.
    let response = broker
        .request(Method::OPTIONS, "/api/mcp/connect")
        .header(ORIGIN, "http://evil.example")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Forbidden");
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("Invalid origin"));

    // Non-preflight request from a disallowed origin.
    let response = broker
        .post("/api/config")
        .header(ORIGIN, "http://evil.example")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_allowed_origin_is_echoed() {
    let broker = TestBroker::spawn_with(|options| {
        options.allowed_origins = vec!["http://localhost:6274".into()];
    })
    .await;

    // Preflight.
    let response = broker
        .request(Method::OPTIONS, "/api/mcp/connect")
        .header(ORIGIN, "http://localhost:6274")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response
            .headers()
            .get(ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap(),
        "http://localhost:6274"
    );

    // Actual request: policy passes and the origin is echoed.
    let response = broker
        .get("/api/config")
        .header(ORIGIN, "http://localhost:6274")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap(),
        "http://localhost:6274"
    );

    // Requests without an Origin header (curl, same-origin) pass through.
    let response = broker.get("/api/config").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// Scenario: auth refusal.
#[tokio::test]
async fn test_bearer_auth_enforced() {
    let broker = TestBroker::spawn().await;

    // Wrong token.
    let response = broker
        .client
        .post(broker.url("/api/mcp/connect"))
        .header(AUTH_HEADER, "Bearer WRONG")
        .json(&json!({"config": {"type": "stdio", "command": "cat", "args": [], "env": {}}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Missing header.
    let response = broker
        .client
        .get(broker.url("/api/config"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Correct token proceeds.
    let response = broker.get("/api/config").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The liveness probe stays open.
    let response = broker
        .client
        .get(broker.url("/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_dangerous_omit_auth_skips_bearer_but_not_origin() {
    let broker = TestBroker::spawn_with(|options| {
        options.api_token = None;
        options.allowed_origins = vec!["http://localhost:6274".into()];
    })
    .await;

    // No token required.
    let response = broker
        .client
        .get(broker.url("/api/config"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Origin validation still runs.
    let response = broker
        .client
        .get(broker.url("/api/config"))
        .header(ORIGIN, "http://evil.example")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

// Scenario: KV lifecycle.
#[tokio::test]
async fn test_storage_lifecycle() {
    let broker = TestBroker::spawn().await;

    let response = broker
        .post("/api/storage/sess1")
        .json(&json!({"a": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = broker.get("/api/storage/sess1").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.json::<Value>().await.unwrap(), json!({"a": 1}));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let path = broker.state.storage.root().join("sess1.json");
        let mode = std::fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    let response = broker
        .request(Method::DELETE, "/api/storage/sess1")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = broker.get("/api/storage/sess1").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.json::<Value>().await.unwrap(), json!({}));
}

#[tokio::test]
async fn test_storage_id_validation_over_http() {
    let broker = TestBroker::spawn().await;

    // Traversal attempt, percent-encoded so it reaches the handler.
    let response = broker
        .get("/api/storage/%2E%2E%2Fx")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = broker
        .post("/api/storage/a_B-1")
        .json(&json!({"ok": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_fetch_proxy_round_trip() {
    let broker = TestBroker::spawn().await;

    // Proxy a request to our own health endpoint.
    let response = broker
        .post("/api/fetch")
        .json(&json!({"url": broker.url("/health")}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["status"], 200);
    assert!(body["body"].as_str().unwrap().contains("ok"));
}

#[tokio::test]
async fn test_fetch_proxy_omits_streaming_bodies() {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let broker = TestBroker::spawn().await;
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stream"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("data: x\n\n")
                .append_header("Content-Type", "text/event-stream"),
        )
        .mount(&upstream)
        .await;

    let response = broker
        .post("/api/fetch")
        .json(&json!({"url": format!("{}/stream", upstream.uri())}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], 200);
    assert!(body.get("body").is_none(), "streaming body must be omitted");
}

#[tokio::test]
async fn test_fetch_proxy_rejects_non_http_urls() {
    let broker = TestBroker::spawn().await;
    let response = broker
        .post("/api/fetch")
        .json(&json!({"url": "file:///etc/passwd"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_log_sink_acknowledges() {
    let broker = TestBroker::spawn().await;
    let response = broker
        .post("/api/log")
        .json(&json!({"level": "info", "message": "ui booted", "data": {"version": 3}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.json::<Value>().await.unwrap(), json!({"ok": true}));
}

#[tokio::test]
async fn test_config_reports_default_environment() {
    let broker = TestBroker::spawn().await;
    let response = broker.get("/api/config").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert!(body["defaultEnvironment"].is_object());
}

// Connecting to an SSE upstream through the broker, end to end, with the
// handshake served by a mock server.
#[tokio::test]
async fn test_connect_sse_upstream() {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sse"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("event: endpoint\ndata: /messages\n\n")
                .append_header("Content-Type", "text/event-stream"),
        )
        .mount(&upstream)
        .await;

    let broker = TestBroker::spawn().await;
    let response = broker
        .post("/api/mcp/connect")
        .json(&json!({"config": {"type": "sse", "url": format!("{}/sse", upstream.uri())}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let session_id = response.json::<Value>().await.unwrap()["sessionId"]
        .as_str()
        .unwrap()
        .to_string();

    // The subscribe request shows up as a fetch_request event.
    let mut events = broker.open_events(&session_id).await;
    let raw = read_sse_until(&mut events, "event: fetch_request", Duration::from_secs(5)).await;
    let traces = sse_data_for_event(&raw, "fetch_request");
    assert!(!traces.is_empty());
    assert_eq!(traces[0]["method"], "GET");
    assert_eq!(traces[0]["category"], "transport");
}

// Upstream 401 on connect maps to HTTP 401.
#[tokio::test]
async fn test_upstream_unauthorized_maps_to_401() {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sse"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&upstream)
        .await;

    let broker = TestBroker::spawn().await;
    let response = broker
        .post("/api/mcp/connect")
        .json(&json!({"config": {"type": "sse", "url": format!("{}/sse", upstream.uri())}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
