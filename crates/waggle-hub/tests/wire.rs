//! Wire-level exercises of the session plane: SSE handshake, tool results
//! out-of-band, stale-session recovery, auth gating.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use waggle_hub::{routes, Hub, HubConfig};

fn test_hub() -> (Arc<Hub>, Router) {
    waggle_telemetry_init();
    let mut config = HubConfig::default();
    config.auth.token_secret = Some("wire-test-secret".into());
    config.auth.admin_password_sha256 = Some(waggle_hub::auth::password_hash("hunter2"));
    let hub = Hub::build(config).expect("hub builds");
    hub.spawn_background();
    let router = routes::router(hub.clone());
    (hub, router)
}

fn waggle_telemetry_init() {
    waggle_telemetry::init_for_tests();
}

/// Read the next SSE chunk from a live response body.
async fn next_chunk(body: &mut Body) -> String {
    let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
        .await
        .expect("frame within deadline")
        .expect("stream still open")
        .expect("frame ok");
    let Ok(bytes) = frame.into_data() else {
        panic!("expected a data frame");
    };
    String::from_utf8(bytes.to_vec()).expect("utf-8 frame")
}

/// Pull SSE chunks until one carries the given event name.
async fn next_event(body: &mut Body, event: &str) -> String {
    let marker = format!("event: {event}");
    for _ in 0..20 {
        let chunk = next_chunk(body).await;
        if chunk.contains(&marker) {
            return chunk;
        }
    }
    panic!("no '{event}' event arrived");
}

fn data_line(chunk: &str) -> String {
    chunk
        .lines()
        .find_map(|line| line.strip_prefix("data: "))
        .expect("data line present")
        .to_string()
}

#[tokio::test]
async fn test_s1_happy_path_tool_call() {
    let (_hub, router) = test_hub();

    // Open SSE with no id; the first frame carries a 128-bit hex session id.
    let response = router
        .clone()
        .oneshot(Request::builder().uri("/sse").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let mut body = response.into_body();
    let first = next_chunk(&mut body).await;
    assert!(first.contains("event: session"), "first frame was {first:?}");
    let session_id = data_line(&first);
    assert_eq!(session_id.len(), 32);
    assert!(session_id.chars().all(|c| c.is_ascii_hexdigit()));

    // Invoke a tool against the paired ingress endpoint.
    let invocation = json!({
        "id": "a1",
        "tool": "store_memory",
        "args": {"content": "hello", "category": "global"},
    });
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/messages?session_id={session_id}"))
                .header("content-type", "application/json")
                .body(Body::from(invocation.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    // The result arrives out-of-band on the stream.
    let chunk = next_event(&mut body, "result").await;
    let result: Value = serde_json::from_str(&data_line(&chunk)).unwrap();
    assert_eq!(result["id"], "a1");
    assert_eq!(result["ok"], true);
    let memory_id = result["payload"].as_str().expect("payload is the memory id");
    assert_eq!(memory_id.len(), 32);
}

#[tokio::test]
async fn test_s2_stale_session_recovery() {
    let (_hub, router) = test_hub();

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/messages?session_id=deadbeef")
                .header("content-type", "application/json")
                .body(Body::from(json!({"id": "x", "tool": "hub_status"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GONE);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let payload: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(payload["error"], "session_expired");
    assert_eq!(payload["old_session_id"], "deadbeef");

    let suggested = payload["suggested_new_session_id"].as_str().unwrap();
    assert_eq!(suggested.len(), 32);
    assert_eq!(
        payload["sse_url"],
        format!("/sse?session_id={suggested}")
    );

    // Connecting with the suggested id keeps it (pre-created session).
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/sse?session_id={suggested}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let mut body = response.into_body();
    let first = next_chunk(&mut body).await;
    assert_eq!(data_line(&first), suggested);
}

#[tokio::test]
async fn test_broadcast_interleaved_on_stream() {
    let (hub, router) = test_hub();

    let response = router
        .clone()
        .oneshot(Request::builder().uri("/sse").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let mut body = response.into_body();
    let _session = next_chunk(&mut body).await;

    // Publish through the bus; the pump task fans out to the live stream.
    hub.services.bus.publish(
        "drone-1",
        "m1",
        "ops",
        waggle_swarm::Severity::Info,
        "maintenance window",
        None,
    );

    let chunk = next_event(&mut body, "broadcast").await;
    let broadcast: Value = serde_json::from_str(&data_line(&chunk)).unwrap();
    assert_eq!(broadcast["broadcast_id"], 1);
    assert_eq!(broadcast["message"], "maintenance window");
}

#[tokio::test]
async fn test_malformed_body_is_400() {
    let (_hub, router) = test_hub();

    // A live session first.
    let response = router
        .clone()
        .oneshot(Request::builder().uri("/sse").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let mut body = response.into_body();
    let session_id = data_line(&next_chunk(&mut body).await);

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/messages?session_id={session_id}"))
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_tool_surfaces_on_stream() {
    let (_hub, router) = test_hub();

    let response = router
        .clone()
        .oneshot(Request::builder().uri("/sse").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let mut body = response.into_body();
    let session_id = data_line(&next_chunk(&mut body).await);

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/messages?session_id={session_id}"))
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"id": "bad", "tool": "no_such_tool"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let chunk = next_event(&mut body, "result").await;
    let result: Value = serde_json::from_str(&data_line(&chunk)).unwrap();
    assert_eq!(result["ok"], false);
    assert_eq!(result["payload"]["kind"], "tool_not_found");
}

#[tokio::test]
async fn test_admin_auth_gating() {
    let (_hub, router) = test_hub();

    // No token: 401.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/admin/api/agents")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Bad login: 401.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/api/login")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"username": "admin", "password": "wrong"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Good login yields a token that opens the admin plane.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/api/login")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"username": "admin", "password": "hunter2"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let token = serde_json::from_slice::<Value>(&bytes).unwrap()["token"]
        .as_str()
        .unwrap()
        .to_string();

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/admin/api/agents")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_health_shape() {
    let (_hub, router) = test_hub();

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let health: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["ssl_enabled"], false);
    assert!(health["machine_id"].as_str().is_some());
    assert!(health["version"].as_str().is_some());
}
