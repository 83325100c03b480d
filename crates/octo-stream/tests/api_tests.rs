//! API integration tests.

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
    response::Response,
};
use octo_stream::canon::{OutboundEvent, StreamEvent};
use octo_stream::client::{ChatView, SseDecoder, StreamClient, StreamOutcome};
use octo_stream::stream::StreamConfig;
use serde_json::{Value, json};
use tower::ServiceExt;

mod common;
use common::*;

async fn send(app: Router, method: Method, uri: &str, body: Option<Value>) -> Response {
    let mut request = Request::builder().uri(uri).method(method);
    let body = match body {
        Some(value) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(serde_json::to_string(&value).unwrap())
        }
        None => Body::empty(),
    };
    app.oneshot(request.body(body).unwrap()).await.unwrap()
}

async fn body_json(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn body_events(response: Response) -> Vec<OutboundEvent> {
    let body = axum::body::to_bytes(response.into_body(), 16 * 1024 * 1024)
        .await
        .unwrap();
    let mut decoder = SseDecoder::new();
    let mut events = decoder.push_events(&body);
    events.extend(decoder.finish().and_then(|frame| frame.decode()));
    events
}

#[tokio::test]
async fn test_health_endpoint() {
    let harness = TestHarness::new().await;

    let response = send(harness.router(), Method::GET, "/health", None).await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
    assert_eq!(json["active_sessions"], 0);
}

#[tokio::test]
async fn test_create_and_get_conversation() {
    let harness = TestHarness::new().await;

    let response = send(
        harness.router(),
        Method::POST,
        "/api/conversations",
        Some(json!({ "id": "conv-a", "tags": ["demo"] })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    assert_eq!(created["id"], "conv-a");
    assert_eq!(created["compactionCount"], 0);

    let response = send(
        harness.router(),
        Method::GET,
        "/api/conversations/conv-a",
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let fetched = body_json(response).await;
    assert_eq!(fetched["tags"], json!(["demo"]));

    let response = send(
        harness.router(),
        Method::GET,
        "/api/conversations/conv-missing",
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_first_user_message_titles_conversation() {
    let harness = TestHarness::new().await;
    send(
        harness.router(),
        Method::POST,
        "/api/conversations",
        Some(json!({ "id": "conv-t" })),
    )
    .await;

    let content = "word ".repeat(40);
    let response = send(
        harness.router(),
        Method::POST,
        "/api/conversations/conv-t/messages",
        Some(json!({ "content": content })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let message = body_json(response).await;
    assert_eq!(message["role"], "user");
    assert_eq!(message["conversationId"], "conv-t");

    let conversation = body_json(
        send(
            harness.router(),
            Method::GET,
            "/api/conversations/conv-t",
            None,
        )
        .await,
    )
    .await;
    let title = conversation["title"].as_str().unwrap();
    assert!(title.ends_with("..."));
    assert!(title.chars().count() <= 83);
}

#[tokio::test]
async fn test_add_message_validation() {
    let harness = TestHarness::new().await;
    send(
        harness.router(),
        Method::POST,
        "/api/conversations",
        Some(json!({ "id": "conv-v" })),
    )
    .await;

    let response = send(
        harness.router(),
        Method::POST,
        "/api/conversations/conv-v/messages",
        Some(json!({ "content": "   " })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["issues"][0]["path"], "content");

    let response = send(
        harness.router(),
        Method::POST,
        "/api/conversations/conv-nope/messages",
        Some(json!({ "content": "hi" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stream_requires_session_id() {
    let harness = TestHarness::new().await;

    let response = send(
        harness.router(),
        Method::POST,
        "/api/chat/stream",
        Some(json!({})),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "VALIDATION_ERROR");
    assert_eq!(json["issues"][0]["path"], "sessionId");
    assert_eq!(json["issues"][0]["message"], "Required");
    assert_eq!(harness.runtime.spawn_count(), 0);
}

#[tokio::test]
async fn test_stream_rejects_malformed_body() {
    let harness = TestHarness::new().await;

    let response = harness
        .router()
        .oneshot(
            Request::builder()
                .uri("/api/chat/stream")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["issues"][0]["path"], "body");
}

#[tokio::test]
async fn test_stream_preflight_statuses() {
    let harness = TestHarness::new().await;

    let response = send(
        harness.router(),
        Method::POST,
        "/api/chat/stream",
        Some(json!({ "sessionId": "conv-missing" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    send(
        harness.router(),
        Method::POST,
        "/api/conversations",
        Some(json!({ "id": "conv-empty" })),
    )
    .await;
    let response = send(
        harness.router(),
        Method::POST,
        "/api/chat/stream",
        Some(json!({ "sessionId": "conv-empty" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_stream_returns_event_stream() {
    let harness = TestHarness::new().await;
    let conv = harness.conversation("Say hi").await;
    harness
        .runtime
        .push_script(Script::new(vec![
            agent_start(),
            text_delta("Hi "),
            text_delta("there"),
            done("stop"),
            agent_end(),
        ]))
        .await;

    let response = send(
        harness.router(),
        Method::POST,
        "/api/chat/stream",
        Some(json!({ "sessionId": conv })),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let events = body_events(response).await;
    assert_eq!(texts(&events), ["Hi ", "there"]);
    assert_eq!(kinds(&events).last(), Some(&"done"));
    assert_eq!(done_message(&events).unwrap().content, "Hi there");
}

#[tokio::test]
async fn test_stream_sends_keepalive_comments() {
    let harness = TestHarness::with_config(StreamConfig {
        keepalive_secs: 1,
        ..test_stream_config()
    })
    .await;
    let conv = harness.conversation("Think slowly").await;
    harness
        .runtime
        .push_script(Script::new(vec![
            text_delta("Hmm"),
            sleep_ms(1500),
            done("stop"),
        ]))
        .await;

    let response = send(
        harness.router(),
        Method::POST,
        "/api/chat/stream",
        Some(json!({ "sessionId": conv })),
    )
    .await;
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let body = String::from_utf8(body.to_vec()).unwrap();

    assert!(body.contains("\n: keepalive\n"), "body was {:?}", body);
    assert!(body.contains("event: done"));
}

#[tokio::test]
async fn test_concurrent_stream_conflicts() {
    let harness = TestHarness::new().await;
    let conv = harness.conversation("Slow").await;
    harness
        .runtime
        .push_script(Script::new(vec![
            text_delta("slow"),
            sleep_ms(200),
            done("stop"),
        ]))
        .await;

    let first = harness.coordinator.start(&conv).await.unwrap();

    let response = send(
        harness.router(),
        Method::POST,
        "/api/chat/stream",
        Some(json!({ "sessionId": conv })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Disposing a streaming session is refused as well.
    let response = send(
        harness.router(),
        Method::DELETE,
        &format!("/api/conversations/{}/session", conv),
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let events = collect(first).await;
    assert_eq!(done_message(&events).unwrap().content, "slow");
}

#[tokio::test]
async fn test_subagents_endpoint_reports_status() {
    let harness = TestHarness::new().await;
    let conv = harness.conversation("Spawn one").await;
    harness
        .runtime
        .push_script(Script::new(vec![
            tool_start("call-1", "spawn_agent", json!({ "description": "Mock task" })),
            tool_end(
                "call-1",
                "spawn_agent",
                "Agent spawned: task-123 \u{2014} Mock task (default tier)\nStatus: running",
            ),
            done("stop"),
        ]))
        .await;
    collect(harness.coordinator.start(&conv).await.unwrap()).await;

    let uri = format!("/api/conversations/{}/subagents", conv);
    let response = send(harness.router(), Method::GET, &uri, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json[0]["taskId"], "task-123");
    assert_eq!(json[0]["toolCallId"], "call-1");
    assert_eq!(json[0]["status"], "running");
    assert!(json[0]["completedAt"].is_null());
    assert_eq!(json[0]["phase"], "running");

    harness.wait_until_idle(&conv).await;
    harness
        .runtime
        .notify("\u{2705} Agent completed: task-123\nDone")
        .await;
    harness
        .wait_for_subagent("task-123", |s| s.is_terminal())
        .await;

    let json = body_json(send(harness.router(), Method::GET, &uri, None).await).await;
    assert_eq!(json[0]["status"], "completed");
    assert_eq!(json[0]["phase"], "completed");
    assert!(json[0]["completedAt"].is_i64());

    let response = send(
        harness.router(),
        Method::GET,
        "/api/conversations/conv-missing/subagents",
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_dispose_session() {
    let harness = TestHarness::new().await;
    let conv = harness.conversation("Hello").await;
    harness
        .runtime
        .push_script(Script::new(vec![text_delta("Hi"), done("stop")]))
        .await;
    collect(harness.coordinator.start(&conv).await.unwrap()).await;
    harness.wait_until_idle(&conv).await;

    let uri = format!("/api/conversations/{}/session", conv);
    let response = send(harness.router(), Method::DELETE, &uri, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["disposed"], true);

    let response = send(harness.router(), Method::DELETE, &uri, None).await;
    assert_eq!(body_json(response).await["disposed"], false);
}

#[tokio::test]
async fn test_client_streams_over_http() {
    let harness = TestHarness::new().await;
    harness
        .runtime
        .push_script(Script::new(vec![
            text_delta("Hello "),
            text_delta("from the server"),
            done("stop"),
        ]))
        .await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = harness.router();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = StreamClient::new(format!("http://{}", addr)).unwrap();
    let conversation = client.create_conversation().await.unwrap();
    client
        .add_user_message(&conversation.id, "Greet me")
        .await
        .unwrap();

    let mut view = ChatView::new();
    let mut seen = Vec::new();
    let outcome = client
        .stream(&conversation.id, &mut view, |event| {
            if let OutboundEvent::Event(StreamEvent::Text { content }) = event {
                seen.push(content.clone());
            }
        })
        .await
        .unwrap();

    assert_eq!(outcome, StreamOutcome::Completed);
    assert_eq!(seen, ["Hello ", "from the server"]);
    assert!(
        view.messages()
            .iter()
            .any(|m| m.role == "assistant" && m.content == "Hello from the server")
    );

    let subagents = client.list_subagents(&conversation.id).await.unwrap();
    assert!(subagents.is_empty());
}
