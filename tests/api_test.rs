//! HTTP handler tests for the v2 API.

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use std::sync::Arc;
use toolchat::interrupt::INTERRUPT_MARKER;
use toolchat::llm::{ScriptStep, ScriptedProvider};
use toolchat::logmanager::{LoadOptions, LogManager};
use toolchat::message::Message;
use toolchat::reduce::ApproxCounter;
use toolchat::server::AppState;
use toolchat::server::api::run_step;
use toolchat::tools::{ToolRegistry, discover_tools};
use tower::ServiceExt;

fn test_state(logs_home: &tempfile::TempDir, script: Vec<ScriptStep>) -> Arc<AppState> {
    AppState::new(
        Arc::new(ToolRegistry::build(discover_tools(), None)),
        Arc::new(ScriptedProvider::new(script)),
        Arc::new(ApproxCounter),
        logs_home.path().to_path_buf(),
        "local/scripted".to_string(),
    )
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn liveness() {
    let dir = tempfile::tempdir().unwrap();
    let app = toolchat::server::router(test_state(&dir, vec![]));

    let response = app
        .oneshot(Request::get("/api/v2").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json["message"].as_str().unwrap().contains("v2"));
}

#[tokio::test]
async fn create_conversation_conflicts_on_second_put() {
    let dir = tempfile::tempdir().unwrap();
    let app = toolchat::server::router(test_state(&dir, vec![]));

    let body = serde_json::json!({
        "messages": [{"role": "system", "content": "You are a helpful assistant."}]
    });
    let response = app
        .clone()
        .oneshot(json_request("PUT", "/api/v2/conversations/apitest", body.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["conversation_id"], "apitest");
    assert!(json["session_id"].as_str().is_some());

    let response = app
        .oneshot(json_request("PUT", "/api/v2/conversations/apitest", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn append_and_fetch_conversation() {
    let dir = tempfile::tempdir().unwrap();
    let app = toolchat::server::router(test_state(&dir, vec![]));

    let create = serde_json::json!({ "messages": [{"role": "system", "content": "sys"}] });
    app.clone()
        .oneshot(json_request("PUT", "/api/v2/conversations/fetch", create))
        .await
        .unwrap();

    let append = serde_json::json!({ "role": "user", "content": "hello over http" });
    let response = app
        .clone()
        .oneshot(json_request("POST", "/api/v2/conversations/fetch", append))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::get("/api/v2/conversations/fetch")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["log"].as_array().unwrap().len(), 2);
    assert_eq!(json["log"][1]["content"], "hello over http");
    assert!(json["branches"].is_object());
}

#[tokio::test]
async fn missing_conversation_and_session_are_404() {
    let dir = tempfile::tempdir().unwrap();
    let app = toolchat::server::router(test_state(&dir, vec![]));

    let response = app
        .clone()
        .oneshot(
            Request::get("/api/v2/conversations/ghost")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/v2/conversations/ghost/session",
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/v2/conversations/ghost/step",
            serde_json::json!({ "session_id": "stale" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn interrupt_without_activity_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir, vec![]);
    let app = toolchat::server::router(state.clone());

    LogManager::create(state.logdir("quiet"), vec![Message::system("sys")]).unwrap();
    let session_id = state.sessions.create_session("quiet");

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/v2/conversations/quiet/interrupt",
            serde_json::json!({ "session_id": session_id }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn interrupt_clears_pending_tool_and_records_marker() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(
        &dir,
        vec![ScriptStep::Reply("```shell\necho hi\n```\n".to_string())],
    );
    let app = toolchat::server::router(state.clone());

    let mut manager =
        LogManager::create(state.logdir("pending"), vec![Message::system("sys")]).unwrap();
    manager.append(Message::user("run echo")).unwrap();
    drop(manager);
    let session_id = state.sessions.create_session("pending");

    run_step(state.clone(), "pending".into(), session_id.clone(), false).await;
    let has_pending = state
        .sessions
        .with_session(&session_id, |s| !s.pending_tools.is_empty())
        .unwrap();
    assert!(has_pending);

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/v2/conversations/pending/interrupt",
            serde_json::json!({ "session_id": session_id }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let cleared = state
        .sessions
        .with_session(&session_id, |s| s.pending_tools.is_empty())
        .unwrap();
    assert!(cleared);

    let manager = LogManager::load(
        state.logdir("pending"),
        LoadOptions {
            lock: false,
            branch: None,
        },
    )
    .unwrap();
    assert_eq!(
        manager.log().last().unwrap().content,
        INTERRUPT_MARKER
    );
}

#[tokio::test]
async fn step_conflicts_while_generating() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir, vec![ScriptStep::HangAfter(vec!["hmm".to_string()])]);
    let app = toolchat::server::router(state.clone());

    let mut manager =
        LogManager::create(state.logdir("busy"), vec![Message::system("sys")]).unwrap();
    manager.append(Message::user("think hard")).unwrap();
    drop(manager);
    let session_id = state.sessions.create_session("busy");

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/v2/conversations/busy/step",
            serde_json::json!({ "session_id": session_id }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // A second step while the first generation hangs.
    let response = app
        .oneshot(json_request(
            "POST",
            "/api/v2/conversations/busy/step",
            serde_json::json!({ "session_id": session_id }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Clean up the hanging generation.
    let cancel = state
        .sessions
        .with_session(&session_id, |s| s.cancel.clone())
        .unwrap();
    cancel.cancel();
}

#[tokio::test]
async fn list_conversations_respects_limit() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir, vec![]);
    let app = toolchat::server::router(state.clone());

    LogManager::create(state.logdir("2024-05-01-a"), vec![Message::system("s")]).unwrap();
    LogManager::create(state.logdir("2024-05-02-b"), vec![Message::system("s")]).unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::get("/api/v2/conversations?limit=1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json.as_array().unwrap().len(), 1);

    let response = app
        .oneshot(
            Request::get("/api/v2/conversations")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn confirm_unknown_tool_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir, vec![]);
    let app = toolchat::server::router(state.clone());

    LogManager::create(state.logdir("conf"), vec![Message::system("s")]).unwrap();
    let session_id = state.sessions.create_session("conf");

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/v2/conversations/conf/tool/confirm",
            serde_json::json!({
                "session_id": session_id,
                "tool_id": "nope",
                "action": "confirm",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
