//! HTTP API tests driven through `tower::ServiceExt::oneshot`.
#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use foreman_core::Config;
use foreman_daemon::bus::{ChannelId, EventPayload, NewEvent};
use foreman_daemon::orchestration::Orchestrator;
use foreman_daemon::server::{AppState, build_router};
use foreman_daemon::storage::{Database, FeatureStatus, RunState, Sender};

async fn orchestrator() -> Arc<Orchestrator> {
    let db = Database::open_in_memory().await.unwrap();
    let mut config = Config::default();
    config.sessions.agent_program = "sh".to_string();
    config.sessions.agent_args = vec!["-c".to_string(), "sleep 30".to_string()];
    config.sessions.terminate_grace_secs = 1;
    Orchestrator::new(db, config)
}

fn app(orchestrator: &Arc<Orchestrator>) -> axum::Router {
    build_router(AppState {
        orchestrator: Arc::clone(orchestrator),
    })
}

/// Send a request and return (status, body text).
async fn send_raw(
    orchestrator: &Arc<Orchestrator>,
    method: Method,
    uri: &str,
    body: Option<Value>,
    headers: &[(&str, &str)],
) -> (StatusCode, String) {
    let mut builder = Request::builder().method(method).uri(uri);
    for &(name, value) in headers {
        builder = builder.header(name, value);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = app(orchestrator).oneshot(request).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

/// Send a JSON request and return (status, parsed body or `Null`).
async fn send(
    orchestrator: &Arc<Orchestrator>,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let (status, text) = send_raw(orchestrator, method, uri, body, &[]).await;
    (status, serde_json::from_str(&text).unwrap_or(Value::Null))
}

/// Event ids in an SSE body.
fn sse_ids(body: &str) -> Vec<u64> {
    body.lines()
        .filter_map(|line| line.strip_prefix("id:"))
        .map(|id| id.trim().parse().unwrap())
        .collect()
}

#[tokio::test]
async fn feature_crud_and_filters() {
    let o = orchestrator().await;

    let (status, created) = send(
        &o,
        Method::POST,
        "/features",
        Some(json!({"id": "f1", "projectId": "p", "title": "Login", "priority": 2})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["id"], "f1");
    assert_eq!(created["status"], "pending");
    assert_eq!(created["projectId"], "p");

    let (status, _) = send(
        &o,
        Method::POST,
        "/features",
        Some(json!({"projectId": "p", "title": "Logout", "dependencies": ["f1"]})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, patched) = send(
        &o,
        Method::PATCH,
        "/features/f1",
        Some(json!({"title": "Sign in"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(patched["title"], "Sign in");

    let (_, listed) = send(&o, Method::GET, "/features?project=p&status=pending", None).await;
    assert_eq!(listed.as_array().unwrap().len(), 2);
    let (_, other) = send(&o, Method::GET, "/features?project=q", None).await;
    assert!(other.as_array().unwrap().is_empty());

    let (status, err) = send(&o, Method::GET, "/features?status=done", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["kind"], "bad_request");

    let (status, err) = send(&o, Method::GET, "/features/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["kind"], "not_found");

    let (status, _) = send(
        &o,
        Method::POST,
        "/features",
        Some(json!({"id": "f1", "projectId": "p", "title": "Again"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    o.shutdown().await;
}

#[tokio::test]
async fn promote_only_from_review_ready() {
    let o = orchestrator().await;
    send(
        &o,
        Method::POST,
        "/features",
        Some(json!({"id": "f", "projectId": "p", "title": "Search"})),
    )
    .await;

    let (status, err) = send(&o, Method::POST, "/features/f/promote", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["kind"], "invalid_transition");

    o.db().set_feature_status("f", FeatureStatus::ReviewReady).await.unwrap();
    let (status, promoted) = send(&o, Method::POST, "/features/f/promote", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(promoted["status"], "passing");

    o.shutdown().await;
}

#[tokio::test]
async fn queue_reorder_remove_and_summary() {
    let o = orchestrator().await;

    // Keep the agent busy so queued jobs stay queued.
    let (status, started) = send(
        &o,
        Method::POST,
        "/sessions",
        Some(json!({"agentId": "z", "projectId": "p", "initialInput": "hold"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(started["started"], true);

    let mut ids = Vec::new();
    for (i, input) in ["j1", "j2", "j3"].iter().enumerate() {
        let (status, body) = send(
            &o,
            Method::POST,
            "/queue",
            Some(json!({"agentId": "z", "projectId": "p", "payload": {"input": input, "ticket": i}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["position"], i + 1);
        ids.push(body["jobId"].as_str().unwrap().to_string());
    }

    let (status, moved) = send(
        &o,
        Method::POST,
        &format!("/agents/z/queue/{}/reorder", ids[2]),
        Some(json!({"position": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(moved["position"], 1);

    let (_, queue) = send(&o, Method::GET, "/agents/z/queue", None).await;
    assert_eq!(queue[0]["payload"]["input"], "j3");
    assert_eq!(queue[0]["payload"]["ticket"], 2);
    let order: Vec<&str> = queue
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["id"].as_str().unwrap())
        .collect();
    assert_eq!(order, [ids[2].as_str(), ids[0].as_str(), ids[1].as_str()]);

    let uri = format!("/agents/z/queue/{}", ids[0]);
    assert_eq!(send(&o, Method::DELETE, &uri, None).await.0, StatusCode::NO_CONTENT);
    // A stale view of the queue is not an error.
    assert_eq!(send(&o, Method::DELETE, &uri, None).await.0, StatusCode::NO_CONTENT);
    assert_eq!(
        send(&o, Method::DELETE, "/agents/z/queue/gone", None).await.0,
        StatusCode::NO_CONTENT
    );
    let (status, stale) = send(
        &o,
        Method::POST,
        "/agents/z/queue/gone/reorder",
        Some(json!({"position": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stale, json!({"jobId": "gone", "position": null}));

    let (_, summary) = send(&o, Method::GET, "/queue/summary", None).await;
    assert_eq!(summary, json!([{"agentId": "z", "depth": 2}]));

    let next = o.queue().dequeue("z").await.unwrap().unwrap();
    assert_eq!(next.id, ids[2]);

    o.shutdown().await;
}

#[tokio::test]
async fn dispatch_turns_and_end_session() {
    let o = orchestrator().await;

    let (status, started) = send(
        &o,
        Method::POST,
        "/sessions",
        Some(json!({"agentId": "a", "projectId": "p", "initialInput": "hello"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let session_id = started["sessionId"].as_str().unwrap().to_string();
    let thread_id = started["threadId"].as_str().unwrap().to_string();

    let (status, queued) = send(
        &o,
        Method::POST,
        "/sessions",
        Some(json!({"agentId": "a", "projectId": "p", "initialInput": "later"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(queued["queued"], true);
    assert_eq!(queued["position"], 1);

    let (_, sessions) = send(&o, Method::GET, "/sessions", None).await;
    assert_eq!(sessions.as_array().unwrap().len(), 1);
    assert_eq!(sessions[0]["agentId"], "a");

    let (status, _) = send(
        &o,
        Method::POST,
        &format!("/sessions/{session_id}/messages"),
        Some(json!({"text": "more detail"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, messages) = send(&o, Method::GET, &format!("/threads/{thread_id}/messages"), None).await;
    let contents: Vec<&str> = messages
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["content"].as_str().unwrap())
        .collect();
    assert_eq!(contents, ["hello", "more detail"]);

    let uri = format!("/sessions/{session_id}");
    assert_eq!(send(&o, Method::DELETE, &uri, None).await.0, StatusCode::NO_CONTENT);
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
    while o.sessions().get(&session_id).await.is_some() {
        assert!(tokio::time::Instant::now() < deadline, "session never tore down");
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    let (status, err) = send(
        &o,
        Method::POST,
        &format!("/sessions/{session_id}/messages"),
        Some(json!({"text": "late"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["kind"], "not_found");

    o.shutdown().await;
}

#[tokio::test]
async fn thread_stream_resumes_after_last_seen_id() {
    let o = orchestrator().await;
    let channel = ChannelId::Thread("t".to_string());
    for text in ["one", "two", "three"] {
        o.bus()
            .publish(
                &channel,
                NewEvent::new(EventPayload::AssistantText {
                    text: text.to_string(),
                }),
            )
            .await;
    }
    o.bus().close(&channel, "done").await;

    let (status, body) = send_raw(&o, Method::GET, "/streams/thread/t?lastSeenId=2", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sse_ids(&body), [3, 4]);
    assert!(body.contains("three"));
    assert!(body.contains("close"));

    let (_, body) = send_raw(
        &o,
        Method::GET,
        "/streams/thread/t",
        None,
        &[("last-event-id", "1")],
    )
    .await;
    assert_eq!(sse_ids(&body), [2, 3, 4]);

    let (_, body) = send_raw(&o, Method::GET, "/streams/thread/t", None, &[]).await;
    assert_eq!(sse_ids(&body), [1, 2, 3, 4]);

    o.shutdown().await;
}

#[tokio::test]
async fn thread_messages_after_and_health() {
    let o = orchestrator().await;
    for content in ["a", "b", "c"] {
        o.threads()
            .append("t", Sender::User, None, content, None)
            .await
            .unwrap();
    }

    let (_, after) = send(&o, Method::GET, "/threads/t/messages?after=1", None).await;
    let sequences: Vec<i64> = after
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["sequence"].as_i64().unwrap())
        .collect();
    assert_eq!(sequences, [2, 3]);

    let (status, health) = send(&o, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "ok");
    assert_eq!(health["activeSessions"], 0);
    assert_eq!(health["queuedJobs"], 0);

    o.shutdown().await;
}

#[tokio::test]
async fn run_stream_of_unknown_or_pruned_runs() {
    let o = orchestrator().await;

    let (status, err) = send(&o, Method::GET, "/streams/run/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["kind"], "not_found");
    assert!(!o.bus().exists(&ChannelId::Run("nope".to_string())).await);

    send(
        &o,
        Method::POST,
        "/features",
        Some(json!({"id": "f", "projectId": "p", "title": "Archive"})),
    )
    .await;
    o.db().create_run("r1", "f", "p", "t1").await.unwrap();
    o.db().finish_run("r1", RunState::Failing, Some("gone")).await.unwrap();

    // Finished long ago: its channel no longer exists, only the close marker.
    let (status, body) = send_raw(&o, Method::GET, "/streams/run/r1", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sse_ids(&body), [0]);
    assert!(body.contains("close"));
    assert!(body.contains("failing"));

    o.shutdown().await;
}
