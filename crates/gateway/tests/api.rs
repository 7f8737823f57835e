mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use sha2::{Digest, Sha256};
use tower::ServiceExt;

use cs_domain::step::StepDraft;
use cs_gateway::api;
use cs_gateway::runtime::rate_limit::{KeyedRateLimiter, RateLimiter};
use cs_gateway::state::AppState;
use cs_store::StepStore;

const TOKEN: &str = "test-token";

fn app_state(limit: Option<u32>) -> AppState {
    let config = common::config();
    let (runtime, json_store) = common::runtime(&config, "Sure.");
    AppState {
        config: Arc::new(config),
        llm: runtime.adapter.registry().clone(),
        runtime,
        json_store,
        api_token_hash: Some(Sha256::digest(TOKEN.as_bytes()).to_vec()),
        rate_limiter: limit.map(|n| {
            Arc::new(KeyedRateLimiter::per_minute(n).unwrap()) as Arc<dyn RateLimiter>
        }),
    }
}

fn app(state: &AppState) -> Router {
    api::router(state.clone()).with_state(state.clone())
}

fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::post(uri)
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_is_public() {
    let state = app_state(None);
    let resp = app(&state)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["providers"], 1);
}

#[tokio::test]
async fn protected_routes_need_the_token() {
    let state = app_state(None);
    let resp = app(&state)
        .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert!(body_json(resp).await["error"].is_string());

    let resp = app(&state)
        .oneshot(
            Request::get("/v1/models")
                .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn invalid_execution_requests_are_rejected_before_streaming() {
    let state = app_state(None);

    let resp = app(&state)
        .oneshot(post("/v1/execute", serde_json::json!({ "stepId": "s", "model": "mock-a" })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(resp).await["error"], "prompt is required");

    let long = "x".repeat(50_001);
    let resp = app(&state)
        .oneshot(post(
            "/v1/execute",
            serde_json::json!({ "stepId": "s", "model": "mock-a", "prompt": long }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = app(&state)
        .oneshot(post(
            "/v1/execute",
            serde_json::json!({ "stepId": "nope", "model": "mock-a", "prompt": "hi" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = app(&state)
        .oneshot(post("/v1/supervisor", serde_json::json!({ "sessionId": "nope", "userInput": "hi" })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn rate_limited_requests_get_retry_after() {
    let state = app_state(Some(1));

    let resp = app(&state)
        .oneshot(post("/v1/supervisor", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = app(&state)
        .oneshot(post("/v1/supervisor", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(resp.headers().contains_key(header::RETRY_AFTER));
    let body = body_json(resp).await;
    assert!(body["retryAfter"].as_u64().unwrap() >= 1);

    // Session management is not rate limited.
    let resp = app(&state)
        .oneshot(
            Request::get("/v1/sessions")
                .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn execute_streams_sse_until_done() {
    let state = app_state(None);
    let session = state
        .runtime
        .store
        .create_session(
            None,
            vec![StepDraft {
                model: "mock-alpha".into(),
                prompt: "Go.".into(),
                ..Default::default()
            }],
        )
        .await
        .unwrap();

    let resp = app(&state)
        .oneshot(post(
            "/v1/execute",
            serde_json::json!({
                "stepId": session.steps[0].id,
                "model": "mock-alpha",
                "prompt": "Go.",
                "webSearchResults": "1. a result",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/event-stream");

    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(body.contains(r#""type":"token""#));
    assert!(body.contains(r#""type":"complete""#));
    assert!(body.ends_with("data: [DONE]\n\n"));
}

#[tokio::test]
async fn session_crud() {
    let state = app_state(None);

    let resp = app(&state)
        .oneshot(post(
            "/v1/sessions",
            serde_json::json!({
                "name": "demo",
                "steps": [{ "model": "mock-a", "prompt": "p1" }, { "model": "mock-b" }],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created = body_json(resp).await;
    let id = created["id"].as_str().unwrap().to_owned();
    assert_eq!(created["steps"].as_array().unwrap().len(), 2);

    let delete = || {
        Request::delete(format!("/v1/sessions/{id}"))
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .unwrap()
    };
    let resp = app(&state).oneshot(delete()).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    let resp = app(&state).oneshot(delete()).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
