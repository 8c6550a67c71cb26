// Router-level tests for control-connection auth and the health endpoint.
//
// Auth is enforced as a tower middleware (control_auth) that runs BEFORE
// WebSocket upgrade extraction, so 401 comes back without a full handshake.
//
// Note: Tests use tower::ServiceExt::oneshot. When auth passes, requests reach
// the WebSocketUpgrade extractor, which rejects them (no hyper OnUpgrade
// extension in test requests). The tests verify the auth decision (401 vs
// non-401), not the WebSocket upgrade itself.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use gql_fanout::{
    api::{create_ws_router, WsAppState},
    demo,
    server::spawn_manager,
    subscription::{ConnectionRegistry, SubscriptionManager},
};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

fn make_router(control_token: Option<&str>) -> Router {
    let registry = Arc::new(ConnectionRegistry::new());
    let manager = SubscriptionManager::new(Arc::new(demo::build_executor()), Arc::clone(&registry));
    let (handle, _task) = spawn_manager(manager, 16);
    let state = Arc::new(WsAppState {
        manager: handle,
        registry,
        control_token: control_token.map(str::to_string),
    });
    create_ws_router(state, "/subscriptions")
}

fn upgrade_request(uri: &str, protocol: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(protocol) = protocol {
        builder = builder.header("sec-websocket-protocol", protocol);
    }
    builder.body(Body::empty()).unwrap()
}

// ── no control token configured: everything passes ──────────────────────────

#[tokio::test]
async fn test_no_token_configured_control_allowed() {
    let app = make_router(None);
    let resp = app
        .oneshot(upgrade_request("/subscriptions", Some("graphql-subscriptions")))
        .await
        .unwrap();
    assert_ne!(resp.status(), StatusCode::UNAUTHORIZED);
}

// ── token configured, control without token → 401 ───────────────────────────

#[tokio::test]
async fn test_control_without_token_returns_401() {
    let app = make_router(Some("s3cret"));
    let resp = app
        .oneshot(upgrade_request("/subscriptions", Some("graphql-subscriptions")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

// ── token configured, control with wrong token → 401 ────────────────────────

#[tokio::test]
async fn test_control_with_wrong_token_returns_401() {
    let app = make_router(Some("s3cret"));
    let resp = app
        .oneshot(upgrade_request(
            "/subscriptions?token=guess",
            Some("graphql-subscriptions"),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

// ── token configured, control with right token → auth passes ────────────────

#[tokio::test]
async fn test_control_with_token_not_rejected() {
    let app = make_router(Some("s3cret"));
    let resp = app
        .oneshot(upgrade_request(
            "/subscriptions?token=s3cret",
            Some("graphql-subscriptions"),
        ))
        .await
        .unwrap();
    assert_ne!(resp.status(), StatusCode::UNAUTHORIZED);
}

// ── token configured, clients never need it ─────────────────────────────────

#[tokio::test]
async fn test_client_connections_need_no_token() {
    let app = make_router(Some("s3cret"));
    let resp = app
        .clone()
        .oneshot(upgrade_request("/subscriptions", Some("graphql-ws")))
        .await
        .unwrap();
    assert_ne!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = app
        .oneshot(upgrade_request("/subscriptions", None))
        .await
        .unwrap();
    assert_ne!(resp.status(), StatusCode::UNAUTHORIZED);
}

// ── health endpoint is outside the auth layer ───────────────────────────────

#[tokio::test]
async fn test_health_reports_counts() {
    let app = make_router(Some("s3cret"));
    let resp = app
        .oneshot(upgrade_request("/health", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["connections"], 0);
    assert_eq!(json["subscriptions"], 0);
}
