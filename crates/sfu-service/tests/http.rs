//! HTTP surface scenarios, driven through the router without a listener.

mod util;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use common::types::{ChannelId, SessionId};
use sfu_service::routes::{build_router, AppState};
use sfu_test_utils::tokens::TokenBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;
use util::Stack;

const CALLER: &str = "198.51.100.5:40001";

fn app(stack: &Stack) -> Router {
    let global_key = Arc::new(stack.config.decoded_auth_key().expect("key"));
    build_router(AppState {
        controller: stack.controller.clone(),
        gateway: Arc::clone(&stack.gateway),
        config: Arc::clone(&stack.config),
        global_key,
    })
}

fn request(method: &str, uri: &str, auth: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = auth {
        builder = builder.header(header::AUTHORIZATION, format!("jwt {token}"));
    }
    let mut request = builder.body(Body::from(body.to_string())).expect("request");
    let addr: SocketAddr = CALLER.parse().expect("addr");
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn noop_returns_ok() {
    let stack = Stack::with_defaults().await;
    let response = app(&stack)
        .oneshot(request("GET", "/v1/noop", None, ""))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, serde_json::json!({"result": "ok"}));
}

#[tokio::test]
async fn stats_returns_channel_array() {
    let stack = Stack::with_defaults().await;
    stack.create_channel("iss", None, false).await;

    let response = app(&stack)
        .oneshot(request("GET", "/v1/stats", None, ""))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body.as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn unknown_path_is_404_and_wrong_method_405() {
    let stack = Stack::with_defaults().await;
    let router = app(&stack);

    let response = router
        .clone()
        .oneshot(request("GET", "/v1/missing", None, ""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = router
        .oneshot(request("POST", "/v1/noop", None, ""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn channel_requires_authorization() {
    let stack = Stack::with_defaults().await;

    let response = app(&stack)
        .oneshot(request("GET", "/v1/channel", None, ""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn channel_requires_issuer_claim() {
    let stack = Stack::with_defaults().await;
    let token = TokenBuilder::new().build();

    let response = app(&stack)
        .oneshot(request("GET", "/v1/channel", Some(&token), ""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn channel_rejects_bad_token() {
    let stack = Stack::with_defaults().await;
    let token = TokenBuilder::new().issuer("iss").expired().build();

    let response = app(&stack)
        .oneshot(request("GET", "/v1/channel", Some(&token), ""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// Two calls by the same issuer return the same channel; a different
/// issuer gets its own.
#[tokio::test]
async fn channel_creation_is_idempotent_per_issuer() {
    let stack = Stack::with_defaults().await;
    let router = app(&stack);

    let token_a = TokenBuilder::new().issuer("alpha").build();
    let first = body_json(
        router
            .clone()
            .oneshot(request("GET", "/v1/channel", Some(&token_a), ""))
            .await
            .unwrap(),
    )
    .await;
    let second = body_json(
        router
            .clone()
            .oneshot(request("GET", "/v1/channel", Some(&token_a), ""))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(first["uuid"], second["uuid"]);
    assert!(first["url"].as_str().unwrap().starts_with("http://"));

    let token_b = TokenBuilder::new().issuer("beta").build();
    let third = body_json(
        router
            .oneshot(request("GET", "/v1/channel", Some(&token_b), ""))
            .await
            .unwrap(),
    )
    .await;
    assert_ne!(first["uuid"], third["uuid"]);
}

#[tokio::test]
async fn channel_webrtc_flag_controls_router() {
    let stack = Stack::with_defaults().await;
    let token = TokenBuilder::new().issuer("data-only").build();

    let response = app(&stack)
        .oneshot(request(
            "GET",
            "/v1/channel?webRTC=false",
            Some(&token),
            "",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn disconnect_rejects_garbage_body() {
    let stack = Stack::with_defaults().await;

    let response = app(&stack)
        .oneshot(request("POST", "/v1/disconnect", None, "not-a-token"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn disconnect_kicks_named_sessions() {
    let stack = Stack::with_defaults().await;
    let router = app(&stack);

    // Create the channel through the API so its remote address is the
    // caller's
    let create_token = TokenBuilder::new().issuer("owner").build();
    let created = body_json(
        router
            .clone()
            .oneshot(request(
                "GET",
                "/v1/channel?webRTC=false",
                Some(&create_token),
                "",
            ))
            .await
            .unwrap(),
    )
    .await;
    let uuid: uuid::Uuid = created["uuid"].as_str().unwrap().parse().unwrap();

    let access = stack
        .controller
        .get_channel(ChannelId(uuid))
        .await
        .unwrap()
        .unwrap();
    let session = access.handle.join(SessionId::from("victim")).await.unwrap();

    let disconnect_token = TokenBuilder::new()
        .sessions_by_channel(uuid, &["victim"])
        .build();
    let response = router
        .oneshot(request("POST", "/v1/disconnect", None, &disconnect_token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    session.closed().await;
}
