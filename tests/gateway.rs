use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
    response::Response,
};
use serde_json::{Value, json};
use taskgate::{
    AppState, REFRESH_LIMIT, build_router,
    cache::{MemoryBackend, models::SubjectAttributes},
    config::Config,
};
use tower::ServiceExt;

fn config(overrides: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<String, String> = [
        ("STORE_BACKEND", "memory"),
        ("JWT_SECRET", "access-secret"),
        ("JWT_REFRESH_SECRET", "refresh-secret"),
        ("JWT_REFRESH_EXPIRATION", "604800"),
        ("RATE_LIMIT_LIMIT", "5"),
        ("RATE_LIMIT_WINDOW_MS", "60000"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (k, v) in overrides {
        vars.insert(k.to_string(), v.to_string());
    }
    Config::from_lookup(|name| vars.get(name).cloned()).unwrap()
}

fn app(overrides: &[(&str, &str)]) -> (Arc<MemoryBackend>, AppState, Router) {
    let backend = Arc::new(MemoryBackend::new());
    let state = AppState::with_backend(config(overrides), backend.clone());
    let router = build_router(state.clone());
    (backend, state, router)
}

fn get_health(ip: &str) -> Request<Body> {
    Request::builder()
        .uri("/health")
        .header("x-forwarded-for", ip)
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, ip: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("x-forwarded-for", ip)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn attributes() -> SubjectAttributes {
    SubjectAttributes {
        role: "member".into(),
        email: "dev@example.com".into(),
    }
}

#[tokio::test]
async fn sixth_request_in_window_is_rejected() {
    let (_, _, router) = app(&[]);

    for expected in (0..5).rev() {
        let response = router.clone().oneshot(get_health("198.51.100.7")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "5");
        assert_eq!(response.headers()["x-ratelimit-remaining"], expected.to_string().as_str());
        assert!(response.headers().contains_key("x-ratelimit-reset"));
    }

    let response = router.clone().oneshot(get_health("198.51.100.7")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response.headers()[header::RETRY_AFTER].to_str().unwrap().parse().unwrap();
    assert!(retry_after > 0 && retry_after <= 60);

    let body = json_body(response).await;
    assert_eq!(body["statusCode"], 429);
    assert_eq!(body["limit"], 5);
    assert_eq!(body["current"], 5);
    assert_eq!(body["remaining"], 0);
    assert_eq!(body["retryAfter"], retry_after);

    // 其他客户端不受影响
    let other = router.oneshot(get_health("203.0.113.20")).await.unwrap();
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test]
async fn refresh_rotates_once_and_rejects_replay() {
    let (_, state, router) = app(&[]);
    let issued = state.tokens.issue("user-1", attributes()).await.unwrap();

    let response = router
        .clone()
        .oneshot(post_json("/auth/refresh", "192.0.2.4", json!({ "refresh_token": issued.refresh_token })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let rotated = body["resp_data"]["refresh_token"].as_str().unwrap().to_string();
    assert_ne!(rotated, issued.refresh_token);
    assert!(body["resp_data"]["access_token"].is_string());
    assert!(body["resp_data"].get("token_id").is_none());

    let replay = router
        .clone()
        .oneshot(post_json("/auth/refresh", "192.0.2.4", json!({ "refresh_token": issued.refresh_token })))
        .await
        .unwrap();
    assert_eq!(replay.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(replay).await;
    assert_eq!(body["statusCode"], 401);
    assert_eq!(body["message"], "Invalid or expired refresh token");

    let next = router
        .oneshot(post_json("/auth/refresh", "192.0.2.4", json!({ "refresh_token": rotated })))
        .await
        .unwrap();
    assert_eq!(next.status(), StatusCode::OK);
}

#[tokio::test]
async fn refresh_has_its_own_stricter_limit() {
    let (_, _, router) = app(&[("RATE_LIMIT_LIMIT", "100")]);

    for _ in 0..REFRESH_LIMIT {
        let response = router
            .clone()
            .oneshot(post_json("/auth/refresh", "192.0.2.9", json!({ "refresh_token": "bogus" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let response = router
        .clone()
        .oneshot(post_json("/auth/refresh", "192.0.2.9", json!({ "refresh_token": "bogus" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // 默认窗口独立计数
    let health = router.oneshot(get_health("192.0.2.9")).await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    assert_eq!(health.headers()["x-ratelimit-remaining"], "99");
}

#[tokio::test]
async fn malformed_payload_is_a_bad_request() {
    let (_, _, router) = app(&[]);

    let response = router
        .clone()
        .oneshot(post_json("/auth/refresh", "192.0.2.5", json!({ "token": "x" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["statusCode"], 400);

    let response = router
        .oneshot(post_json("/auth/logout", "192.0.2.5", json!({ "refresh_token": "  " })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn logout_all_revokes_every_session() {
    let (_, state, router) = app(&[]);
    let first = state.tokens.issue("user-2", attributes()).await.unwrap();
    let second = state.tokens.issue("user-2", attributes()).await.unwrap();

    let response = router
        .clone()
        .oneshot(post_json("/auth/logout-all", "192.0.2.6", json!({ "refresh_token": first.refresh_token })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["resp_data"]["revoked"], 2);

    let response = router
        .oneshot(post_json("/auth/refresh", "192.0.2.6", json!({ "refresh_token": second.refresh_token })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn store_outage_degrades_instead_of_failing_requests() {
    let (backend, _, router) = app(&[]);
    backend.set_available(false);

    let response = router.clone().oneshot(get_health("198.51.100.8")).await.unwrap();
    // 限流放行，健康检查报告存储不可用
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().contains_key("x-ratelimit-remaining"));
    let body = json_body(response).await;
    assert_eq!(body["resp_data"]["store"], "down");
    assert_eq!(body["resp_data"]["status"], "degraded");

    backend.set_available(true);
    let response = router.oneshot(get_health("198.51.100.8")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["resp_data"]["store"], "up");
    let breakers = body["resp_data"]["breakers"].as_array().unwrap();
    assert_eq!(breakers[0]["name"], "store-ping");
    assert_eq!(breakers[0]["state"], "closed");
}
