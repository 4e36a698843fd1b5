use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use chrono::{DateTime, SecondsFormat, Utc};

use crate::cache::models::{RateLimitAdmission, RateLimitDecision};
use crate::cache::operations::{ClientIdentity, RateLimitPolicy, RefreshTokenStore, SlidingWindowLimiter};
use crate::error::AppError;
use crate::utils::hash_identity;

const X_RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// 请求入口限流
///
/// 每个路由组可以持有自己的策略，未设置时使用限流器的默认策略。
#[derive(Clone)]
pub struct RequestGate {
    limiter: Arc<SlidingWindowLimiter>,
    tokens: Arc<RefreshTokenStore>,
    policy: Option<RateLimitPolicy>,
}

impl RequestGate {
    pub fn new(limiter: Arc<SlidingWindowLimiter>, tokens: Arc<RefreshTokenStore>) -> Self {
        Self {
            limiter,
            tokens,
            policy: None,
        }
    }

    pub fn with_policy(mut self, policy: RateLimitPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub async fn check(&self, req: Request<Body>, next: Next) -> Response {
        let identity = self.identify(&req);

        match self.limiter.check(&identity, self.policy.as_ref()).await {
            RateLimitDecision::Admitted(admission) => {
                let mut response = next.run(req).await;
                set_rate_limit_headers(response.headers_mut(), &admission);
                response
            }
            RateLimitDecision::Rejected(rejection) => {
                tracing::warn!(
                    client = %hash_identity(&identity.ip),
                    current = rejection.current,
                    limit = rejection.limit,
                    "Rate limit exceeded"
                );
                AppError::RateLimitExceeded(rejection).into_response()
            }
        }
    }

    fn identify(&self, req: &Request<Body>) -> ClientIdentity {
        // 访问令牌无效时按匿名处理，由后续处理器决定是否拒绝
        let subject_id = req
            .headers()
            .typed_get::<Authorization<Bearer>>()
            .and_then(|auth| self.tokens.verify_access(auth.token()).ok())
            .map(|claims| claims.sub);
        ClientIdentity::new(client_ip(req), subject_id)
    }
}

/// 客户端 IP：x-forwarded-for 第一项，其次 x-real-ip，再次连接地址
pub fn client_ip(req: &Request<Body>) -> String {
    let headers = req.headers();
    headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').map(str::trim).find(|ip| !ip.is_empty()))
        .map(str::to_string)
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|h| h.to_str().ok())
                .map(str::trim)
                .filter(|ip| !ip.is_empty())
                .map(str::to_string)
        })
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ci| ci.0.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

fn set_rate_limit_headers(headers: &mut HeaderMap, admission: &RateLimitAdmission) {
    headers.insert(X_RATE_LIMIT_LIMIT, HeaderValue::from(admission.limit));
    headers.insert(X_RATE_LIMIT_REMAINING, HeaderValue::from(admission.remaining));
    if let Some(reset) = DateTime::<Utc>::from_timestamp_millis(admission.reset_at_ms) {
        if let Ok(value) = HeaderValue::from_str(&reset.to_rfc3339_opts(SecondsFormat::Millis, true)) {
            headers.insert(X_RATE_LIMIT_RESET, value);
        }
    }
}

pub async fn rate_limit(State(gate): State<RequestGate>, req: Request<Body>, next: Next) -> Response {
    gate.check(req, next).await
}
