use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::cache::models::RateLimitRejection;
use crate::cache::operations::AuthError;
use crate::cache::{CacheError, StoreError};
use crate::resilience::CircuitBreakerError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Store unavailable")]
    StoreUnavailable,
    #[error("Too many requests")]
    RateLimitExceeded(RateLimitRejection),
    #[error("Invalid or expired refresh token")]
    InvalidOrExpiredCredential,
    #[error("dependency unavailable")]
    CircuitOpen,
    #[error("{0}")]
    BadRequest(String),
    #[error("Internal server error")]
    Internal,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    status_code: u16,
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitResponse<'a> {
    status_code: u16,
    message: String,
    #[serde(flatten)]
    rejection: &'a RateLimitRejection,
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::StoreUnavailable | AppError::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            AppError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::InvalidOrExpiredCredential => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();

        match self {
            AppError::RateLimitExceeded(rejection) => {
                let body = Json(RateLimitResponse {
                    status_code: status.as_u16(),
                    message,
                    rejection: &rejection,
                });
                let mut response = (status, body).into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(rejection.retry_after));
                response
            }
            _ => {
                let body = Json(ErrorResponse {
                    status_code: status.as_u16(),
                    message,
                });
                (status, body).into_response()
            }
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        tracing::error!(error = %err, "Store operation failed");
        AppError::StoreUnavailable
    }
}

impl From<CacheError> for AppError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Store(err) => err.into(),
            CacheError::Serialization(err) => {
                tracing::error!(error = %err, "Failed to encode cached value");
                AppError::Internal
            }
        }
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidOrExpiredCredential => AppError::InvalidOrExpiredCredential,
            AuthError::Store(err) => err.into(),
            AuthError::Signing(err) => {
                tracing::error!(error = %err, "Failed to sign token");
                AppError::Internal
            }
        }
    }
}

impl<E: Into<AppError>> From<CircuitBreakerError<E>> for AppError {
    fn from(err: CircuitBreakerError<E>) -> Self {
        match err {
            CircuitBreakerError::Open { .. } => AppError::CircuitOpen,
            CircuitBreakerError::Timeout { name, timeout } => {
                tracing::warn!(breaker = %name, ?timeout, "Protected call timed out");
                AppError::StoreUnavailable
            }
            CircuitBreakerError::Operation(err) => err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), 4096).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn rate_limit_response_carries_limit_fields() {
        let response = AppError::RateLimitExceeded(RateLimitRejection {
            limit: 5,
            current: 5,
            remaining: 0,
            retry_after: 42,
        })
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");
        let body = body_json(response).await;
        assert_eq!(body["statusCode"], 429);
        assert_eq!(body["limit"], 5);
        assert_eq!(body["remaining"], 0);
        assert_eq!(body["retryAfter"], 42);
    }

    #[tokio::test]
    async fn open_circuit_hides_detail() {
        let err: AppError = CircuitBreakerError::<StoreError>::Open { name: "store-ping".into() }.into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["message"], "dependency unavailable");
        assert!(!body.to_string().contains("store-ping"));
    }

    #[tokio::test]
    async fn store_failures_do_not_leak_detail() {
        let err: AppError = StoreError::Unavailable("10.0.0.7:6379 refused".into()).into();
        let body = body_json(err.into_response()).await;
        assert_eq!(body["statusCode"], 503);
        assert!(!body.to_string().contains("10.0.0.7"));
    }
}
