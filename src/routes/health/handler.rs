use axum::{extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;

use crate::{AppState, resilience::BreakerSnapshot, utils::success_to_api_response};

pub const STORE_PING_BREAKER: &str = "store-ping";

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub store: &'static str,
    pub breakers: Vec<BreakerSnapshot>,
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let store = state
        .breakers
        .execute_with_fallback(
            STORE_PING_BREAKER,
            None,
            || async { state.store.ping().await.map(|_| "up") },
            || "down",
        )
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Store health check failed");
            "down"
        });

    let (status, label) = if store == "up" {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status,
        success_to_api_response(HealthResponse {
            status: label,
            store,
            breakers: state.breakers.snapshot(),
        }),
    )
}
