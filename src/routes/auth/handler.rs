use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    response::IntoResponse,
};

use crate::{AppState, error::AppError, utils::success_to_api_response};

use super::model::{LogoutResponse, RefreshTokenRequest};

fn credential(payload: Result<Json<RefreshTokenRequest>, JsonRejection>) -> Result<String, AppError> {
    let Json(req) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let token = req.refresh_token.trim();
    if token.is_empty() {
        return Err(AppError::BadRequest("refresh_token is required".to_string()));
    }
    Ok(token.to_string())
}

/// 用刷新令牌换取新的令牌对，旧令牌立即失效
#[axum::debug_handler]
pub async fn refresh(
    State(state): State<AppState>,
    payload: Result<Json<RefreshTokenRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let token = credential(payload)?;
    let issued = state.tokens.consume_and_rotate(&token).await?;
    Ok(success_to_api_response(issued))
}

#[axum::debug_handler]
pub async fn logout(
    State(state): State<AppState>,
    payload: Result<Json<RefreshTokenRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let token = credential(payload)?;
    let revoked = state.tokens.revoke_credential(&token).await?;
    Ok(success_to_api_response(LogoutResponse {
        revoked: revoked as u64,
    }))
}

/// 撤销该主体的全部会话，需要一个仍然有效的刷新令牌
#[axum::debug_handler]
pub async fn logout_all(
    State(state): State<AppState>,
    payload: Result<Json<RefreshTokenRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let token = credential(payload)?;
    let revoked = state.tokens.revoke_all_for_credential(&token).await?;
    Ok(success_to_api_response(LogoutResponse { revoked }))
}
