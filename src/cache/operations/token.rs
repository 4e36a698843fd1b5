use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::cache::keys::{AUTH_NAMESPACE, refresh_token_key, refresh_token_pattern};
use crate::cache::models::token::{IssuedTokens, RefreshTokenRecord, SubjectAttributes};
use crate::cache::store::{CacheError, DistributedStore};
use crate::utils::{AccessClaims, RefreshClaims, TokenError, TokenSigner, hash_identity};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// 不区分不存在、过期、已被使用，统一对外报告
    #[error("Invalid or expired refresh token")]
    InvalidOrExpiredCredential,
    #[error(transparent)]
    Store(#[from] CacheError),
    #[error("failed to sign credential")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

/// 刷新令牌存储
///
/// 每个令牌ID只能换取一次新令牌：消费时先删除旧记录，再创建新记录，
/// 重放已消费的令牌必然查不到记录。
pub struct RefreshTokenStore {
    store: Arc<DistributedStore>,
    signer: TokenSigner,
}

impl RefreshTokenStore {
    pub fn new(store: Arc<DistributedStore>, signer: TokenSigner) -> Self {
        Self { store, signer }
    }

    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    /// 签发访问令牌和刷新令牌，并记录刷新令牌
    pub async fn issue(&self, subject_id: &str, attributes: SubjectAttributes) -> Result<IssuedTokens, AuthError> {
        let token_id = Uuid::new_v4().to_string();
        let refresh_token = self.signer.sign_refresh(subject_id, &token_id)?;
        let access_token = self.signer.sign_access(subject_id, &attributes)?;

        let record = RefreshTokenRecord {
            token_id: token_id.clone(),
            subject_id: subject_id.to_string(),
            attributes,
            issued_at: Utc::now().timestamp(),
        };
        self.store
            .set(
                &refresh_token_key(subject_id, &token_id),
                &record,
                Some(self.signer.refresh_ttl_secs()),
                Some(AUTH_NAMESPACE),
            )
            .await?;

        tracing::debug!(subject = %hash_identity(subject_id), "Refresh token issued");
        Ok(IssuedTokens {
            token_id,
            access_token,
            refresh_token,
            expires_in: self.signer.access_ttl_secs(),
        })
    }

    /// 消费刷新令牌并轮换出新令牌
    pub async fn consume_and_rotate(&self, credential: &str) -> Result<IssuedTokens, AuthError> {
        let (key, record) = self.live_record(credential).await?;

        // 删除必须先于签发；删除落空说明并发的另一次消费已经成功
        if !self.store.delete(&key, Some(AUTH_NAMESPACE)).await? {
            tracing::warn!(subject = %hash_identity(&record.subject_id), "Refresh token consumed concurrently");
            return Err(AuthError::InvalidOrExpiredCredential);
        }

        let issued = self.issue(&record.subject_id, record.attributes).await?;
        tracing::info!(subject = %hash_identity(&record.subject_id), "Refresh token rotated");
        Ok(issued)
    }

    /// 删除单个刷新令牌（登出）
    pub async fn revoke(&self, subject_id: &str, token_id: &str) -> Result<bool, AuthError> {
        Ok(self
            .store
            .delete(&refresh_token_key(subject_id, token_id), Some(AUTH_NAMESPACE))
            .await?)
    }

    pub async fn revoke_credential(&self, credential: &str) -> Result<bool, AuthError> {
        let claims = self.verify_refresh(credential)?;
        self.revoke(&claims.sub, &claims.jti).await
    }

    /// 删除主体的全部刷新令牌
    ///
    /// 基于模式删除，扫描期间新签发的令牌可能保留。
    pub async fn revoke_all(&self, subject_id: &str) -> Result<u64, AuthError> {
        let revoked = self
            .store
            .delete_by_pattern(&refresh_token_pattern(subject_id), Some(AUTH_NAMESPACE))
            .await?;
        tracing::info!(subject = %hash_identity(subject_id), revoked, "Revoked all refresh tokens");
        Ok(revoked)
    }

    /// 凭一个仍有效的刷新令牌撤销该主体全部会话
    pub async fn revoke_all_for_credential(&self, credential: &str) -> Result<u64, AuthError> {
        let (_, record) = self.live_record(credential).await?;
        self.revoke_all(&record.subject_id).await
    }

    pub fn verify_access(&self, token: &str) -> Result<AccessClaims, TokenError> {
        self.signer.verify_access(token)
    }

    fn verify_refresh(&self, credential: &str) -> Result<RefreshClaims, AuthError> {
        self.signer.verify_refresh(credential).map_err(|e| {
            tracing::debug!(error = %e, "Refresh credential failed verification");
            AuthError::InvalidOrExpiredCredential
        })
    }

    async fn live_record(&self, credential: &str) -> Result<(String, RefreshTokenRecord), AuthError> {
        let claims = self.verify_refresh(credential)?;
        let key = refresh_token_key(&claims.sub, &claims.jti);
        let record: RefreshTokenRecord = self
            .store
            .get(&key, Some(AUTH_NAMESPACE))
            .await
            .ok_or(AuthError::InvalidOrExpiredCredential)?;

        if record.subject_id != claims.sub || record.token_id != claims.jti {
            return Err(AuthError::InvalidOrExpiredCredential);
        }
        Ok((key, record))
    }
}
