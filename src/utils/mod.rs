use axum::Json;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cache::models::SubjectAttributes;
use crate::config::Config;

/// 标识哈希保留的十六进制字符数
const IDENTITY_HASH_LEN: usize = 16;

/// 对客户端标识做单向哈希并截断，日志和键中不出现原始 IP
pub fn hash_identity(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(IDENTITY_HASH_LEN);
    hex
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String, // 主体ID
    pub role: String,
    pub email: String,
    pub typ: TokenType,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub sub: String,
    pub jti: String, // 刷新令牌ID
    pub typ: TokenType,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error(transparent)]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("unexpected token type")]
    WrongType,
}

/// JWT 签发与校验，访问令牌和刷新令牌使用不同密钥
#[derive(Clone)]
pub struct TokenSigner {
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
    access_ttl_secs: u64,
    refresh_ttl_secs: u64,
}

impl TokenSigner {
    pub fn new(access_secret: &str, refresh_secret: &str, access_ttl_secs: u64, refresh_ttl_secs: u64) -> Self {
        Self {
            access_encoding: EncodingKey::from_secret(access_secret.as_bytes()),
            access_decoding: DecodingKey::from_secret(access_secret.as_bytes()),
            refresh_encoding: EncodingKey::from_secret(refresh_secret.as_bytes()),
            refresh_decoding: DecodingKey::from_secret(refresh_secret.as_bytes()),
            access_ttl_secs,
            refresh_ttl_secs,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.jwt_secret,
            &config.jwt_refresh_secret,
            config.jwt_expiration().as_secs(),
            config.jwt_refresh_expiration().as_secs(),
        )
    }

    pub fn access_ttl_secs(&self) -> u64 {
        self.access_ttl_secs
    }

    pub fn refresh_ttl_secs(&self) -> u64 {
        self.refresh_ttl_secs
    }

    pub fn sign_access(
        &self,
        subject_id: &str,
        attributes: &SubjectAttributes,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now().timestamp();
        let claims = AccessClaims {
            sub: subject_id.to_string(),
            role: attributes.role.clone(),
            email: attributes.email.clone(),
            typ: TokenType::Access,
            iat: now,
            exp: now + self.access_ttl_secs as i64,
        };
        encode(&Header::default(), &claims, &self.access_encoding)
    }

    pub fn sign_refresh(&self, subject_id: &str, token_id: &str) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now().timestamp();
        let claims = RefreshClaims {
            sub: subject_id.to_string(),
            jti: token_id.to_string(),
            typ: TokenType::Refresh,
            iat: now,
            exp: now + self.refresh_ttl_secs as i64,
        };
        encode(&Header::default(), &claims, &self.refresh_encoding)
    }

    pub fn verify_access(&self, token: &str) -> Result<AccessClaims, TokenError> {
        let claims: AccessClaims = verify(token, &self.access_decoding)?;
        if claims.typ != TokenType::Access {
            return Err(TokenError::WrongType);
        }
        Ok(claims)
    }

    pub fn verify_refresh(&self, token: &str) -> Result<RefreshClaims, TokenError> {
        let claims: RefreshClaims = verify(token, &self.refresh_decoding)?;
        if claims.typ != TokenType::Refresh {
            return Err(TokenError::WrongType);
        }
        Ok(claims)
    }
}

fn verify<T: DeserializeOwned>(token: &str, key: &DecodingKey) -> Result<T, jsonwebtoken::errors::Error> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    let token_data = decode::<T>(token, key, &validation)?;
    Ok(token_data.claims)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resp_data: Option<T>,
}

pub fn success_to_api_response<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        code: error_codes::SUCCESS,
        msg: "success".into(),
        resp_data: Some(data),
    })
}

pub mod error_codes {
    pub const SUCCESS: i32 = 0;
}
