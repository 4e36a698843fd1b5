use serde::{Deserialize, Serialize};

/// 签发时主体属性的快照
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SubjectAttributes {
    pub role: String,
    pub email: String,
}

/// 刷新令牌缓存数据模型
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RefreshTokenRecord {
    pub token_id: String,
    pub subject_id: String,
    #[serde(flatten)]
    pub attributes: SubjectAttributes,
    pub issued_at: i64, // Unix timestamp
}

/// 一次签发的结果
#[derive(Debug, Serialize, Clone)]
pub struct IssuedTokens {
    #[serde(skip_serializing)]
    pub token_id: String,
    pub access_token: String,
    pub refresh_token: String,
    /// 访问令牌有效期（秒）
    pub expires_in: u64,
}
