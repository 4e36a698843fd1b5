use super::encode_segment;

/// 刷新令牌键前缀
const REFRESH_TOKEN_PREFIX: &str = "refresh:";

/// 生成刷新令牌键，同时按主体和令牌ID划分
pub fn refresh_token_key(subject_id: &str, token_id: &str) -> String {
    format!("{}{}:{}", REFRESH_TOKEN_PREFIX, encode_segment(subject_id), token_id)
}

/// 匹配某主体全部刷新令牌的模式
pub fn refresh_token_pattern(subject_id: &str) -> String {
    format!("{}{}:*", REFRESH_TOKEN_PREFIX, encode_segment(subject_id))
}
