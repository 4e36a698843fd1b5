/// 限流键前缀
const RATE_LIMIT_PREFIX: &str = "window:";

/// 生成限流窗口键
pub fn rate_limit_key(identity: &str) -> String {
    format!("{}{}", RATE_LIMIT_PREFIX, identity)
}
