/// 缓存键模块
/// 命名空间常量和各子系统的键生成函数

pub mod rate_limit_keys;
pub mod token_keys;

pub use rate_limit_keys::rate_limit_key;
pub use token_keys::{refresh_token_key, refresh_token_pattern};

/// 限流窗口命名空间
pub const RATE_LIMIT_NAMESPACE: &str = "ratelimit";

/// 认证相关命名空间
pub const AUTH_NAMESPACE: &str = "auth";

/// 生成带命名空间的完整键
pub fn qualify(namespace: &str, key: &str) -> String {
    format!("{}:{}", namespace, key)
}

/// 编码键中的标识符片段
///
/// 分隔符 `:`、`%` 和 glob 元字符按百分号编码，编码结果既不会跨越片段，
/// 也可以原样放进匹配模式。
pub fn encode_segment(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            ':' | '%' | '*' | '?' | '[' | ']' | '\\' => encoded.push_str(&format!("%{:02X}", c as u32)),
            _ => encoded.push(c),
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_keys_carry_namespace() {
        assert_eq!(qualify("cache", "task:1"), "cache:task:1");
    }

    #[test]
    fn segments_cannot_contain_separators_or_wildcards() {
        assert_eq!(encode_segment("plain-id_42"), "plain-id_42");
        assert_eq!(encode_segment("u1:x"), "u1%3Ax");
        assert_eq!(encode_segment("u*1?"), "u%2A1%3F");
        assert_eq!(encode_segment("50%"), "50%25");
        assert_eq!(encode_segment("a\\[b]"), "a%5C%5Bb%5D");
    }
}
