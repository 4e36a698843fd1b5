/// 缓存操作
/// 基于分布式存储实现的限流和刷新令牌逻辑

// 滑动窗口限流
pub mod rate_limit;

// 刷新令牌轮换
pub mod token;

pub use rate_limit::{ClientIdentity, KeyFn, RateLimitPolicy, SlidingWindowLimiter};
pub use token::{AuthError, RefreshTokenStore};
