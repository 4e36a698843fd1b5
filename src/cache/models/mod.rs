/// 缓存数据模型
/// 定义限流判定和刷新令牌记录的结构体

pub mod rate_limit;
pub mod token;

// 重新导出常用类型
pub use rate_limit::*;
pub use token::*;
