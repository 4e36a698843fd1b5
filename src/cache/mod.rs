// 缓存模块
// 存储后端抽象、命名空间键和基于存储的操作

pub mod backend;
pub mod keys;
pub mod models;
pub mod operations;
pub mod store;

// 重新导出常用类型，方便其他模块使用
pub use backend::{MemoryBackend, RedisBackend, StoreBackend, StoreError};
pub use operations::{RefreshTokenStore, SlidingWindowLimiter};
pub use store::{BatchOp, CacheError, DistributedStore};
