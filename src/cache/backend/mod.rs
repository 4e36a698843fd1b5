//! 远程键值/有序集合存储的协议边界
//!
//! `StoreBackend` 只暴露单键原子命令和管道批量命令，不提供跨命令事务。
//! 所有调用方的正确性都依赖这些命令本身的原子性。

use async_trait::async_trait;

mod memory;
mod redis_backend;

pub use self::memory::MemoryBackend;
pub use self::redis_backend::RedisBackend;

/// 存储层错误
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// 连接失败或重试耗尽
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store command timed out")]
    Timeout,
    /// 存储返回了无法识别的响应
    #[error("unexpected store reply: {0}")]
    Protocol(String),
}

/// 管道中的单条命令
///
/// 管道作为一次网络往返发送，但不是事务。
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCommand {
    Set {
        key: String,
        value: String,
        ttl_secs: Option<u64>,
    },
    Delete {
        key: String,
    },
    Incr {
        key: String,
        by: i64,
    },
    ZAdd {
        key: String,
        score: i64,
        member: String,
    },
    ZCard {
        key: String,
    },
    ZRemRangeByScore {
        key: String,
        min: i64,
        max: i64,
    },
    PExpire {
        key: String,
        millis: u64,
    },
    Ttl {
        key: String,
    },
}

impl StoreCommand {
    pub fn key(&self) -> &str {
        match self {
            StoreCommand::Set { key, .. }
            | StoreCommand::Delete { key }
            | StoreCommand::Incr { key, .. }
            | StoreCommand::ZAdd { key, .. }
            | StoreCommand::ZCard { key }
            | StoreCommand::ZRemRangeByScore { key, .. }
            | StoreCommand::PExpire { key, .. }
            | StoreCommand::Ttl { key } => key,
        }
    }

    /// 重复执行是否与执行一次等价；ZADD 重放的是同一个成员
    pub fn is_replayable(&self) -> bool {
        !matches!(self, StoreCommand::Incr { .. })
    }

    /// 为命令的键加上命名空间前缀
    pub fn prefixed(self, prefix: &str) -> Self {
        let qualify = |key: String| format!("{}:{}", prefix, key);
        match self {
            StoreCommand::Set { key, value, ttl_secs } => StoreCommand::Set {
                key: qualify(key),
                value,
                ttl_secs,
            },
            StoreCommand::Delete { key } => StoreCommand::Delete { key: qualify(key) },
            StoreCommand::Incr { key, by } => StoreCommand::Incr { key: qualify(key), by },
            StoreCommand::ZAdd { key, score, member } => StoreCommand::ZAdd {
                key: qualify(key),
                score,
                member,
            },
            StoreCommand::ZCard { key } => StoreCommand::ZCard { key: qualify(key) },
            StoreCommand::ZRemRangeByScore { key, min, max } => StoreCommand::ZRemRangeByScore {
                key: qualify(key),
                min,
                max,
            },
            StoreCommand::PExpire { key, millis } => StoreCommand::PExpire {
                key: qualify(key),
                millis,
            },
            StoreCommand::Ttl { key } => StoreCommand::Ttl { key: qualify(key) },
        }
    }
}

/// 管道命令的返回值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreReply {
    Ok,
    Int(i64),
}

impl StoreReply {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            StoreReply::Int(value) => Some(*value),
            StoreReply::Ok => None,
        }
    }
}

/// 剩余存活时间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    Persistent,
    Seconds(u64),
}

impl KeyTtl {
    /// 按 Redis TTL 命令的约定解析（-2 不存在，-1 无过期）
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            -2 => KeyTtl::Missing,
            r if r < 0 => KeyTtl::Persistent,
            r => KeyTtl::Seconds(r as u64),
        }
    }

    pub fn seconds(&self) -> Option<u64> {
        match self {
            KeyTtl::Seconds(secs) => Some(*secs),
            _ => None,
        }
    }
}

#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), StoreError>;

    /// 返回实际删除的键数量
    async fn del(&self, keys: &[String]) -> Result<u64, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn incr(&self, key: &str, by: i64) -> Result<i64, StoreError>;

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;

    /// 增量扫描，返回下一个游标（0 表示结束）和本批匹配的键
    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError>;

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError>;

    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;

    async fn zremrangebyscore(&self, key: &str, min: i64, max: i64) -> Result<u64, StoreError>;

    async fn pexpire(&self, key: &str, millis: u64) -> Result<bool, StoreError>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    /// 一次往返发送多条命令，返回值与命令一一对应
    async fn pipeline(&self, commands: Vec<StoreCommand>) -> Result<Vec<StoreReply>, StoreError>;
}
