use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::backend::{KeyTtl, StoreBackend, StoreCommand, StoreError, StoreReply};
use super::keys::qualify;

const DEFAULT_SCAN_BATCH: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// 调用方传入了无法 JSON 往返的值
    #[error("value is not JSON serializable: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// 批量写操作
#[derive(Debug, Clone)]
pub enum BatchOp {
    Set {
        key: String,
        value: serde_json::Value,
        ttl_secs: Option<u64>,
    },
    Delete {
        key: String,
    },
    Increment {
        key: String,
        by: i64,
    },
}

/// 带命名空间的分布式缓存
///
/// 读操作失败时按未命中处理（调用方无法区分未命中和存储故障），
/// 写操作失败时把错误返回给调用方。
#[derive(Clone)]
pub struct DistributedStore {
    backend: Arc<dyn StoreBackend>,
    default_namespace: String,
    scan_batch: usize,
}

impl DistributedStore {
    pub fn new(backend: Arc<dyn StoreBackend>, default_namespace: impl Into<String>) -> Self {
        Self {
            backend,
            default_namespace: default_namespace.into(),
            scan_batch: DEFAULT_SCAN_BATCH,
        }
    }

    pub fn with_scan_batch(mut self, scan_batch: usize) -> Self {
        self.scan_batch = scan_batch.max(1);
        self
    }

    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    fn key(&self, key: &str, namespace: Option<&str>) -> String {
        qualify(namespace.unwrap_or(&self.default_namespace), key)
    }

    /// 写入缓存，`ttl_secs` 为空或 0 表示不过期
    pub async fn set<T>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: Option<u64>,
        namespace: Option<&str>,
    ) -> Result<(), CacheError>
    where
        T: Serialize + ?Sized,
    {
        let json = serde_json::to_string(value)?;
        let ttl = ttl_secs.filter(|ttl| *ttl > 0);
        self.backend
            .set(&self.key(key, namespace), &json, ttl)
            .await
            .inspect_err(|e| {
                tracing::error!(namespace = namespace.unwrap_or(&self.default_namespace), error = %e, "Cache set failed");
            })?;
        Ok(())
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str, namespace: Option<&str>) -> Option<T> {
        let raw = match self.backend.get(&self.key(key, namespace)).await {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!(namespace = namespace.unwrap_or(&self.default_namespace), error = %e, "Cache get failed, treating as miss");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "Cached value could not be deserialized, treating as miss");
                None
            }
        }
    }

    /// 删除单个键，返回键是否存在
    pub async fn delete(&self, key: &str, namespace: Option<&str>) -> Result<bool, CacheError> {
        let removed = self.backend.del(&[self.key(key, namespace)]).await?;
        Ok(removed > 0)
    }

    /// 按模式删除
    ///
    /// 基于游标的增量扫描，不是原子操作：扫描期间新写入的键可能不会被删除。
    pub async fn delete_by_pattern(&self, pattern: &str, namespace: Option<&str>) -> Result<u64, CacheError> {
        let pattern = self.key(pattern, namespace);
        let mut cursor = 0;
        let mut deleted = 0;
        loop {
            let (next, keys) = self.backend.scan(cursor, &pattern, self.scan_batch).await?;
            if !keys.is_empty() {
                deleted += self.backend.del(&keys).await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        tracing::debug!(deleted, "Pattern delete finished");
        Ok(deleted)
    }

    pub async fn exists(&self, key: &str, namespace: Option<&str>) -> bool {
        self.backend
            .exists(&self.key(key, namespace))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Cache exists failed, treating as absent");
                false
            })
    }

    pub async fn mget<T: DeserializeOwned>(&self, keys: &[&str], namespace: Option<&str>) -> Vec<Option<T>> {
        let qualified: Vec<String> = keys.iter().map(|k| self.key(k, namespace)).collect();
        match self.backend.mget(&qualified).await {
            Ok(values) => values
                .into_iter()
                .map(|raw| raw.and_then(|raw| serde_json::from_str(&raw).ok()))
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Cache mget failed, treating as misses");
                keys.iter().map(|_| None).collect()
            }
        }
    }

    /// 一次往返写入多个键（非事务）
    pub async fn mset<T: Serialize>(
        &self,
        entries: &[(&str, T)],
        ttl_secs: Option<u64>,
        namespace: Option<&str>,
    ) -> Result<(), CacheError> {
        let ops = entries
            .iter()
            .map(|(key, value)| -> Result<BatchOp, serde_json::Error> {
                Ok(BatchOp::Set {
                    key: key.to_string(),
                    value: serde_json::to_value(value)?,
                    ttl_secs,
                })
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()?;
        self.batch(ops, namespace).await?;
        Ok(())
    }

    /// 原子自增，键不存在时从 0 开始
    ///
    /// 自增不可重放：命令发出后若超时，后端不会重试，调用方收到错误时
    /// 无法判断这次自增是否已经生效，计数至多多出一次。
    pub async fn increment(&self, key: &str, by: i64, namespace: Option<&str>) -> Result<i64, CacheError> {
        Ok(self.backend.incr(&self.key(key, namespace), by).await?)
    }

    /// 以管道方式执行一组写操作
    pub async fn batch(&self, ops: Vec<BatchOp>, namespace: Option<&str>) -> Result<Vec<StoreReply>, CacheError> {
        let commands = ops
            .into_iter()
            .map(|op| -> Result<StoreCommand, serde_json::Error> {
                Ok(match op {
                    BatchOp::Set { key, value, ttl_secs } => StoreCommand::Set {
                        key,
                        value: serde_json::to_string(&value)?,
                        ttl_secs: ttl_secs.filter(|ttl| *ttl > 0),
                    },
                    BatchOp::Delete { key } => StoreCommand::Delete { key },
                    BatchOp::Increment { key, by } => StoreCommand::Incr { key, by },
                })
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()?;
        Ok(self.pipeline(commands, namespace).await?)
    }

    /// 原始管道访问（有序集合等），键自动加命名空间
    pub async fn pipeline(
        &self,
        commands: Vec<StoreCommand>,
        namespace: Option<&str>,
    ) -> Result<Vec<StoreReply>, StoreError> {
        let prefix = namespace.unwrap_or(&self.default_namespace);
        let commands = commands.into_iter().map(|c| c.prefixed(prefix)).collect();
        self.backend.pipeline(commands).await
    }

    pub async fn zcard(&self, key: &str, namespace: Option<&str>) -> Result<u64, StoreError> {
        self.backend.zcard(&self.key(key, namespace)).await
    }

    pub async fn ttl(&self, key: &str, namespace: Option<&str>) -> Result<KeyTtl, StoreError> {
        self.backend.ttl(&self.key(key, namespace)).await
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.backend.ping().await
    }
}
