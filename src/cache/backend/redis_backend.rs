use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client as RedisClient, RedisError, RedisResult, Value};
use tokio::sync::OnceCell;

use super::{KeyTtl, StoreBackend, StoreCommand, StoreError, StoreReply};

const BASE_BACKOFF_MS: u64 = 50;
const MAX_BACKOFF_MS: u64 = 1_000;

/// Redis 存储后端
///
/// 连接在首次使用时建立，存储不可用时进程仍可启动。
/// 每条命令都有超时限制，瞬时错误按指数退避重试，重试耗尽视为存储不可用。
/// 不可重放的命令（自增）一旦发出就不再重试，只有取连接失败时才会重试。
pub struct RedisBackend {
    client: RedisClient,
    connection: OnceCell<ConnectionManager>,
    command_timeout: Duration,
    max_retries: u32,
}

impl RedisBackend {
    pub fn new(url: &str, command_timeout: Duration, max_retries: u32) -> Result<Self, StoreError> {
        let client = RedisClient::open(url)
            .map_err(|e| StoreError::Unavailable(format!("invalid redis url: {:?}", e.kind())))?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            command_timeout,
            max_retries,
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                let config = ConnectionManagerConfig::new()
                    .set_connection_timeout(self.command_timeout)
                    .set_response_timeout(self.command_timeout)
                    .set_number_of_retries(self.max_retries as usize);
                tokio::time::timeout(
                    self.command_timeout,
                    ConnectionManager::new_with_config(self.client.clone(), config),
                )
                .await
                .map_err(|_| StoreError::Timeout)?
                .map_err(|e| StoreError::Unavailable(e.to_string()))
            })
            .await?;
        Ok(manager.clone())
    }

    /// 带超时和有限重试地执行一条命令
    async fn run<T, F, Fut>(&self, op: &'static str, replay: Replay, command: F) -> Result<T, StoreError>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let mut attempt = 0;
        loop {
            let (failure, stage) = match self.connection().await {
                Ok(conn) => match tokio::time::timeout(self.command_timeout, command(conn)).await {
                    Ok(Ok(value)) => return Ok(value),
                    Ok(Err(err)) if !is_transient(&err) => {
                        return Err(StoreError::Protocol(err.to_string()));
                    }
                    Ok(Err(err)) => (StoreError::Unavailable(err.to_string()), Stage::Sent),
                    Err(_) => (StoreError::Timeout, Stage::Sent),
                },
                Err(err) => (err, Stage::Connecting),
            };

            if !should_retry(replay, stage) {
                tracing::warn!(op, error = %failure, "Redis command may have been applied, not retrying");
                return Err(failure);
            }
            if attempt >= self.max_retries {
                tracing::warn!(op, attempts = attempt + 1, error = %failure, "Redis command gave up");
                return Err(failure);
            }
            attempt += 1;
            let delay = backoff(attempt);
            tracing::debug!(op, attempt, delay_ms = delay.as_millis() as u64, "Retrying Redis command");
            tokio::time::sleep(delay).await;
        }
    }
}

/// 命令重复执行是否安全
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    Safe,
    Unsafe,
}

impl Replay {
    fn of(commands: &[StoreCommand]) -> Self {
        if commands.iter().all(StoreCommand::is_replayable) {
            Replay::Safe
        } else {
            Replay::Unsafe
        }
    }
}

/// 失败发生的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// 命令尚未发出
    Connecting,
    /// 命令已发出，服务端可能已经执行
    Sent,
}

fn should_retry(replay: Replay, stage: Stage) -> bool {
    replay == Replay::Safe || stage == Stage::Connecting
}

fn is_transient(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout()
}

fn backoff(attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(BASE_BACKOFF_MS.saturating_mul(factor).min(MAX_BACKOFF_MS))
}

fn to_reply(value: Value) -> Result<StoreReply, StoreError> {
    match value {
        Value::Int(n) => Ok(StoreReply::Int(n)),
        Value::Okay | Value::SimpleString(_) | Value::Nil => Ok(StoreReply::Ok),
        other => Err(StoreError::Protocol(format!("{:?}", other))),
    }
}

fn build_pipeline(commands: &[StoreCommand]) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    for command in commands {
        match command {
            StoreCommand::Set { key, value, ttl_secs } => {
                let cmd = pipe.cmd("SET").arg(key).arg(value);
                if let Some(ttl) = ttl_secs {
                    cmd.arg("EX").arg(*ttl);
                }
            }
            StoreCommand::Delete { key } => {
                pipe.cmd("DEL").arg(key);
            }
            StoreCommand::Incr { key, by } => {
                pipe.cmd("INCRBY").arg(key).arg(*by);
            }
            StoreCommand::ZAdd { key, score, member } => {
                pipe.cmd("ZADD").arg(key).arg(*score).arg(member);
            }
            StoreCommand::ZCard { key } => {
                pipe.cmd("ZCARD").arg(key);
            }
            StoreCommand::ZRemRangeByScore { key, min, max } => {
                pipe.cmd("ZREMRANGEBYSCORE").arg(key).arg(*min).arg(*max);
            }
            StoreCommand::PExpire { key, millis } => {
                pipe.cmd("PEXPIRE").arg(key).arg(*millis);
            }
            StoreCommand::Ttl { key } => {
                pipe.cmd("TTL").arg(key);
            }
        }
    }
    pipe
}

#[async_trait]
impl StoreBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.run("get", Replay::Safe, |mut conn| async move {
            let value: Option<String> = conn.get(key).await?;
            Ok::<_, RedisError>(value)
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), StoreError> {
        self.run("set", Replay::Safe, |mut conn| async move {
            match ttl_secs {
                Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl).await,
                None => conn.set::<_, _, ()>(key, value).await,
            }
        })
        .await
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.run("del", Replay::Safe, |mut conn| async move {
            let removed: u64 = conn.del(keys).await?;
            Ok::<_, RedisError>(removed)
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.run("exists", Replay::Safe, |mut conn| async move {
            let exists: bool = conn.exists(key).await?;
            Ok::<_, RedisError>(exists)
        })
        .await
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        self.run("incr", Replay::Unsafe, |mut conn| async move {
            let value: i64 = conn.incr(key, by).await?;
            Ok::<_, RedisError>(value)
        })
        .await
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.run("mget", Replay::Safe, |mut conn| async move {
            let values: Vec<Option<String>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
            Ok::<_, RedisError>(values)
        })
        .await
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        self.run("scan", Replay::Safe, |mut conn| async move {
            let page: (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(count)
                .query_async(&mut conn)
                .await?;
            Ok::<_, RedisError>(page)
        })
        .await
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError> {
        self.run("zadd", Replay::Safe, |mut conn| async move {
            let _: i64 = conn.zadd(key, member, score).await?;
            Ok::<_, RedisError>(())
        })
        .await
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.run("zcard", Replay::Safe, |mut conn| async move {
            let count: u64 = conn.zcard(key).await?;
            Ok::<_, RedisError>(count)
        })
        .await
    }

    async fn zremrangebyscore(&self, key: &str, min: i64, max: i64) -> Result<u64, StoreError> {
        self.run("zremrangebyscore", Replay::Safe, |mut conn| async move {
            let removed: u64 = conn.zrembyscore(key, min, max).await?;
            Ok::<_, RedisError>(removed)
        })
        .await
    }

    async fn pexpire(&self, key: &str, millis: u64) -> Result<bool, StoreError> {
        self.run("pexpire", Replay::Safe, |mut conn| async move {
            let applied: bool = conn.pexpire(key, millis as i64).await?;
            Ok::<_, RedisError>(applied)
        })
        .await
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        self.run("ttl", Replay::Safe, |mut conn| async move {
            let raw: i64 = conn.ttl(key).await?;
            Ok::<_, RedisError>(KeyTtl::from_raw(raw))
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.run("ping", Replay::Safe, |mut conn| async move {
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, RedisError>(())
        })
        .await
    }

    async fn pipeline(&self, commands: Vec<StoreCommand>) -> Result<Vec<StoreReply>, StoreError> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let pipe = build_pipeline(&commands);
        let values: Vec<Value> = self
            .run("pipeline", Replay::of(&commands), |mut conn| {
                let pipe = pipe.clone();
                async move {
                    let values: Vec<Value> = pipe.query_async(&mut conn).await?;
                    Ok::<_, RedisError>(values)
                }
            })
            .await?;

        if values.len() != commands.len() {
            return Err(StoreError::Protocol(format!(
                "pipeline returned {} replies for {} commands",
                values.len(),
                commands.len()
            )));
        }
        values.into_iter().map(to_reply).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff(1), Duration::from_millis(50));
        assert_eq!(backoff(2), Duration::from_millis(100));
        assert_eq!(backoff(3), Duration::from_millis(200));
        assert_eq!(backoff(10), Duration::from_millis(MAX_BACKOFF_MS));
    }

    #[test]
    fn replies_map_to_store_replies() {
        assert_eq!(to_reply(Value::Int(3)).unwrap(), StoreReply::Int(3));
        assert_eq!(to_reply(Value::Okay).unwrap(), StoreReply::Ok);
        assert!(to_reply(Value::Array(vec![])).is_err());
    }

    #[test]
    fn only_replay_safe_commands_retry_after_send() {
        assert!(should_retry(Replay::Safe, Stage::Sent));
        assert!(should_retry(Replay::Safe, Stage::Connecting));
        assert!(should_retry(Replay::Unsafe, Stage::Connecting));
        assert!(!should_retry(Replay::Unsafe, Stage::Sent));
    }

    #[test]
    fn pipelines_with_increments_are_not_replayed() {
        let window = vec![
            StoreCommand::ZAdd {
                key: "w".into(),
                score: 1,
                member: "1-abc".into(),
            },
            StoreCommand::PExpire {
                key: "w".into(),
                millis: 1_000,
            },
        ];
        assert_eq!(Replay::of(&window), Replay::Safe);

        let counter = vec![StoreCommand::Incr { key: "c".into(), by: 1 }];
        assert_eq!(Replay::of(&counter), Replay::Unsafe);
    }

    #[test]
    fn rejects_malformed_url() {
        assert!(RedisBackend::new("not a url", Duration::from_millis(10), 0).is_err());
    }
}
