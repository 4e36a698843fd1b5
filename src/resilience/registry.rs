use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use super::circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerError};
use super::{BreakerEvent, BreakerOptions};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// 熔断器注册表
///
/// 进程启动时创建一次，按名称惰性创建熔断器并在进程生命周期内复用。
/// 同名熔断器的参数以首次创建时为准。
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    defaults: BreakerOptions,
    events: broadcast::Sender<BreakerEvent>,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: BreakerOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            breakers: DashMap::new(),
            defaults,
            events,
        }
    }

    pub fn defaults(&self) -> &BreakerOptions {
        &self.defaults
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    pub fn breaker(&self, name: &str, options: Option<BreakerOptions>) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(breaker = name, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(
                    name,
                    options.unwrap_or(self.defaults),
                    self.events.clone(),
                ))
            })
            .clone()
    }

    pub async fn execute<T, E, F, Fut>(
        &self,
        name: &str,
        options: Option<BreakerOptions>,
        operation: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.breaker(name, options).call(operation).await
    }

    /// 短路时返回降级值；操作本身的失败和超时仍然返回错误
    pub async fn execute_with_fallback<T, E, F, Fut, FB>(
        &self,
        name: &str,
        options: Option<BreakerOptions>,
        operation: F,
        fallback: FB,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce() -> T,
    {
        match self.execute(name, options, operation).await {
            Err(err) if err.is_open() => Ok(fallback()),
            other => other,
        }
    }

    /// 全部熔断器状态，按名称排序
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> =
            self.breakers.iter().map(|entry| entry.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}
