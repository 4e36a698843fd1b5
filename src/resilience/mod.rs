//! 熔断器
//!
//! 按依赖名称隔离故障：滚动窗口内失败率超过阈值后短路调用，
//! 冷却时间过后放行一次试探调用决定恢复或重新打开。
//! 状态变化以事件形式广播，由日志任务消费。

pub mod circuit_breaker;
pub mod registry;

use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerError, CircuitState};
pub use registry::CircuitBreakerRegistry;

/// 熔断参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerOptions {
    /// 单次调用超时
    pub timeout: Duration,
    /// 失败率阈值（百分比），严格大于时打开
    pub error_threshold_percentage: u8,
    /// 打开后到允许试探的冷却时间
    pub reset_timeout: Duration,
    /// 参与判定的最少样本数
    pub volume_threshold: u32,
    /// 统计窗口
    pub rolling_window: Duration,
}

impl Default for BreakerOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(3_000),
            error_threshold_percentage: 50,
            reset_timeout: Duration::from_millis(30_000),
            volume_threshold: 10,
            rolling_window: Duration::from_millis(10_000),
        }
    }
}

impl BreakerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: Duration::from_millis(config.breaker_timeout_ms),
            error_threshold_percentage: config.breaker_error_threshold,
            reset_timeout: Duration::from_millis(config.breaker_reset_timeout_ms),
            volume_threshold: config.breaker_volume_threshold,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerEventKind {
    Open,
    HalfOpen,
    Close,
    Failure,
    Timeout,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerEvent {
    pub name: String,
    pub kind: BreakerEventKind,
}

/// 消费熔断事件并写入日志，发送端全部关闭后退出
pub fn spawn_event_logger(mut events: broadcast::Receiver<BreakerEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Circuit breaker event logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &BreakerEvent) {
    let name = event.name.as_str();
    match event.kind {
        BreakerEventKind::Open => tracing::warn!(breaker = name, "Circuit breaker opened"),
        BreakerEventKind::HalfOpen => tracing::info!(breaker = name, "Circuit breaker half-open, sending trial call"),
        BreakerEventKind::Close => tracing::info!(breaker = name, "Circuit breaker closed"),
        BreakerEventKind::Failure => tracing::debug!(breaker = name, "Protected call failed"),
        BreakerEventKind::Timeout => tracing::debug!(breaker = name, "Protected call timed out"),
        BreakerEventKind::Reject => tracing::debug!(breaker = name, "Call short-circuited"),
    }
}
