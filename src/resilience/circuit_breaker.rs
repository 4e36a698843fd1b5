use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::{BreakerEvent, BreakerEventKind, BreakerOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// 短路，不透出依赖的任何细节
    #[error("dependency unavailable")]
    Open { name: String },
    #[error("operation timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
    #[error("{0}")]
    Operation(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub samples: usize,
    pub failures: usize,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    // (记录时间, 是否成功)
    outcomes: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl BreakerInner {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some((at, _)) = self.outcomes.front() {
            if now.duration_since(*at) >= window {
                self.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn failures(&self) -> usize {
        self.outcomes.iter().filter(|(_, ok)| !ok).count()
    }
}

/// 单个依赖的熔断器
pub struct CircuitBreaker {
    name: String,
    options: BreakerOptions,
    inner: Mutex<BreakerInner>,
    events: broadcast::Sender<BreakerEvent>,
}

/// 半开试探调用的许可；调用方中途放弃时归还试探名额
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.breaker.inner.lock();
            if inner.state == CircuitState::HalfOpen {
                inner.trial_in_flight = false;
            }
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, options: BreakerOptions, events: broadcast::Sender<BreakerEvent>) -> Self {
        Self {
            name: name.into(),
            options,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                outcomes: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
            }),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &BreakerOptions {
        &self.options
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock();
        inner.prune(Instant::now(), self.options.rolling_window);
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            samples: inner.outcomes.len(),
            failures: inner.failures(),
        }
    }

    /// 在熔断保护下执行操作
    ///
    /// 打开状态下不调用 `operation`；超时的操作 future 会被丢弃并记为失败。
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut guard = TrialGuard {
            breaker: self,
            armed: self.admit::<E>()?,
        };

        let outcome = tokio::time::timeout(self.options.timeout, operation()).await;
        let trial = guard.armed;
        guard.armed = false;

        match outcome {
            Ok(Ok(value)) => {
                self.record(trial, None);
                Ok(value)
            }
            Ok(Err(err)) => {
                self.record(trial, Some(BreakerEventKind::Failure));
                Err(CircuitBreakerError::Operation(err))
            }
            Err(_) => {
                self.record(trial, Some(BreakerEventKind::Timeout));
                Err(CircuitBreakerError::Timeout {
                    name: self.name.clone(),
                    timeout: self.options.timeout,
                })
            }
        }
    }

    /// 判断是否放行；返回 true 表示本次是半开试探
    fn admit<E>(&self) -> Result<bool, CircuitBreakerError<E>> {
        let mut inner = self.inner.lock();
        let admitted = match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.options.reset_timeout);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    self.emit(BreakerEventKind::HalfOpen);
                    Ok(true)
                } else {
                    Err(())
                }
            }
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                Ok(true)
            }
            CircuitState::HalfOpen => Err(()),
        };
        drop(inner);

        admitted.map_err(|_| {
            self.emit(BreakerEventKind::Reject);
            CircuitBreakerError::Open {
                name: self.name.clone(),
            }
        })
    }

    fn record(&self, trial: bool, failure: Option<BreakerEventKind>) {
        if let Some(kind) = failure {
            self.emit(kind);
        }

        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen if trial => {
                inner.trial_in_flight = false;
                if failure.is_some() {
                    self.trip(&mut inner, now);
                } else {
                    inner.state = CircuitState::Closed;
                    inner.outcomes.clear();
                    inner.opened_at = None;
                    self.emit(BreakerEventKind::Close);
                }
            }
            CircuitState::Closed => {
                inner.outcomes.push_back((now, failure.is_none()));
                inner.prune(now, self.options.rolling_window);

                let samples = inner.outcomes.len();
                let failures = inner.failures();
                // 失败率严格大于阈值才打开，用乘法比较避免整数除法截断
                if samples >= self.options.volume_threshold as usize
                    && failures * 100 > samples * self.options.error_threshold_percentage as usize
                {
                    tracing::debug!(breaker = %self.name, samples, failures, "Failure rate over threshold");
                    self.trip(&mut inner, now);
                }
            }
            // 打开前已放行的调用，结果不再计入
            _ => {}
        }
    }

    fn trip(&self, inner: &mut BreakerInner, now: Instant) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.trial_in_flight = false;
        inner.outcomes.clear();
        self.emit(BreakerEventKind::Open);
    }

    fn emit(&self, kind: BreakerEventKind) {
        // 没有订阅者时发送失败，忽略
        let _ = self.events.send(BreakerEvent {
            name: self.name.clone(),
            kind,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn options() -> BreakerOptions {
        BreakerOptions {
            timeout: Duration::from_millis(100),
            error_threshold_percentage: 50,
            reset_timeout: Duration::from_millis(1_000),
            volume_threshold: 10,
            rolling_window: Duration::from_secs(60),
        }
    }

    fn breaker() -> (CircuitBreaker, broadcast::Receiver<BreakerEvent>) {
        let (tx, rx) = broadcast::channel(64);
        (CircuitBreaker::new("dep", options(), tx), rx)
    }

    async fn succeed(b: &CircuitBreaker) -> Result<u32, CircuitBreakerError<&'static str>> {
        b.call(|| async { Ok::<_, &'static str>(1) }).await
    }

    async fn fail(b: &CircuitBreaker) -> Result<u32, CircuitBreakerError<&'static str>> {
        b.call(|| async { Err::<u32, _>("boom") }).await
    }

    fn drain(rx: &mut broadcast::Receiver<BreakerEvent>) -> Vec<BreakerEventKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        kinds
    }

    #[tokio::test(start_paused = true)]
    async fn trips_after_volume_with_failure_rate_over_threshold() {
        let (b, _rx) = breaker();
        for _ in 0..4 {
            succeed(&b).await.unwrap();
        }
        for _ in 0..6 {
            assert!(matches!(fail(&b).await, Err(CircuitBreakerError::Operation("boom"))));
        }
        assert_eq!(b.state(), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let result = b
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &'static str>(())
            })
            .await;
        assert!(result.as_ref().is_err_and(|e| e.is_open()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.unwrap_err().to_string(), "dependency unavailable");
    }

    #[tokio::test(start_paused = true)]
    async fn stays_closed_below_volume_threshold() {
        let (b, _rx) = breaker();
        for _ in 0..9 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.state(), CircuitState::Closed);
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn exactly_threshold_does_not_trip() {
        let (b, _rx) = breaker();
        for _ in 0..5 {
            succeed(&b).await.unwrap();
            let _ = fail(&b).await;
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_success_closes() {
        let (b, mut rx) = breaker();
        for _ in 0..10 {
            let _ = fail(&b).await;
        }
        assert!(succeed(&b).await.is_err());

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(succeed(&b).await.unwrap(), 1);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().samples, 0);

        let kinds = drain(&mut rx);
        assert!(kinds.contains(&BreakerEventKind::Open));
        assert!(kinds.contains(&BreakerEventKind::Reject));
        assert_eq!(kinds[kinds.len() - 2..], [BreakerEventKind::HalfOpen, BreakerEventKind::Close]);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let (b, _rx) = breaker();
        for _ in 0..10 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(matches!(fail(&b).await, Err(CircuitBreakerError::Operation(_))));
        assert_eq!(b.state(), CircuitState::Open);

        // 冷却重新计时
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(succeed(&b).await.is_err_and(|e| e.is_open()));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_allows_single_trial() {
        let (tx, _rx) = broadcast::channel(64);
        let b = Arc::new(CircuitBreaker::new("dep", options(), tx));
        for _ in 0..10 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(Duration::from_millis(1_000)).await;

        let (release, gate) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let b = b.clone();
            tokio::spawn(async move {
                b.call(move || async move {
                    let _ = gate.await;
                    Ok::<_, &'static str>(7)
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(succeed(&b).await.is_err_and(|e| e.is_open()));

        release.send(()).unwrap();
        assert_eq!(trial.await.unwrap().unwrap(), 7);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out_and_count_as_failures() {
        let (b, mut rx) = breaker();
        let result = b
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, &'static str>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Timeout { .. })));
        assert_eq!(b.snapshot().failures, 1);
        assert_eq!(drain(&mut rx), vec![BreakerEventKind::Timeout]);
    }

    #[tokio::test(start_paused = true)]
    async fn old_outcomes_leave_the_window() {
        let (b, _rx) = breaker();
        for _ in 0..9 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(b.snapshot().samples, 0);
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_trial_releases_slot() {
        let (b, _rx) = breaker();
        for _ in 0..10 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(Duration::from_millis(1_000)).await;

        {
            let pending = b.call(|| std::future::pending::<Result<(), &'static str>>());
            tokio::pin!(pending);
            assert!(futures_util::poll!(pending.as_mut()).is_pending());
        }
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert_eq!(succeed(&b).await.unwrap(), 1);
        assert_eq!(b.state(), CircuitState::Closed);
    }
}
