use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::cache::backend::{StoreCommand, StoreError, StoreReply};
use crate::cache::keys::{RATE_LIMIT_NAMESPACE, rate_limit_key};
use crate::cache::models::rate_limit::{
    RateLimitAdmission, RateLimitDecision, RateLimitRejection,
};
use crate::cache::store::DistributedStore;
use crate::utils::hash_identity;

/// 调用方身份
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub ip: String,
    pub subject_id: Option<String>,
}

impl ClientIdentity {
    pub fn new(ip: impl Into<String>, subject_id: Option<String>) -> Self {
        Self {
            ip: ip.into(),
            subject_id,
        }
    }
}

pub type KeyFn = Arc<dyn Fn(&ClientIdentity) -> String + Send + Sync>;

/// 限流策略，未指定时使用进程级默认值
#[derive(Clone)]
pub struct RateLimitPolicy {
    pub limit: u32,
    pub window_ms: u64,
    pub key_fn: Option<KeyFn>,
}

impl RateLimitPolicy {
    pub fn new(limit: u32, window_ms: u64) -> Self {
        Self {
            limit,
            window_ms,
            key_fn: None,
        }
    }

    pub fn with_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&ClientIdentity) -> String + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }
}

impl fmt::Debug for RateLimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitPolicy")
            .field("limit", &self.limit)
            .field("window_ms", &self.window_ms)
            .field("custom_key", &self.key_fn.is_some())
            .finish()
    }
}

/// 滑动窗口限流器
///
/// 每次判定分两次往返：先清理过期时间戳并计数，再写入本次时间戳。
/// 两次往返之间不加锁，高并发下可能短暂超发，超发量不超过同时竞争的请求数。
/// 存储不可用时放行（fail-open）。
pub struct SlidingWindowLimiter {
    store: Arc<DistributedStore>,
    defaults: RateLimitPolicy,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<DistributedStore>, defaults: RateLimitPolicy) -> Self {
        Self { store, defaults }
    }

    pub fn defaults(&self) -> &RateLimitPolicy {
        &self.defaults
    }

    /// 默认键为 `hash(ip)` 或 `hash(ip):subject`
    pub fn derive_key(identity: &ClientIdentity, policy: &RateLimitPolicy) -> String {
        if let Some(key_fn) = &policy.key_fn {
            return key_fn(identity);
        }
        let ip_hash = hash_identity(&identity.ip);
        match &identity.subject_id {
            Some(subject) => format!("{}:{}", ip_hash, subject),
            None => ip_hash,
        }
    }

    pub async fn check(&self, identity: &ClientIdentity, policy: Option<&RateLimitPolicy>) -> RateLimitDecision {
        self.check_at(identity, policy, Utc::now().timestamp_millis()).await
    }

    pub async fn check_at(
        &self,
        identity: &ClientIdentity,
        policy: Option<&RateLimitPolicy>,
        now_ms: i64,
    ) -> RateLimitDecision {
        let policy = policy.unwrap_or(&self.defaults);
        let key = rate_limit_key(&Self::derive_key(identity, policy));
        let window_ms = policy.window_ms as i64;

        // 第一次往返：清理窗口外的时间戳并计数
        let evict_and_count = vec![
            StoreCommand::ZRemRangeByScore {
                key: key.clone(),
                min: 0,
                max: now_ms - window_ms - 1,
            },
            StoreCommand::ZCard { key: key.clone() },
        ];
        let count = match self.store.pipeline(evict_and_count, Some(RATE_LIMIT_NAMESPACE)).await {
            Ok(replies) => replies.get(1).and_then(StoreReply::as_int).unwrap_or(0).max(0) as u64,
            Err(e) => return Self::fail_open(policy, now_ms, &key, &e),
        };

        if count >= policy.limit as u64 {
            let retry_after = match self.store.ttl(&key, Some(RATE_LIMIT_NAMESPACE)).await {
                Ok(ttl) => ttl.seconds().filter(|secs| *secs > 0),
                Err(_) => None,
            }
            .unwrap_or_else(|| policy.window_ms.div_ceil(1000));

            tracing::debug!(key = %key, current = count, limit = policy.limit, "Rate limit exceeded");
            return RateLimitDecision::Rejected(RateLimitRejection {
                limit: policy.limit,
                current: count,
                remaining: 0,
                retry_after,
            });
        }

        // 第二次往返：记录本次请求并刷新窗口过期时间
        let nonce = Uuid::new_v4().simple().to_string();
        let record = vec![
            StoreCommand::ZAdd {
                key: key.clone(),
                score: now_ms,
                member: format!("{}-{}", now_ms, &nonce[..8]),
            },
            StoreCommand::PExpire {
                key: key.clone(),
                millis: policy.window_ms,
            },
        ];
        if let Err(e) = self.store.pipeline(record, Some(RATE_LIMIT_NAMESPACE)).await {
            return Self::fail_open(policy, now_ms, &key, &e);
        }

        RateLimitDecision::Admitted(RateLimitAdmission {
            limit: policy.limit,
            remaining: policy.limit - count as u32 - 1,
            reset_at_ms: now_ms + window_ms,
            degraded: false,
        })
    }

    fn fail_open(policy: &RateLimitPolicy, now_ms: i64, key: &str, error: &StoreError) -> RateLimitDecision {
        tracing::warn!(key = %key, error = %error, "Rate limit store unavailable, admitting request");
        RateLimitDecision::Admitted(RateLimitAdmission {
            limit: policy.limit,
            remaining: policy.limit.saturating_sub(1),
            reset_at_ms: now_ms + policy.window_ms as i64,
            degraded: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::{KeyTtl, MemoryBackend, StoreBackend};

    const T0: i64 = 1_700_000_000_000;

    fn limiter(limit: u32, window_ms: u64) -> (Arc<MemoryBackend>, SlidingWindowLimiter) {
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(DistributedStore::new(backend.clone(), "cache"));
        (backend, SlidingWindowLimiter::new(store, RateLimitPolicy::new(limit, window_ms)))
    }

    fn client(ip: &str) -> ClientIdentity {
        ClientIdentity::new(ip, None)
    }

    #[tokio::test]
    async fn five_rapid_requests_then_rejection() {
        let (_, limiter) = limiter(5, 60_000);
        let caller = client("198.51.100.7");

        let mut remaining = Vec::new();
        for i in 0..5 {
            match limiter.check_at(&caller, None, T0 + i).await {
                RateLimitDecision::Admitted(a) => {
                    assert_eq!(a.reset_at_ms, T0 + i + 60_000);
                    remaining.push(a.remaining);
                }
                other => panic!("expected admission, got {:?}", other),
            }
        }
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

        match limiter.check_at(&caller, None, T0 + 10).await {
            RateLimitDecision::Rejected(r) => {
                assert_eq!(r.limit, 5);
                assert_eq!(r.current, 5);
                assert_eq!(r.remaining, 0);
                assert!(r.retry_after > 0 && r.retry_after <= 60);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn admissions_are_capped_at_limit() {
        let (_, limiter) = limiter(3, 1_000);
        let caller = client("198.51.100.8");

        let mut admitted = 0;
        for i in 0..8 {
            if limiter.check_at(&caller, None, T0 + i).await.is_admitted() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
    }

    #[tokio::test]
    async fn same_millisecond_requests_count_separately() {
        let (_, limiter) = limiter(2, 1_000);
        let caller = client("198.51.100.9");

        assert!(limiter.check_at(&caller, None, T0).await.is_admitted());
        assert!(limiter.check_at(&caller, None, T0).await.is_admitted());
        assert!(!limiter.check_at(&caller, None, T0).await.is_admitted());
    }

    #[tokio::test]
    async fn window_slides_instead_of_resetting() {
        let (_, limiter) = limiter(2, 1_000);
        let caller = client("203.0.113.1");

        assert!(limiter.check_at(&caller, None, T0).await.is_admitted());
        assert!(limiter.check_at(&caller, None, T0 + 600).await.is_admitted());
        assert!(!limiter.check_at(&caller, None, T0 + 900).await.is_admitted());

        // T0 的记录滑出窗口，T0+600 的仍在窗口内
        let decision = limiter.check_at(&caller, None, T0 + 1_001).await;
        assert_eq!(decision.remaining(), 0);
        assert!(decision.is_admitted());
        assert!(!limiter.check_at(&caller, None, T0 + 1_002).await.is_admitted());
    }

    #[tokio::test]
    async fn idle_past_window_gives_full_limit() {
        let (_, limiter) = limiter(3, 1_000);
        let caller = client("203.0.113.2");
        for i in 0..3 {
            limiter.check_at(&caller, None, T0 + i).await;
        }
        assert!(!limiter.check_at(&caller, None, T0 + 5).await.is_admitted());

        let decision = limiter.check_at(&caller, None, T0 + 5_000).await;
        assert!(decision.is_admitted());
        assert_eq!(decision.remaining(), 2);
    }

    #[tokio::test]
    async fn subject_and_ip_scope_the_window() {
        let (_, limiter) = limiter(1, 60_000);
        let alice = ClientIdentity::new("10.0.0.1", Some("alice".into()));
        let bob = ClientIdentity::new("10.0.0.1", Some("bob".into()));
        let anon = client("10.0.0.1");

        assert!(limiter.check_at(&alice, None, T0).await.is_admitted());
        assert!(limiter.check_at(&bob, None, T0).await.is_admitted());
        assert!(limiter.check_at(&anon, None, T0).await.is_admitted());
        assert!(!limiter.check_at(&alice, None, T0 + 1).await.is_admitted());
    }

    #[tokio::test]
    async fn derived_key_never_contains_raw_ip() {
        let identity = ClientIdentity::new("192.0.2.44", Some("u-1".into()));
        let key = SlidingWindowLimiter::derive_key(&identity, &RateLimitPolicy::new(1, 1));
        assert!(!key.contains("192.0.2.44"));
        assert!(key.ends_with(":u-1"));
    }

    #[tokio::test]
    async fn per_call_policy_overrides_defaults() {
        let (_, limiter) = limiter(100, 60_000);
        let strict = RateLimitPolicy::new(1, 60_000).with_key_fn(|_| "global".to_string());

        assert!(limiter.check_at(&client("10.0.0.2"), Some(&strict), T0).await.is_admitted());
        // 自定义键把不同 IP 合并到同一窗口
        assert!(!limiter.check_at(&client("10.0.0.3"), Some(&strict), T0 + 1).await.is_admitted());
        assert!(limiter.check_at(&client("10.0.0.3"), None, T0 + 2).await.is_admitted());
    }

    #[tokio::test]
    async fn instances_sharing_a_store_share_the_window() {
        let backend = Arc::new(MemoryBackend::new());
        let first = SlidingWindowLimiter::new(
            Arc::new(DistributedStore::new(backend.clone(), "cache")),
            RateLimitPolicy::new(2, 60_000),
        );
        let second = SlidingWindowLimiter::new(
            Arc::new(DistributedStore::new(backend.clone(), "cache")),
            RateLimitPolicy::new(2, 60_000),
        );
        let caller = client("10.1.1.1");

        assert!(first.check_at(&caller, None, T0).await.is_admitted());
        assert!(second.check_at(&caller, None, T0 + 1).await.is_admitted());
        assert!(!first.check_at(&caller, None, T0 + 2).await.is_admitted());
    }

    #[tokio::test]
    async fn unreachable_store_fails_open() {
        let (backend, limiter) = limiter(1, 60_000);
        backend.set_available(false);
        let caller = client("10.2.2.2");

        for i in 0..3 {
            match limiter.check_at(&caller, None, T0 + i).await {
                RateLimitDecision::Admitted(a) => assert!(a.degraded),
                other => panic!("expected fail-open admission, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn window_record_expires_with_window() {
        let (backend, limiter) = limiter(5, 60_000);
        let caller = client("10.3.3.3");
        limiter.check(&caller, None).await;

        let key = format!(
            "{}:{}",
            RATE_LIMIT_NAMESPACE,
            rate_limit_key(&SlidingWindowLimiter::derive_key(&caller, limiter.defaults()))
        );
        assert_eq!(backend.ttl(&key).await.unwrap(), KeyTtl::Seconds(60));
        assert_eq!(backend.zcard(&key).await.unwrap(), 1);
    }
}
