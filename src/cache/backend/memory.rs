use std::collections::{BTreeMap, HashMap};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{KeyTtl, StoreBackend, StoreCommand, StoreError, StoreReply};

/// 过期键的批量清理间隔
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    /// member -> score
    Sorted(BTreeMap<String, i64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// 按哈希槽分桶的键空间
///
/// SCAN 游标就是下一个待访问的槽号，删除已返回的键不会移动其余键的位置，
/// 整个扫描期间一直存在的键都会被返回。
#[derive(Debug)]
struct Keyspace {
    slots: BTreeMap<u64, HashMap<String, Entry>>,
    last_sweep: Instant,
}

fn slot_of(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

impl Keyspace {
    fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
            last_sweep: Instant::now(),
        }
    }

    fn get(&self, key: &str) -> Option<&Entry> {
        self.slots.get(&slot_of(key))?.get(key)
    }

    fn get_mut(&mut self, key: &str) -> Option<&mut Entry> {
        self.slots.get_mut(&slot_of(key))?.get_mut(key)
    }

    fn insert(&mut self, key: String, entry: Entry) {
        self.slots.entry(slot_of(&key)).or_default().insert(key, entry);
    }

    fn remove(&mut self, key: &str) -> Option<Entry> {
        let slot = slot_of(key);
        let bucket = self.slots.get_mut(&slot)?;
        let removed = bucket.remove(key);
        if bucket.is_empty() {
            self.slots.remove(&slot);
        }
        removed
    }

    fn len(&self) -> usize {
        self.slots.values().map(HashMap::len).sum()
    }

    /// 物理删除所有已过期的条目，返回删除数量
    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.len();
        self.slots.retain(|_, bucket| {
            bucket.retain(|_, entry| entry.is_live(now));
            !bucket.is_empty()
        });
        self.last_sweep = now;
        before - self.len()
    }

    fn sweep_if_due(&mut self) {
        let now = Instant::now();
        if now.saturating_duration_since(self.last_sweep) >= SWEEP_INTERVAL {
            let purged = self.purge_expired(now);
            if purged > 0 {
                tracing::debug!(purged, "Purged expired memory store entries");
            }
        }
    }

    /// 从游标所在槽开始，至少访问 `count` 个键，槽不拆分
    fn scan(&mut self, cursor: u64, pattern: &str, count: usize) -> (u64, Vec<String>) {
        self.purge_expired(Instant::now());

        let mut visited = 0;
        let mut page = Vec::new();
        for (&slot, bucket) in self.slots.range(cursor..) {
            if visited >= count.max(1) {
                return (slot, page);
            }
            visited += bucket.len();
            page.extend(bucket.keys().filter(|k| glob_match(pattern, k)).cloned());
        }
        (0, page)
    }
}

/// 进程内存储后端
///
/// 实现与 Redis 相同的命令语义，过期时间基于 tokio 时钟，
/// 适用于单实例部署和测试。`set_available(false)` 可模拟存储宕机。
/// 过期条目在访问时顺带清除，另外每隔一秒随下一条命令整体清理一次。
#[derive(Debug)]
pub struct MemoryBackend {
    entries: Mutex<Keyspace>,
    available: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Keyspace::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory backend switched off".into()))
        }
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut Keyspace) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.ensure_available()?;
        let mut entries = self.entries.lock();
        entries.sweep_if_due();
        f(&mut entries)
    }

    fn apply(entries: &mut Keyspace, command: StoreCommand) -> Result<StoreReply, StoreError> {
        match command {
            StoreCommand::Set { key, value, ttl_secs } => {
                set_string(entries, key, value, ttl_secs)?;
                Ok(StoreReply::Ok)
            }
            StoreCommand::Delete { key } => {
                let removed = live(entries, &key).is_some();
                entries.remove(&key);
                Ok(StoreReply::Int(removed as i64))
            }
            StoreCommand::Incr { key, by } => incr(entries, &key, by).map(StoreReply::Int),
            StoreCommand::ZAdd { key, score, member } => {
                zadd(entries, &key, score, member)?;
                Ok(StoreReply::Int(1))
            }
            StoreCommand::ZCard { key } => zcard(entries, &key).map(|n| StoreReply::Int(n as i64)),
            StoreCommand::ZRemRangeByScore { key, min, max } => {
                zremrangebyscore(entries, &key, min, max).map(|n| StoreReply::Int(n as i64))
            }
            StoreCommand::PExpire { key, millis } => {
                Ok(StoreReply::Int(pexpire(entries, &key, millis) as i64))
            }
            StoreCommand::Ttl { key } => Ok(StoreReply::Int(match ttl(entries, &key) {
                KeyTtl::Missing => -2,
                KeyTtl::Persistent => -1,
                KeyTtl::Seconds(secs) => secs as i64,
            })),
        }
    }
}

/// 取出未过期的条目，已过期的顺带清除
fn live<'a>(entries: &'a mut Keyspace, key: &str) -> Option<&'a mut Entry> {
    let expired = entries
        .get(key)
        .and_then(|e| e.expires_at)
        .is_some_and(|at| at <= Instant::now());
    if expired {
        entries.remove(key);
        return None;
    }
    entries.get_mut(key)
}

fn wrong_type() -> StoreError {
    StoreError::Protocol("WRONGTYPE operation against a key holding the wrong kind of value".into())
}

fn set_string(
    entries: &mut Keyspace,
    key: String,
    value: String,
    ttl_secs: Option<u64>,
) -> Result<(), StoreError> {
    let expires_at = match ttl_secs {
        Some(0) => return Err(StoreError::Protocol("invalid expire time".into())),
        Some(secs) => Some(Instant::now() + Duration::from_secs(secs)),
        None => None,
    };
    entries.insert(
        key,
        Entry {
            value: Value::Str(value),
            expires_at,
        },
    );
    Ok(())
}

fn incr(entries: &mut Keyspace, key: &str, by: i64) -> Result<i64, StoreError> {
    match live(entries, key) {
        Some(entry) => match &mut entry.value {
            Value::Str(current) => {
                let parsed: i64 = current
                    .parse()
                    .map_err(|_| StoreError::Protocol("value is not an integer".into()))?;
                let next = parsed
                    .checked_add(by)
                    .ok_or_else(|| StoreError::Protocol("increment would overflow".into()))?;
                *current = next.to_string();
                Ok(next)
            }
            Value::Sorted(_) => Err(wrong_type()),
        },
        None => {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(by.to_string()),
                    expires_at: None,
                },
            );
            Ok(by)
        }
    }
}

fn zadd(entries: &mut Keyspace, key: &str, score: i64, member: String) -> Result<(), StoreError> {
    if live(entries, key).is_none() {
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Sorted(BTreeMap::new()),
                expires_at: None,
            },
        );
    }
    match entries.get_mut(key).map(|e| &mut e.value) {
        Some(Value::Sorted(set)) => {
            set.insert(member, score);
            Ok(())
        }
        _ => Err(wrong_type()),
    }
}

fn zcard(entries: &mut Keyspace, key: &str) -> Result<u64, StoreError> {
    match live(entries, key).map(|e| &e.value) {
        Some(Value::Sorted(set)) => Ok(set.len() as u64),
        Some(Value::Str(_)) => Err(wrong_type()),
        None => Ok(0),
    }
}

fn zremrangebyscore(
    entries: &mut Keyspace,
    key: &str,
    min: i64,
    max: i64,
) -> Result<u64, StoreError> {
    let (removed, now_empty) = match live(entries, key).map(|e| &mut e.value) {
        Some(Value::Sorted(set)) => {
            let before = set.len();
            set.retain(|_, score| *score < min || *score > max);
            ((before - set.len()) as u64, set.is_empty())
        }
        Some(Value::Str(_)) => return Err(wrong_type()),
        None => return Ok(0),
    };
    // 与 Redis 一致：空集合即删除键
    if now_empty {
        entries.remove(key);
    }
    Ok(removed)
}

fn pexpire(entries: &mut Keyspace, key: &str, millis: u64) -> bool {
    match live(entries, key) {
        Some(entry) => {
            entry.expires_at = Some(Instant::now() + Duration::from_millis(millis));
            true
        }
        None => false,
    }
}

fn ttl(entries: &mut Keyspace, key: &str) -> KeyTtl {
    match live(entries, key) {
        Some(Entry {
            expires_at: Some(at), ..
        }) => {
            let remaining = at.saturating_duration_since(Instant::now());
            // TTL 命令按秒向上取整
            KeyTtl::Seconds(remaining.as_millis().div_ceil(1000) as u64)
        }
        Some(_) => KeyTtl::Persistent,
        None => KeyTtl::Missing,
    }
}

/// Redis 风格的 glob 匹配，支持 `*`、`?` 和 `\` 转义
///
/// 贪心双指针实现，`*` 只回溯到最近一次出现的位置
pub(crate) fn glob_match(pattern: &str, candidate: &str) -> bool {
    let tokens = tokenize(pattern);
    let candidate: Vec<char> = candidate.chars().collect();

    let (mut p, mut c) = (0, 0);
    // 最近一个 `*` 的位置，以及它当前吞到的候选位置
    let mut star: Option<(usize, usize)> = None;
    while c < candidate.len() {
        match tokens.get(p) {
            Some(Glob::Any) => {
                star = Some((p, c));
                p += 1;
            }
            Some(Glob::One) => {
                p += 1;
                c += 1;
            }
            Some(Glob::Literal(ch)) if *ch == candidate[c] => {
                p += 1;
                c += 1;
            }
            _ => match star {
                Some((star_p, star_c)) => {
                    p = star_p + 1;
                    c = star_c + 1;
                    star = Some((star_p, star_c + 1));
                }
                None => return false,
            },
        }
    }
    tokens[p..].iter().all(|t| matches!(t, Glob::Any))
}

#[derive(Debug, PartialEq)]
enum Glob {
    Any,
    One,
    Literal(char),
}

fn tokenize(pattern: &str) -> Vec<Glob> {
    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(ch) = chars.next() {
        tokens.push(match ch {
            '*' => Glob::Any,
            '?' => Glob::One,
            // 末尾的反斜杠按字面量处理
            '\\' => Glob::Literal(chars.next().unwrap_or('\\')),
            other => Glob::Literal(other),
        });
    }
    tokens
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_entries(|entries| match live(entries, key).map(|e| &e.value) {
            Some(Value::Str(value)) => Ok(Some(value.clone())),
            Some(Value::Sorted(_)) => Err(wrong_type()),
            None => Ok(None),
        })
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), StoreError> {
        self.with_entries(|entries| set_string(entries, key.to_string(), value.to_string(), ttl_secs))
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        self.with_entries(|entries| {
            let mut removed = 0;
            for key in keys {
                if live(entries, key).is_some() {
                    entries.remove(key);
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.with_entries(|entries| Ok(live(entries, key).is_some()))
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        self.with_entries(|entries| incr(entries, key, by))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        self.with_entries(|entries| {
            Ok(keys
                .iter()
                .map(|key| match live(entries, key).map(|e| &e.value) {
                    Some(Value::Str(value)) => Some(value.clone()),
                    _ => None,
                })
                .collect())
        })
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        self.with_entries(|entries| Ok(entries.scan(cursor, pattern, count)))
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError> {
        self.with_entries(|entries| zadd(entries, key, score, member.to_string()))
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.with_entries(|entries| zcard(entries, key))
    }

    async fn zremrangebyscore(&self, key: &str, min: i64, max: i64) -> Result<u64, StoreError> {
        self.with_entries(|entries| zremrangebyscore(entries, key, min, max))
    }

    async fn pexpire(&self, key: &str, millis: u64) -> Result<bool, StoreError> {
        self.with_entries(|entries| Ok(pexpire(entries, key, millis)))
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        self.with_entries(|entries| Ok(ttl(entries, key)))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.ensure_available()
    }

    async fn pipeline(&self, commands: Vec<StoreCommand>) -> Result<Vec<StoreReply>, StoreError> {
        // 逐条加锁执行，和真实管道一样不提供整体原子性
        let mut replies = Vec::with_capacity(commands.len());
        for command in commands {
            replies.push(self.with_entries(|entries| Self::apply(entries, command))?);
        }
        Ok(replies)
    }
}
