//! 共享计数存储抽象层
//!
//! 定义秒杀管线依赖的共享计数存储接口及其内存实现。
//!
//! 所有跨实例的正确性（不超卖、限流计数）都依赖这里命名的原子操作：
//! `try_decrement`（检查并扣减）和 `sliding_window_admit`（清理、计数、条件写入）。
//! 实现方可以使用服务端脚本、原子命令或CAS循环，但必须保证每个操作对同一个键是原子的。

use crate::error::StorageError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 检查并扣减的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecrementOutcome {
    /// 扣减成功，返回剩余数量
    Granted { remaining: u64 },
    /// 数量不足，返回当前可用数量
    Insufficient { available: u64 },
    /// 键不存在（未初始化或已过期）
    Missing,
}

/// 滑动窗口准入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    /// 是否允许
    pub allowed: bool,
    /// 准入前窗口内的请求数
    pub count: u64,
    /// 窗口内最早的请求滑出窗口的时间（毫秒）
    pub reset_at_ms: i64,
}

/// 令牌桶取令牌结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketOutcome {
    /// 是否允许
    pub allowed: bool,
    /// 剩余令牌数
    pub remaining: u64,
    /// 被拒绝时：足够令牌可用的时间；允许时：桶重新填满的时间（毫秒）
    pub reset_at_ms: i64,
}

/// 共享计数存储接口
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// 原子地检查并扣减计数
    async fn try_decrement(&self, key: &str, amount: u64)
        -> Result<DecrementOutcome, StorageError>;

    /// 原子地增加计数，仅当键存在时生效，返回增加后的值
    async fn increment_existing(&self, key: &str, amount: u64)
        -> Result<Option<i64>, StorageError>;

    /// 读取计数（仅供参考，不可用于读-改-写）
    async fn get(&self, key: &str) -> Result<Option<i64>, StorageError>;

    /// 设置计数
    async fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<(), StorageError>;

    /// 设置存在性标记
    async fn set_marker(&self, key: &str, ttl: Duration) -> Result<(), StorageError>;

    /// 检查键是否存在
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// 设置过期时间，键不存在时返回 `false`
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError>;

    /// 删除键
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// 滑动窗口准入：清理过期条目、计数、条件写入，整体原子执行
    async fn sliding_window_admit(
        &self,
        key: &str,
        window: Duration,
        limit: u64,
        now_ms: i64,
    ) -> Result<WindowOutcome, StorageError>;

    /// 令牌桶取令牌
    async fn token_bucket_take(
        &self,
        key: &str,
        capacity: u64,
        refill_per_sec: u64,
        cost: u64,
        now_ms: i64,
    ) -> Result<BucketOutcome, StorageError>;
}

/// 内存条目的值
#[derive(Debug, Clone)]
enum Slot {
    Counter(i64),
    Marker,
    Window(VecDeque<i64>),
    Bucket { tokens: f64, last_refill_ms: i64 },
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(slot: Slot, ttl: Option<Duration>) -> Self {
        Self {
            slot,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// 内存计数存储
///
/// 使用 DashMap 的分片锁保证单键操作的原子性，适用于单实例部署和测试。
/// TTL 在访问时惰性检查，也可以调用 [`MemoryCounterStore::purge_expired`] 主动清理。
#[derive(Default)]
pub struct MemoryCounterStore {
    data: DashMap<String, Entry>,
}

impl MemoryCounterStore {
    /// 创建新的内存计数存储
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// 清理所有已过期的键，返回清理数量
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.data.len();
        self.data.retain(|_, entry| !entry.is_expired(now));
        before - self.data.len()
    }

    /// 当前键数量（包括尚未清理的过期键）
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 移除已过期的键
    fn evict_if_expired(&self, key: &str) {
        let now = Instant::now();
        self.data.remove_if(key, |_, entry| entry.is_expired(now));
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn try_decrement(
        &self,
        key: &str,
        amount: u64,
    ) -> Result<DecrementOutcome, StorageError> {
        self.evict_if_expired(key);
        let Some(mut entry) = self.data.get_mut(key) else {
            return Ok(DecrementOutcome::Missing);
        };

        match &mut entry.slot {
            Slot::Counter(value) => {
                let requested = i64::try_from(amount).ok();
                if let Some(amount) = requested.filter(|amount| *value >= *amount) {
                    *value -= amount;
                    Ok(DecrementOutcome::Granted {
                        remaining: *value as u64,
                    })
                } else {
                    Ok(DecrementOutcome::Insufficient {
                        available: (*value).max(0) as u64,
                    })
                }
            }
            _ => Err(StorageError::QueryError(format!("键类型不是计数器: {}", key))),
        }
    }

    async fn increment_existing(
        &self,
        key: &str,
        amount: u64,
    ) -> Result<Option<i64>, StorageError> {
        self.evict_if_expired(key);
        let Some(mut entry) = self.data.get_mut(key) else {
            return Ok(None);
        };

        match &mut entry.slot {
            Slot::Counter(value) => {
                let updated = i64::try_from(amount)
                    .ok()
                    .and_then(|amount| value.checked_add(amount))
                    .ok_or_else(|| {
                        StorageError::QueryError(format!("计数器溢出: {}, 增量 {}", key, amount))
                    })?;
                *value = updated;
                Ok(Some(updated))
            }
            _ => Err(StorageError::QueryError(format!("键类型不是计数器: {}", key))),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, StorageError> {
        self.evict_if_expired(key);
        Ok(self.data.get(key).and_then(|entry| match entry.slot {
            Slot::Counter(value) => Some(value),
            _ => None,
        }))
    }

    async fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<(), StorageError> {
        self.data
            .insert(key.to_string(), Entry::new(Slot::Counter(value), ttl));
        Ok(())
    }

    async fn set_marker(&self, key: &str, ttl: Duration) -> Result<(), StorageError> {
        self.data
            .insert(key.to_string(), Entry::new(Slot::Marker, Some(ttl)));
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.evict_if_expired(key);
        Ok(self.data.contains_key(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError> {
        self.evict_if_expired(key);
        match self.data.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }

    async fn sliding_window_admit(
        &self,
        key: &str,
        window: Duration,
        limit: u64,
        now_ms: i64,
    ) -> Result<WindowOutcome, StorageError> {
        self.evict_if_expired(key);
        let window_ms = window.as_millis() as i64;
        let window_start = now_ms - window_ms;

        // entry 持有分片写锁，清理、计数和写入在同一临界区内完成
        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Slot::Window(VecDeque::new()), Some(window)));

        let Slot::Window(timestamps) = &mut entry.slot else {
            return Err(StorageError::QueryError(format!("键类型不是窗口: {}", key)));
        };

        timestamps.retain(|&ts| ts > window_start);
        let count = timestamps.len() as u64;
        let allowed = count < limit;

        if allowed {
            timestamps.push_back(now_ms);
        }

        let oldest = timestamps.iter().copied().min().unwrap_or(now_ms);
        let reset_at_ms = oldest + window_ms;

        if allowed {
            entry.expires_at = Some(Instant::now() + window);
        }

        Ok(WindowOutcome {
            allowed,
            count,
            reset_at_ms,
        })
    }

    async fn token_bucket_take(
        &self,
        key: &str,
        capacity: u64,
        refill_per_sec: u64,
        cost: u64,
        now_ms: i64,
    ) -> Result<BucketOutcome, StorageError> {
        self.evict_if_expired(key);
        let ttl = bucket_ttl(capacity, refill_per_sec);

        let mut entry = self.data.entry(key.to_string()).or_insert_with(|| {
            Entry::new(
                Slot::Bucket {
                    tokens: capacity as f64,
                    last_refill_ms: now_ms,
                },
                Some(ttl),
            )
        });

        let Slot::Bucket {
            tokens,
            last_refill_ms,
        } = &mut entry.slot
        else {
            return Err(StorageError::QueryError(format!("键类型不是令牌桶: {}", key)));
        };

        let elapsed = now_ms - *last_refill_ms;
        if elapsed > 0 {
            let refilled = elapsed as f64 * refill_per_sec as f64 / 1000.0;
            *tokens = (*tokens + refilled).min(capacity as f64);
            *last_refill_ms = now_ms;
        }

        let allowed = *tokens >= cost as f64;
        if allowed {
            *tokens -= cost as f64;
        }

        let missing = if allowed {
            capacity as f64 - *tokens
        } else {
            cost as f64 - *tokens
        };
        let reset_at_ms = now_ms + millis_to_refill(missing, refill_per_sec);
        let remaining = tokens.floor().max(0.0) as u64;

        entry.expires_at = Some(Instant::now() + ttl);

        Ok(BucketOutcome {
            allowed,
            remaining,
            reset_at_ms,
        })
    }
}

/// 令牌桶键的TTL：补满所需时间 + 60秒
pub(crate) fn bucket_ttl(capacity: u64, refill_per_sec: u64) -> Duration {
    let refill_secs = capacity.div_ceil(refill_per_sec.max(1));
    Duration::from_secs(refill_secs + 60)
}

fn millis_to_refill(missing_tokens: f64, refill_per_sec: u64) -> i64 {
    if missing_tokens <= 0.0 || refill_per_sec == 0 {
        return 0;
    }
    (missing_tokens * 1000.0 / refill_per_sec as f64).ceil() as i64
}
