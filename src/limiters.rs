//! 限流器模块
//!
//! 实现滑动窗口和令牌桶两种限流算法。状态全部保存在共享计数存储中，
//! 多个实例对同一个键的判断依赖存储端的原子操作，进程内不持有任何计数。

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use crate::error::{RateLimitDecision, SeckillError};
use crate::storage::CounterStore;

// ============================================================================
// Cost 参数验证
// ============================================================================

/// 最大 cost 值
const MAX_COST: u64 = 1_000_000;

/// 验证 cost 参数
fn validate_cost(cost: u64) -> Result<u64, SeckillError> {
    if cost == 0 {
        return Err(SeckillError::ConfigError("Cost 不能为零".to_string()));
    }

    if cost > MAX_COST {
        return Err(SeckillError::ConfigError(format!(
            "Cost 超过最大限制（最大 {}）",
            MAX_COST
        )));
    }

    Ok(cost)
}

/// 限流算法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    /// 滑动窗口
    SlidingWindow,
    /// 令牌桶
    TokenBucket,
}

impl RateLimitAlgorithm {
    /// 算法名称
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitAlgorithm::SlidingWindow => "sliding_window",
            RateLimitAlgorithm::TokenBucket => "token_bucket",
        }
    }
}

/// 限流器 trait
pub trait Limiter: Send + Sync {
    /// 对一个限流键做一次准入判断
    fn admit<'a>(
        &'a self,
        key: &'a str,
        now_ms: i64,
    ) -> Pin<Box<dyn Future<Output = Result<RateLimitDecision, SeckillError>> + Send + 'a>>;

    /// 使用的算法
    fn algorithm(&self) -> RateLimitAlgorithm;
}

/// 滑动窗口限流器
///
/// 对键 K、窗口 W、上限 L：清理早于 `now - W` 的记录、计数、
/// `count < L` 时写入本次请求，三步在存储端一次完成。
///
/// # 示例
/// ```rust
/// use flashgate::limiters::{Limiter, SlidingWindowLimiter};
/// use flashgate::storage::MemoryCounterStore;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() {
///     let limiter = SlidingWindowLimiter::new(
///         Arc::new(MemoryCounterStore::new()),
///         Duration::from_secs(60),
///         5,
///     );
///     let decision = limiter.admit("ratelimit:user:u1:orders", 0).await.unwrap();
///     assert!(decision.allowed);
///     assert_eq!(decision.remaining, 4);
/// }
/// ```
#[derive(Clone)]
pub struct SlidingWindowLimiter {
    store: Arc<dyn CounterStore>,
    window: Duration,
    limit: u64,
}

impl SlidingWindowLimiter {
    /// 创建新的滑动窗口限流器
    pub fn new(store: Arc<dyn CounterStore>, window: Duration, limit: u64) -> Self {
        Self {
            store,
            window,
            limit,
        }
    }

    /// 窗口大小
    pub fn window(&self) -> Duration {
        self.window
    }

    /// 窗口内允许的请求数
    pub fn limit(&self) -> u64 {
        self.limit
    }
}

impl Limiter for SlidingWindowLimiter {
    fn admit<'a>(
        &'a self,
        key: &'a str,
        now_ms: i64,
    ) -> Pin<Box<dyn Future<Output = Result<RateLimitDecision, SeckillError>> + Send + 'a>> {
        Box::pin(async move {
            let outcome = self
                .store
                .sliding_window_admit(key, self.window, self.limit, now_ms)
                .await?;

            let remaining = if outcome.allowed {
                self.limit.saturating_sub(outcome.count + 1)
            } else {
                0
            };

            trace!(
                "滑动窗口: key={}, count={}, allowed={}",
                key,
                outcome.count,
                outcome.allowed
            );

            Ok(RateLimitDecision {
                allowed: outcome.allowed,
                remaining,
                reset_at_ms: outcome.reset_at_ms,
                key: Some(key.to_string()),
            })
        })
    }

    fn algorithm(&self) -> RateLimitAlgorithm {
        RateLimitAlgorithm::SlidingWindow
    }
}

/// 令牌桶限流器
///
/// 桶容量决定可容忍的突发，令牌按 `refill_per_sec` 匀速补充。
/// 适合下单这类允许短时突发的入口。
#[derive(Clone)]
pub struct TokenBucketLimiter {
    store: Arc<dyn CounterStore>,
    capacity: u64,
    refill_per_sec: u64,
}

impl TokenBucketLimiter {
    /// 创建新的令牌桶限流器
    pub fn new(store: Arc<dyn CounterStore>, capacity: u64, refill_per_sec: u64) -> Self {
        Self {
            store,
            capacity,
            refill_per_sec,
        }
    }

    /// 一次取走 `cost` 个令牌
    pub async fn take(
        &self,
        key: &str,
        cost: u64,
        now_ms: i64,
    ) -> Result<RateLimitDecision, SeckillError> {
        let cost = validate_cost(cost)?;
        let outcome = self
            .store
            .token_bucket_take(key, self.capacity, self.refill_per_sec, cost, now_ms)
            .await?;

        trace!(
            "令牌桶: key={}, remaining={}, allowed={}",
            key,
            outcome.remaining,
            outcome.allowed
        );

        Ok(RateLimitDecision {
            allowed: outcome.allowed,
            remaining: outcome.remaining,
            reset_at_ms: outcome.reset_at_ms,
            key: Some(key.to_string()),
        })
    }
}

impl Limiter for TokenBucketLimiter {
    fn admit<'a>(
        &'a self,
        key: &'a str,
        now_ms: i64,
    ) -> Pin<Box<dyn Future<Output = Result<RateLimitDecision, SeckillError>> + Send + 'a>> {
        Box::pin(self.take(key, 1, now_ms))
    }

    fn algorithm(&self) -> RateLimitAlgorithm {
        RateLimitAlgorithm::TokenBucket
    }
}
