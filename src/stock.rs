//! 库存预扣协议
//!
//! 库存计数只能通过共享计数存储的原子操作修改：`reserve` 对应检查并扣减，
//! `restore` 对应补偿回补。回补不是幂等的，调用方必须保证每次失败的预扣
//! 至多补偿一次。

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::constants::{DEFAULT_STOCK_GRACE_PERIOD_SECS, MIN_KEY_TTL_SECS, STOCK_KEY_PREFIX};
use crate::error::{SeckillError, StorageError};
use crate::model::SeckillActivity;
use crate::storage::{CounterStore, DecrementOutcome};

/// 预扣结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// 预扣成功，返回剩余库存
    Granted { remaining: u64 },
    /// 库存不足
    InsufficientStock { requested: u64, available: u64 },
    /// 库存计数不存在（活动未初始化或已过期）
    NotFound,
}

impl ReserveOutcome {
    /// 是否预扣成功
    pub fn is_granted(&self) -> bool {
        matches!(self, ReserveOutcome::Granted { .. })
    }

    /// 转换为业务结果，失败时映射为对应的错误分类
    pub fn into_result(self, activity_id: &str) -> Result<u64, SeckillError> {
        match self {
            ReserveOutcome::Granted { remaining } => Ok(remaining),
            ReserveOutcome::InsufficientStock {
                requested,
                available,
            } => Err(SeckillError::InsufficientStock {
                requested,
                available,
            }),
            ReserveOutcome::NotFound => Err(SeckillError::NotFound(format!(
                "活动 {} 的库存未初始化",
                activity_id
            ))),
        }
    }
}

/// 库存计数键
pub fn stock_key(activity_id: &str) -> String {
    format!("{}:{}", STOCK_KEY_PREFIX, activity_id)
}

/// 库存预扣服务
#[derive(Clone)]
pub struct StockReservation {
    store: Arc<dyn CounterStore>,
    grace_period: Duration,
}

impl std::fmt::Debug for StockReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StockReservation")
            .field("grace_period", &self.grace_period)
            .finish()
    }
}

impl StockReservation {
    /// 使用默认宽限期创建
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self::with_grace_period(store, Duration::from_secs(DEFAULT_STOCK_GRACE_PERIOD_SECS))
    }

    /// 指定库存键在活动结束后保留的宽限期
    pub fn with_grace_period(store: Arc<dyn CounterStore>, grace_period: Duration) -> Self {
        Self {
            store,
            grace_period,
        }
    }

    /// 计算库存键的TTL：活动剩余时长 + 宽限期
    pub fn stock_ttl(&self, activity: &SeckillActivity, now: DateTime<Utc>) -> Duration {
        let ttl = activity.remaining_lifetime(now) + self.grace_period;
        ttl.max(Duration::from_secs(MIN_KEY_TTL_SECS))
    }

    /// 以活动总库存初始化计数
    #[instrument(skip(self, activity), fields(activity_id = %activity.id))]
    pub async fn initialize(&self, activity: &SeckillActivity) -> Result<(), SeckillError> {
        self.initialize_at(activity, Utc::now()).await
    }

    /// 以活动总库存初始化计数（指定当前时间）
    pub async fn initialize_at(
        &self,
        activity: &SeckillActivity,
        now: DateTime<Utc>,
    ) -> Result<(), SeckillError> {
        let total = i64::try_from(activity.total_stock).map_err(|_| {
            SeckillError::ValidationError(format!("活动 {} 库存超出范围", activity.id))
        })?;
        let ttl = self.stock_ttl(activity, now);

        self.store
            .set(&stock_key(&activity.id), total, Some(ttl))
            .await?;

        info!(
            "初始化库存: activity={}, total={}, ttl={:?}",
            activity.id, activity.total_stock, ttl
        );
        Ok(())
    }

    /// 原子地检查并扣减库存
    ///
    /// 存储超时或连接失败视为未获得库存，不会重试。
    #[instrument(skip(self))]
    pub async fn reserve(
        &self,
        activity_id: &str,
        quantity: u64,
    ) -> Result<ReserveOutcome, SeckillError> {
        if quantity == 0 {
            return Err(SeckillError::ValidationError("预扣数量必须大于0".to_string()));
        }
        if i64::try_from(quantity).is_err() {
            let available = self.remaining(activity_id).await?;
            debug!("预扣数量超出计数范围: activity={}, quantity={}", activity_id, quantity);
            return Ok(match available {
                Some(available) => ReserveOutcome::InsufficientStock {
                    requested: quantity,
                    available,
                },
                None => ReserveOutcome::NotFound,
            });
        }

        let outcome = match self
            .store
            .try_decrement(&stock_key(activity_id), quantity)
            .await
        {
            Ok(outcome) => outcome,
            Err(StorageError::TimeoutError(msg)) => {
                warn!("库存预扣超时，视为未获得库存: activity={}", activity_id);
                return Err(SeckillError::StorageError(StorageError::TimeoutError(msg)));
            }
            Err(e) => return Err(e.into()),
        };

        let outcome = match outcome {
            DecrementOutcome::Granted { remaining } => ReserveOutcome::Granted { remaining },
            DecrementOutcome::Insufficient { available } => ReserveOutcome::InsufficientStock {
                requested: quantity,
                available,
            },
            DecrementOutcome::Missing => ReserveOutcome::NotFound,
        };

        debug!("库存预扣结果: activity={}, {:?}", activity_id, outcome);
        Ok(outcome)
    }

    /// 补偿回补库存
    ///
    /// 计数已过期时不会重新创建，返回 `Ok(None)`。
    #[instrument(skip(self))]
    pub async fn restore(
        &self,
        activity_id: &str,
        quantity: u64,
    ) -> Result<Option<i64>, SeckillError> {
        match self
            .store
            .increment_existing(&stock_key(activity_id), quantity)
            .await
        {
            Ok(Some(value)) => {
                debug!(
                    "回补库存: activity={}, quantity={}, remaining={}",
                    activity_id, quantity, value
                );
                Ok(Some(value))
            }
            Ok(None) => {
                warn!(
                    "库存计数已不存在，跳过回补: activity={}, quantity={}",
                    activity_id, quantity
                );
                Ok(None)
            }
            Err(e) => {
                error!(
                    "库存回补失败: activity={}, quantity={}, 错误: {}",
                    activity_id, quantity, e
                );
                Err(e.into())
            }
        }
    }

    /// 剩余库存（仅供参考）
    pub async fn remaining(&self, activity_id: &str) -> Result<Option<u64>, SeckillError> {
        let value = self.store.get(&stock_key(activity_id)).await?;
        Ok(value.map(|v| v.max(0) as u64))
    }
}
