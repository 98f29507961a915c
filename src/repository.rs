//! 持久化存储抽象层
//!
//! 订单仓库和活动目录接口及其内存实现。订单表在 (user, activity) 上的唯一约束
//! 是"每个用户每个活动至多一单"的最终仲裁者；状态转换使用比较并设置，
//! 只有真正完成转换的调用方才执行库存回补。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::StorageError;
use crate::model::{OrderStatus, SeckillActivity, SeckillOrder};

/// 订单仓库接口
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// 插入订单；(user, activity) 已存在时返回 [`StorageError::Duplicate`]
    async fn save_order(&self, order: &SeckillOrder) -> Result<(), StorageError>;

    /// 查找用户在某活动中的订单
    async fn find_order(
        &self,
        user_id: &str,
        activity_id: &str,
    ) -> Result<Option<SeckillOrder>, StorageError>;

    /// 按ID获取订单
    async fn get_order(&self, order_id: Uuid) -> Result<Option<SeckillOrder>, StorageError>;

    /// 比较并设置订单状态
    ///
    /// 仅当当前状态等于 `from` 时转换到 `to`，返回本次调用是否完成了转换。
    /// 订单不存在时返回 [`StorageError::NotFound`]。
    async fn transition_status(
        &self,
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    /// 查找支付截止时间早于 `now` 的待支付订单，按截止时间升序，最多 `limit` 条
    async fn find_expired_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SeckillOrder>, StorageError>;
}

/// 活动目录接口（只读）
#[async_trait]
pub trait ActivityCatalog: Send + Sync {
    /// 查找活动
    async fn find_activity(&self, activity_id: &str)
        -> Result<Option<SeckillActivity>, StorageError>;
}

/// 内存订单仓库
#[derive(Debug, Default)]
pub struct MemoryOrderRepository {
    orders: DashMap<Uuid, SeckillOrder>,
    by_participant: DashMap<(String, String), Uuid>,
}

impl MemoryOrderRepository {
    /// 创建新的内存订单仓库
    pub fn new() -> Self {
        Self::default()
    }

    /// 订单数量
    pub fn len(&self) -> usize {
        self.orders.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// 按状态统计某活动的订单数
    pub fn count_by_status(&self, activity_id: &str, status: OrderStatus) -> usize {
        self.orders
            .iter()
            .filter(|entry| entry.activity_id == activity_id && entry.status == status)
            .count()
    }
}

#[async_trait]
impl OrderRepository for MemoryOrderRepository {
    async fn save_order(&self, order: &SeckillOrder) -> Result<(), StorageError> {
        let participant = (order.user_id.clone(), order.activity_id.clone());

        // entry 持有分片锁，检查与插入不可分割
        match self.by_participant.entry(participant) {
            Entry::Occupied(_) => Err(StorageError::Duplicate(format!(
                "user={}, activity={}",
                order.user_id, order.activity_id
            ))),
            Entry::Vacant(vacant) => {
                self.orders.insert(order.id, order.clone());
                vacant.insert(order.id);
                trace!("保存订单: {}", order.id);
                Ok(())
            }
        }
    }

    async fn find_order(
        &self,
        user_id: &str,
        activity_id: &str,
    ) -> Result<Option<SeckillOrder>, StorageError> {
        let order_id = self
            .by_participant
            .get(&(user_id.to_string(), activity_id.to_string()))
            .map(|entry| *entry.value());

        Ok(order_id.and_then(|id| self.orders.get(&id).map(|entry| entry.value().clone())))
    }

    async fn get_order(&self, order_id: Uuid) -> Result<Option<SeckillOrder>, StorageError> {
        Ok(self.orders.get(&order_id).map(|entry| entry.value().clone()))
    }

    async fn transition_status(
        &self,
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let mut order = self
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| StorageError::NotFound(format!("订单 {}", order_id)))?;

        if order.status != from || !from.can_transition_to(to) {
            debug!(
                "订单 {} 状态转换未执行: 当前 {}, 期望 {} -> {}",
                order_id, order.status, from, to
            );
            return Ok(false);
        }

        order
            .apply_transition(to, at)
            .map_err(|e| StorageError::QueryError(e.to_string()))?;
        Ok(true)
    }

    async fn find_expired_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SeckillOrder>, StorageError> {
        let mut expired: Vec<SeckillOrder> = self
            .orders
            .iter()
            .filter(|entry| entry.is_overdue(now))
            .map(|entry| entry.value().clone())
            .collect();

        expired.sort_by_key(|order| order.payment_deadline);
        expired.truncate(limit);
        Ok(expired)
    }
}

/// 内存活动目录
#[derive(Debug, Default)]
pub struct MemoryActivityCatalog {
    activities: DashMap<String, SeckillActivity>,
}

impl MemoryActivityCatalog {
    /// 创建新的内存活动目录
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入或更新活动
    pub fn upsert(&self, activity: SeckillActivity) {
        self.activities.insert(activity.id.clone(), activity);
    }
}

#[async_trait]
impl ActivityCatalog for MemoryActivityCatalog {
    async fn find_activity(
        &self,
        activity_id: &str,
    ) -> Result<Option<SeckillActivity>, StorageError> {
        Ok(self
            .activities
            .get(activity_id)
            .map(|entry| entry.value().clone()))
    }
}
