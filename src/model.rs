//! 秒杀领域模型
//!
//! 活动（只读，由管理流程创建）与订单（每个用户每个活动至多一条，永不删除）。
//! 金额统一使用整数分。

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::constants::DEFAULT_LIMIT_PER_USER;
use crate::error::SeckillError;

/// 活动状态，由当前时间与活动窗口推导
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityStatus {
    /// 未开始
    Pending,
    /// 进行中
    Active,
    /// 已结束
    Ended,
    /// 已取消
    Cancelled,
}

/// 秒杀活动
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeckillActivity {
    /// 活动ID
    pub id: String,
    /// 商品ID
    pub product_id: String,
    /// 原价（分）
    pub original_price_cents: i64,
    /// 秒杀价（分）
    pub seckill_price_cents: i64,
    /// 总库存
    pub total_stock: u64,
    /// 开始时间
    pub start_time: DateTime<Utc>,
    /// 结束时间
    pub end_time: DateTime<Utc>,
    /// 单笔订单允许的最大数量
    #[serde(default = "default_limit_per_user")]
    pub limit_per_user: u32,
    /// 是否已被运营取消
    #[serde(default)]
    pub cancelled: bool,
}

fn default_limit_per_user() -> u32 {
    DEFAULT_LIMIT_PER_USER
}

impl SeckillActivity {
    /// 创建活动
    pub fn new(
        id: impl Into<String>,
        product_id: impl Into<String>,
        original_price_cents: i64,
        seckill_price_cents: i64,
        total_stock: u64,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            product_id: product_id.into(),
            original_price_cents,
            seckill_price_cents,
            total_stock,
            start_time,
            end_time,
            limit_per_user: DEFAULT_LIMIT_PER_USER,
            cancelled: false,
        }
    }

    /// 设置单笔订单最大数量
    pub fn with_limit_per_user(mut self, limit: u32) -> Self {
        self.limit_per_user = limit;
        self
    }

    /// 给定时间点的活动状态
    pub fn status_at(&self, now: DateTime<Utc>) -> ActivityStatus {
        if self.cancelled {
            ActivityStatus::Cancelled
        } else if now < self.start_time {
            ActivityStatus::Pending
        } else if now <= self.end_time {
            ActivityStatus::Active
        } else {
            ActivityStatus::Ended
        }
    }

    /// 当前活动状态
    pub fn status(&self) -> ActivityStatus {
        self.status_at(Utc::now())
    }

    /// 活动剩余时长，已结束时为零
    pub fn remaining_lifetime(&self, now: DateTime<Utc>) -> Duration {
        (self.end_time - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// 校验活动定义
    pub fn validate(&self) -> Result<(), SeckillError> {
        if self.id.is_empty() {
            return Err(SeckillError::ValidationError("活动ID不能为空".to_string()));
        }
        if self.end_time <= self.start_time {
            return Err(SeckillError::ValidationError(format!(
                "活动 {} 的结束时间必须晚于开始时间",
                self.id
            )));
        }
        if self.seckill_price_cents < 0 || self.original_price_cents < 0 {
            return Err(SeckillError::ValidationError(format!(
                "活动 {} 的价格不能为负数",
                self.id
            )));
        }
        if self.limit_per_user == 0 {
            return Err(SeckillError::ValidationError(format!(
                "活动 {} 的单笔限购数量必须大于0",
                self.id
            )));
        }
        Ok(())
    }
}

/// 订单状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// 待支付
    Pending,
    /// 已支付（终态）
    Paid,
    /// 已取消（终态）
    Cancelled,
    /// 已过期（终态）
    Expired,
}

impl OrderStatus {
    /// 状态名称
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Paid => "PAID",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Expired => "EXPIRED",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }

    /// 状态机是否允许从当前状态转换到 `next`
    ///
    /// 只有 `PENDING` 可以离开，`PAID` 永不回退。
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Pending, OrderStatus::Paid)
                | (OrderStatus::Pending, OrderStatus::Cancelled)
                | (OrderStatus::Pending, OrderStatus::Expired)
        )
    }

    /// 转换到该状态是否需要回补库存
    pub fn releases_stock(&self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::Expired)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = SeckillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OrderStatus::Pending),
            "PAID" => Ok(OrderStatus::Paid),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            "EXPIRED" => Ok(OrderStatus::Expired),
            other => Err(SeckillError::ValidationError(format!(
                "未知的订单状态: {}",
                other
            ))),
        }
    }
}

/// 秒杀订单
///
/// 数量和单价创建后不可变，只有状态与时间戳会随状态机变化。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeckillOrder {
    /// 订单ID
    pub id: Uuid,
    /// 用户ID
    pub user_id: String,
    /// 活动ID
    pub activity_id: String,
    /// 商品ID
    pub product_id: String,
    /// 数量
    pub quantity: u32,
    /// 单价（分）
    pub unit_price_cents: i64,
    /// 状态
    pub status: OrderStatus,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 支付截止时间
    pub payment_deadline: DateTime<Utc>,
    /// 支付时间
    pub paid_at: Option<DateTime<Utc>>,
    /// 取消或过期时间
    pub closed_at: Option<DateTime<Utc>>,
}

impl SeckillOrder {
    /// 为一次成功的预扣创建待支付订单
    pub fn new_pending(
        user_id: impl Into<String>,
        activity: &SeckillActivity,
        quantity: u32,
        now: DateTime<Utc>,
        payment_timeout: Duration,
    ) -> Result<Self, SeckillError> {
        let payment_deadline = ChronoDuration::from_std(payment_timeout)
            .ok()
            .and_then(|timeout| now.checked_add_signed(timeout))
            .ok_or_else(|| {
                SeckillError::ConfigError(format!("支付超时设置无效: {:?}", payment_timeout))
            })?;

        Ok(Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            activity_id: activity.id.clone(),
            product_id: activity.product_id.clone(),
            quantity,
            unit_price_cents: activity.seckill_price_cents,
            status: OrderStatus::Pending,
            created_at: now,
            payment_deadline,
            paid_at: None,
            closed_at: None,
        })
    }

    /// 订单总金额（分）
    pub fn total_amount_cents(&self) -> i64 {
        self.unit_price_cents * i64::from(self.quantity)
    }

    /// 给定时间点是否已超过支付截止时间
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == OrderStatus::Pending && now > self.payment_deadline
    }

    /// 在内存副本上应用一次状态转换，不合法时返回错误
    pub fn apply_transition(
        &mut self,
        next: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<(), SeckillError> {
        if !self.status.can_transition_to(next) {
            return Err(SeckillError::ValidationError(format!(
                "订单 {} 不能从 {} 转换到 {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        match next {
            OrderStatus::Paid => self.paid_at = Some(at),
            OrderStatus::Cancelled | OrderStatus::Expired => self.closed_at = Some(at),
            OrderStatus::Pending => {}
        }
        Ok(())
    }
}
