//! 秒杀下单服务
//!
//! 完整下单流程：校验请求 → 预扣库存 → 构造订单 → 持久化 → 标记参与。
//! 预扣成功之后的任何失败都会先回补库存再返回错误。预扣之后的步骤在独立任务中
//! 执行，调用方取消请求（例如客户端断开）也不会跳过回补。
//!
//! 订单状态机：`PENDING` → `PAID` | `CANCELLED` | `EXPIRED`。取消和过期通过
//! 比较并设置完成，只有真正完成转换的调用方才回补库存，保证恰好一次。

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::SeckillSettings;
use crate::constants::{DEFAULT_MARK_BACKOFF_MS, DEFAULT_PAYMENT_TIMEOUT_SECS};
use crate::error::{SeckillError, StorageError};
use crate::governor::Governor;
use crate::model::{ActivityStatus, OrderStatus, SeckillActivity, SeckillOrder};
use crate::participation::ParticipationGuard;
use crate::repository::{ActivityCatalog, OrderRepository};
use crate::stock::StockReservation;
use crate::storage::CounterStore;
#[cfg(feature = "monitoring")]
use crate::telemetry::Metrics;

/// 秒杀下单服务
#[derive(Clone)]
pub struct SeckillService {
    catalog: Arc<dyn ActivityCatalog>,
    orders: Arc<dyn OrderRepository>,
    stock: StockReservation,
    participation: ParticipationGuard,
    rate_limit: Option<(Arc<Governor>, String)>,
    payment_timeout: Duration,
    #[cfg(feature = "monitoring")]
    metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for SeckillService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeckillService")
            .field("stock", &self.stock)
            .field("participation", &self.participation)
            .field("payment_timeout", &self.payment_timeout)
            .finish()
    }
}

impl SeckillService {
    /// 使用默认设置创建服务
    pub fn new(
        store: Arc<dyn CounterStore>,
        orders: Arc<dyn OrderRepository>,
        catalog: Arc<dyn ActivityCatalog>,
    ) -> Self {
        Self {
            catalog,
            stock: StockReservation::new(store.clone()),
            participation: ParticipationGuard::new(store, orders.clone()),
            orders,
            rate_limit: None,
            payment_timeout: Duration::from_secs(DEFAULT_PAYMENT_TIMEOUT_SECS),
            #[cfg(feature = "monitoring")]
            metrics: None,
        }
    }

    /// 按配置创建服务
    pub fn from_settings(
        store: Arc<dyn CounterStore>,
        orders: Arc<dyn OrderRepository>,
        catalog: Arc<dyn ActivityCatalog>,
        settings: &SeckillSettings,
    ) -> Result<Self, SeckillError> {
        settings.validate().map_err(SeckillError::ConfigError)?;

        let participation = ParticipationGuard::new(store.clone(), orders.clone())
            .with_mark_retries(
                settings.mark_retries,
                Duration::from_millis(DEFAULT_MARK_BACKOFF_MS),
            );

        Ok(Self {
            catalog,
            stock: StockReservation::with_grace_period(store, settings.stock_grace_period()?),
            participation,
            orders,
            rate_limit: None,
            payment_timeout: settings.payment_timeout()?,
            #[cfg(feature = "monitoring")]
            metrics: None,
        })
    }

    /// 设置支付超时
    pub fn with_payment_timeout(mut self, timeout: Duration) -> Self {
        self.payment_timeout = timeout;
        self
    }

    /// 下单前按用户限流，`action` 为限流规则ID
    pub fn with_rate_limit(mut self, governor: Arc<Governor>, action: impl Into<String>) -> Self {
        self.rate_limit = Some((governor, action.into()));
        self
    }

    /// 记录监控指标
    #[cfg(feature = "monitoring")]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// 库存预扣服务
    pub fn stock(&self) -> &StockReservation {
        &self.stock
    }

    /// 支付超时
    pub fn payment_timeout(&self) -> Duration {
        self.payment_timeout
    }

    /// 从活动目录加载活动并初始化库存计数
    #[instrument(skip(self))]
    pub async fn warm_up(&self, activity_id: &str) -> Result<SeckillActivity, SeckillError> {
        let activity = self.load_activity(activity_id).await?;
        activity.validate()?;
        self.stock.initialize(&activity).await?;
        Ok(activity)
    }

    /// 按ID获取订单
    pub async fn get_order(&self, order_id: Uuid) -> Result<SeckillOrder, SeckillError> {
        self.orders
            .get_order(order_id)
            .await?
            .ok_or_else(|| SeckillError::NotFound(format!("订单 {}", order_id)))
    }

    async fn load_activity(&self, activity_id: &str) -> Result<SeckillActivity, SeckillError> {
        self.catalog
            .find_activity(activity_id)
            .await?
            .ok_or_else(|| SeckillError::NotFound(format!("活动 {}", activity_id)))
    }

    /// 秒杀下单
    #[instrument(skip(self))]
    pub async fn process_seckill_order(
        &self,
        user_id: &str,
        activity_id: &str,
        quantity: u32,
    ) -> Result<SeckillOrder, SeckillError> {
        self.process_seckill_order_at(user_id, activity_id, quantity, Utc::now())
            .await
    }

    /// 秒杀下单（指定当前时间）
    pub async fn process_seckill_order_at(
        &self,
        user_id: &str,
        activity_id: &str,
        quantity: u32,
        now: DateTime<Utc>,
    ) -> Result<SeckillOrder, SeckillError> {
        let activity = self
            .validate_request(user_id, activity_id, quantity, now)
            .await?;

        let reserved = self.stock.reserve(&activity.id, u64::from(quantity)).await?;
        #[cfg(feature = "monitoring")]
        if let Some(metrics) = &self.metrics {
            metrics.record_reservation(reserved.is_granted());
        }
        let remaining = reserved.into_result(&activity.id)?;
        debug!(
            "预扣成功: user={}, activity={}, remaining={}",
            user_id, activity.id, remaining
        );

        // 预扣与 spawn 之间没有 await，取消只可能发生在任务外
        let task = tokio::spawn(finalize_order(
            self.clone(),
            user_id.to_string(),
            activity,
            quantity,
            now,
        ));

        match task.await {
            Ok(result) => result,
            Err(e) => {
                error!("下单任务异常退出: user={}, 错误: {}", user_id, e);
                Err(SeckillError::InternalError(format!("下单任务失败: {}", e)))
            }
        }
    }

    async fn validate_request(
        &self,
        user_id: &str,
        activity_id: &str,
        quantity: u32,
        now: DateTime<Utc>,
    ) -> Result<SeckillActivity, SeckillError> {
        if user_id.is_empty() {
            return Err(SeckillError::ValidationError("用户ID不能为空".to_string()));
        }
        if quantity == 0 {
            return Err(SeckillError::ValidationError("购买数量必须大于0".to_string()));
        }

        let activity = self.load_activity(activity_id).await?;
        match activity.status_at(now) {
            ActivityStatus::Active => {}
            ActivityStatus::Pending => {
                return Err(SeckillError::ValidationError(format!(
                    "活动 {} 尚未开始",
                    activity.id
                )))
            }
            ActivityStatus::Ended => {
                return Err(SeckillError::ValidationError(format!(
                    "活动 {} 已结束",
                    activity.id
                )))
            }
            ActivityStatus::Cancelled => {
                return Err(SeckillError::ValidationError(format!(
                    "活动 {} 已取消",
                    activity.id
                )))
            }
        }
        if quantity > activity.limit_per_user {
            return Err(SeckillError::ValidationError(format!(
                "超过单笔限购数量: {} > {}",
                quantity, activity.limit_per_user
            )));
        }
        if u64::from(quantity) > activity.total_stock {
            return Err(SeckillError::InsufficientStock {
                requested: u64::from(quantity),
                available: self.stock.remaining(&activity.id).await?.unwrap_or(0),
            });
        }

        // 库存只作参考，真正的判断在预扣时完成
        if let Some(available) = self.stock.remaining(&activity.id).await? {
            if available < u64::from(quantity) {
                return Err(SeckillError::InsufficientStock {
                    requested: u64::from(quantity),
                    available,
                });
            }
        }

        if let Some((governor, action)) = &self.rate_limit {
            governor
                .is_allowed_at(user_id, action, now.timestamp_millis())
                .await?
                .into_result()?;
        }

        if self.participation.has_participated_at(user_id, &activity, now).await? {
            return Err(SeckillError::AlreadyParticipated {
                user_id: user_id.to_string(),
                activity_id: activity.id.clone(),
            });
        }

        Ok(activity)
    }

    /// 支付订单
    ///
    /// 超过支付截止时间的订单会被置为过期（并回补库存），返回校验错误。
    #[instrument(skip(self))]
    pub async fn pay_order(&self, order_id: Uuid) -> Result<SeckillOrder, SeckillError> {
        self.pay_order_at(order_id, Utc::now()).await
    }

    /// 支付订单（指定当前时间）
    pub async fn pay_order_at(
        &self,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<SeckillOrder, SeckillError> {
        let mut order = self.get_order(order_id).await?;
        if order.status != OrderStatus::Pending {
            return Err(SeckillError::ValidationError(format!(
                "订单 {} 状态为 {}，无法支付",
                order.id, order.status
            )));
        }

        if order.is_overdue(now) {
            self.close_pending(&order, OrderStatus::Expired, now).await?;
            return Err(SeckillError::ValidationError(format!(
                "订单 {} 已超过支付截止时间",
                order.id
            )));
        }

        self.transition(&mut order, OrderStatus::Paid, now).await?;
        info!("订单支付成功: order={}, user={}", order.id, order.user_id);
        Ok(order)
    }

    /// 取消待支付订单并回补库存
    #[instrument(skip(self))]
    pub async fn cancel_order(&self, order_id: Uuid) -> Result<SeckillOrder, SeckillError> {
        self.cancel_order_at(order_id, Utc::now()).await
    }

    /// 取消待支付订单（指定当前时间）
    pub async fn cancel_order_at(
        &self,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<SeckillOrder, SeckillError> {
        let mut order = self.get_order(order_id).await?;
        if !self.close_pending(&order, OrderStatus::Cancelled, now).await? {
            let current = self.get_order(order_id).await?;
            return Err(SeckillError::ValidationError(format!(
                "订单 {} 状态为 {}，无法取消",
                order_id, current.status
            )));
        }
        order.apply_transition(OrderStatus::Cancelled, now)?;
        info!("订单已取消: order={}, user={}", order.id, order.user_id);
        Ok(order)
    }

    /// 将待支付订单置为过期并回补库存
    ///
    /// 返回本次调用是否完成了转换；订单已是终态时返回 `false`。
    #[instrument(skip(self))]
    pub async fn expire_order(&self, order_id: Uuid) -> Result<bool, SeckillError> {
        let order = self.get_order(order_id).await?;
        self.expire_pending(&order, Utc::now()).await
    }

    /// 过期一张已加载的订单
    pub(crate) async fn expire_pending(
        &self,
        order: &SeckillOrder,
        now: DateTime<Utc>,
    ) -> Result<bool, SeckillError> {
        self.close_pending(order, OrderStatus::Expired, now).await
    }

    /// 查找超过支付截止时间的待支付订单
    pub(crate) async fn overdue_orders(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SeckillOrder>, SeckillError> {
        Ok(self.orders.find_expired_pending(now, limit).await?)
    }

    async fn transition(
        &self,
        order: &mut SeckillOrder,
        next: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<(), SeckillError> {
        if !self
            .orders
            .transition_status(order.id, OrderStatus::Pending, next, at)
            .await?
        {
            let current = self.get_order(order.id).await?;
            return Err(SeckillError::ValidationError(format!(
                "订单 {} 状态为 {}，无法转换到 {}",
                order.id, current.status, next
            )));
        }
        order.apply_transition(next, at)?;

        #[cfg(feature = "monitoring")]
        if let Some(metrics) = &self.metrics {
            metrics.record_order_transition(next);
        }
        Ok(())
    }

    /// 关闭待支付订单，只有完成状态转换的调用方回补库存
    async fn close_pending(
        &self,
        order: &SeckillOrder,
        to: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, SeckillError> {
        debug_assert!(to.releases_stock());

        let transitioned = self
            .orders
            .transition_status(order.id, OrderStatus::Pending, to, now)
            .await?;
        if !transitioned {
            debug!("订单已不是待支付状态，跳过: order={}", order.id);
            return Ok(false);
        }

        #[cfg(feature = "monitoring")]
        if let Some(metrics) = &self.metrics {
            metrics.record_order_transition(to);
        }

        // 状态已经转换，回补失败只记录日志，不能再次尝试
        if self
            .stock
            .restore(&order.activity_id, u64::from(order.quantity))
            .await
            .is_ok()
        {
            #[cfg(feature = "monitoring")]
            if let Some(metrics) = &self.metrics {
                metrics.record_restore();
            }
        }

        info!(
            "订单关闭: order={}, status={}, quantity={}",
            order.id, to, order.quantity
        );
        Ok(true)
    }

    /// 预扣成功后回补库存，错误已在库存层记录
    async fn compensate(&self, activity_id: &str, quantity: u32) {
        if self
            .stock
            .restore(activity_id, u64::from(quantity))
            .await
            .is_ok()
        {
            #[cfg(feature = "monitoring")]
            if let Some(metrics) = &self.metrics {
                metrics.record_restore();
            }
        }
    }
}

/// 预扣成功之后的下单步骤
async fn finalize_order(
    service: SeckillService,
    user_id: String,
    activity: SeckillActivity,
    quantity: u32,
    now: DateTime<Utc>,
) -> Result<SeckillOrder, SeckillError> {
    let order = match SeckillOrder::new_pending(
        user_id.as_str(),
        &activity,
        quantity,
        now,
        service.payment_timeout,
    ) {
        Ok(order) => order,
        Err(e) => {
            service.compensate(&activity.id, quantity).await;
            return Err(e);
        }
    };

    if let Err(e) = service.orders.save_order(&order).await {
        service.compensate(&activity.id, quantity).await;
        return Err(match e {
            StorageError::Duplicate(_) => {
                debug!(
                    "订单唯一约束冲突: user={}, activity={}",
                    user_id, activity.id
                );
                SeckillError::AlreadyParticipated {
                    user_id,
                    activity_id: activity.id,
                }
            }
            other => {
                warn!("保存订单失败: user={}, 错误: {}", user_id, other);
                other.into()
            }
        });
    }

    #[cfg(feature = "monitoring")]
    if let Some(metrics) = &service.metrics {
        metrics.record_order_created();
    }

    service
        .participation
        .mark_participated_at(&user_id, &activity, now)
        .await;

    info!(
        "秒杀下单成功: order={}, user={}, activity={}, quantity={}",
        order.id, user_id, activity.id, quantity
    );
    Ok(order)
}
