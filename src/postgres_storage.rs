//! PostgreSQL存储实现
//!
//! 使用sqlx实现订单仓库和活动目录，支持连接池、查询超时和完整的错误处理。
//!
//! # 数据库Schema
//!
//! ```sql
//! -- 秒杀活动表（由管理流程维护，这里只读）
//! CREATE TABLE seckill_activities (
//!     id VARCHAR(64) PRIMARY KEY,
//!     product_id VARCHAR(64) NOT NULL,
//!     original_price_cents BIGINT NOT NULL,
//!     seckill_price_cents BIGINT NOT NULL,
//!     total_stock BIGINT NOT NULL,
//!     start_time TIMESTAMPTZ NOT NULL,
//!     end_time TIMESTAMPTZ NOT NULL,
//!     limit_per_user INTEGER NOT NULL DEFAULT 1,
//!     cancelled BOOLEAN NOT NULL DEFAULT false
//! );
//!
//! -- 秒杀订单表（永不删除，保留审计）
//! CREATE TABLE seckill_orders (
//!     id UUID PRIMARY KEY,
//!     user_id VARCHAR(64) NOT NULL,
//!     activity_id VARCHAR(64) NOT NULL,
//!     product_id VARCHAR(64) NOT NULL,
//!     quantity INTEGER NOT NULL,
//!     unit_price_cents BIGINT NOT NULL,
//!     status VARCHAR(16) NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL,
//!     payment_deadline TIMESTAMPTZ NOT NULL,
//!     paid_at TIMESTAMPTZ,
//!     closed_at TIMESTAMPTZ,
//!     UNIQUE (user_id, activity_id)
//! );
//!
//! CREATE INDEX idx_seckill_orders_pending_deadline
//!     ON seckill_orders(payment_deadline)
//!     WHERE status = 'PENDING';
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, Secret};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::StorageError;
use crate::model::{OrderStatus, SeckillActivity, SeckillOrder};
use crate::repository::{ActivityCatalog, OrderRepository};

const SCHEMA_STATEMENTS: [&str; 3] = [
    r#"CREATE TABLE IF NOT EXISTS seckill_activities (
        id VARCHAR(64) PRIMARY KEY,
        product_id VARCHAR(64) NOT NULL,
        original_price_cents BIGINT NOT NULL,
        seckill_price_cents BIGINT NOT NULL,
        total_stock BIGINT NOT NULL,
        start_time TIMESTAMPTZ NOT NULL,
        end_time TIMESTAMPTZ NOT NULL,
        limit_per_user INTEGER NOT NULL DEFAULT 1,
        cancelled BOOLEAN NOT NULL DEFAULT false
    )"#,
    r#"CREATE TABLE IF NOT EXISTS seckill_orders (
        id UUID PRIMARY KEY,
        user_id VARCHAR(64) NOT NULL,
        activity_id VARCHAR(64) NOT NULL,
        product_id VARCHAR(64) NOT NULL,
        quantity INTEGER NOT NULL,
        unit_price_cents BIGINT NOT NULL,
        status VARCHAR(16) NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        payment_deadline TIMESTAMPTZ NOT NULL,
        paid_at TIMESTAMPTZ,
        closed_at TIMESTAMPTZ,
        UNIQUE (user_id, activity_id)
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_seckill_orders_pending_deadline
        ON seckill_orders(payment_deadline)
        WHERE status = 'PENDING'"#,
];

const ORDER_COLUMNS: &str = "id, user_id, activity_id, product_id, quantity, unit_price_cents, \
     status, created_at, payment_deadline, paid_at, closed_at";

type OrderRow = (
    Uuid,
    String,
    String,
    String,
    i32,
    i64,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
);

type ActivityRow = (
    String,
    String,
    i64,
    i64,
    i64,
    DateTime<Utc>,
    DateTime<Utc>,
    i32,
    bool,
);

fn order_from_row(row: OrderRow) -> Result<SeckillOrder, StorageError> {
    let (
        id,
        user_id,
        activity_id,
        product_id,
        quantity,
        unit_price_cents,
        status,
        created_at,
        payment_deadline,
        paid_at,
        closed_at,
    ) = row;

    let status = status
        .parse::<OrderStatus>()
        .map_err(|e| StorageError::QueryError(e.to_string()))?;
    let quantity = u32::try_from(quantity)
        .map_err(|_| StorageError::QueryError(format!("订单 {} 数量非法: {}", id, quantity)))?;

    Ok(SeckillOrder {
        id,
        user_id,
        activity_id,
        product_id,
        quantity,
        unit_price_cents,
        status,
        created_at,
        payment_deadline,
        paid_at,
        closed_at,
    })
}

fn activity_from_row(row: ActivityRow) -> Result<SeckillActivity, StorageError> {
    let (
        id,
        product_id,
        original_price_cents,
        seckill_price_cents,
        total_stock,
        start_time,
        end_time,
        limit_per_user,
        cancelled,
    ) = row;

    let total_stock = u64::try_from(total_stock)
        .map_err(|_| StorageError::QueryError(format!("活动 {} 库存非法", id)))?;
    let limit_per_user = u32::try_from(limit_per_user)
        .map_err(|_| StorageError::QueryError(format!("活动 {} 限购数量非法", id)))?;

    Ok(SeckillActivity {
        id,
        product_id,
        original_price_cents,
        seckill_price_cents,
        total_stock,
        start_time,
        end_time,
        limit_per_user,
        cancelled,
    })
}

/// PostgreSQL存储配置
#[derive(Clone)]
pub struct PostgresStorageConfig {
    /// 数据库连接URL（使用 Secret 包装以防止意外泄露）
    pub database_url: Secret<String>,
    /// 连接池最大连接数
    pub max_connections: u32,
    /// 连接池最小空闲连接数
    pub min_connections: u32,
    /// 连接超时时间（秒）
    pub connect_timeout: u64,
    /// 查询超时时间（秒）
    pub query_timeout: u64,
}

impl std::fmt::Debug for PostgresStorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStorageConfig")
            .field("database_url", &"***")
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("connect_timeout", &self.connect_timeout)
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}

impl Default for PostgresStorageConfig {
    fn default() -> Self {
        Self {
            database_url: Secret::new(String::new()),
            max_connections: 20,
            min_connections: 5,
            connect_timeout: 30,
            query_timeout: 5,
        }
    }
}

impl PostgresStorageConfig {
    /// 创建新的配置
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: Secret::new(database_url.into()),
            ..Default::default()
        }
    }

    /// 创建新的配置（使用 Secret）
    pub fn with_secret(database_url: Secret<String>) -> Self {
        Self {
            database_url,
            ..Default::default()
        }
    }

    /// 设置最大连接数
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// 设置最小连接数
    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// 设置连接超时
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout.as_secs();
        self
    }

    /// 设置查询超时
    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout.as_secs();
        self
    }
}

/// PostgreSQL存储实现
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
    query_timeout: Duration,
}

impl PostgresStorage {
    /// 创建新的PostgreSQL存储实例
    ///
    /// # 错误
    ///
    /// 无法连接到数据库时返回连接错误
    pub async fn new(config: PostgresStorageConfig) -> Result<Self, StorageError> {
        info!("正在连接PostgreSQL数据库...");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(config.database_url.expose_secret())
            .await
            .map_err(|e| {
                error!("数据库连接失败: {}", e);
                StorageError::ConnectionError(format!("无法连接到数据库: {}", e))
            })?;

        info!("成功连接到PostgreSQL数据库");

        Ok(Self {
            pool,
            query_timeout: Duration::from_secs(config.query_timeout),
        })
    }

    /// 从连接池创建存储实例
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            query_timeout: Duration::from_secs(5),
        }
    }

    /// 获取连接池引用
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 创建表结构（幂等）
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::QueryError(format!("创建表结构失败: {}", e)))?;
        }
        debug!("秒杀表结构已就绪");
        Ok(())
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::ConnectionError(format!("健康检查失败: {}", e)))?;
        Ok(())
    }

    /// 插入或更新活动（管理流程与测试使用）
    pub async fn upsert_activity(&self, activity: &SeckillActivity) -> Result<(), StorageError> {
        let total_stock = i64::try_from(activity.total_stock)
            .map_err(|_| StorageError::QueryError("库存超出范围".to_string()))?;
        let limit_per_user = i32::try_from(activity.limit_per_user)
            .map_err(|_| StorageError::QueryError("限购数量超出范围".to_string()))?;

        self.timed(
            sqlx::query(
                r#"
                INSERT INTO seckill_activities
                    (id, product_id, original_price_cents, seckill_price_cents, total_stock,
                     start_time, end_time, limit_per_user, cancelled)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (id) DO UPDATE SET
                    product_id = EXCLUDED.product_id,
                    original_price_cents = EXCLUDED.original_price_cents,
                    seckill_price_cents = EXCLUDED.seckill_price_cents,
                    total_stock = EXCLUDED.total_stock,
                    start_time = EXCLUDED.start_time,
                    end_time = EXCLUDED.end_time,
                    limit_per_user = EXCLUDED.limit_per_user,
                    cancelled = EXCLUDED.cancelled
                "#,
            )
            .bind(&activity.id)
            .bind(&activity.product_id)
            .bind(activity.original_price_cents)
            .bind(activity.seckill_price_cents)
            .bind(total_stock)
            .bind(activity.start_time)
            .bind(activity.end_time)
            .bind(limit_per_user)
            .bind(activity.cancelled)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn timed<T, Fut>(&self, fut: Fut) -> Result<T, StorageError>
    where
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.query_timeout, fut).await {
            Ok(result) => result.map_err(StorageError::from),
            Err(_) => {
                warn!("PostgreSQL查询超时: {:?}", self.query_timeout);
                Err(StorageError::TimeoutError("查询超时".to_string()))
            }
        }
    }
}

#[async_trait]
impl OrderRepository for PostgresStorage {
    async fn save_order(&self, order: &SeckillOrder) -> Result<(), StorageError> {
        let quantity = i32::try_from(order.quantity)
            .map_err(|_| StorageError::QueryError("订单数量超出范围".to_string()))?;

        self.timed(
            sqlx::query(
                r#"
                INSERT INTO seckill_orders
                    (id, user_id, activity_id, product_id, quantity, unit_price_cents,
                     status, created_at, payment_deadline, paid_at, closed_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(order.id)
            .bind(&order.user_id)
            .bind(&order.activity_id)
            .bind(&order.product_id)
            .bind(quantity)
            .bind(order.unit_price_cents)
            .bind(order.status.as_str())
            .bind(order.created_at)
            .bind(order.payment_deadline)
            .bind(order.paid_at)
            .bind(order.closed_at)
            .execute(&self.pool),
        )
        .await?;

        debug!("保存订单: {}", order.id);
        Ok(())
    }

    async fn find_order(
        &self,
        user_id: &str,
        activity_id: &str,
    ) -> Result<Option<SeckillOrder>, StorageError> {
        let sql = format!(
            "SELECT {} FROM seckill_orders WHERE user_id = $1 AND activity_id = $2",
            ORDER_COLUMNS
        );
        let row = self
            .timed(
                sqlx::query_as::<_, OrderRow>(&sql)
                    .bind(user_id)
                    .bind(activity_id)
                    .fetch_optional(&self.pool),
            )
            .await?;

        row.map(order_from_row).transpose()
    }

    async fn get_order(&self, order_id: Uuid) -> Result<Option<SeckillOrder>, StorageError> {
        let sql = format!("SELECT {} FROM seckill_orders WHERE id = $1", ORDER_COLUMNS);
        let row = self
            .timed(
                sqlx::query_as::<_, OrderRow>(&sql)
                    .bind(order_id)
                    .fetch_optional(&self.pool),
            )
            .await?;

        row.map(order_from_row).transpose()
    }

    async fn transition_status(
        &self,
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        if !from.can_transition_to(to) {
            return Ok(false);
        }

        let (paid_at, closed_at) = match to {
            OrderStatus::Paid => (Some(at), None),
            _ => (None, Some(at)),
        };

        let result = self
            .timed(
                sqlx::query(
                    r#"
                    UPDATE seckill_orders
                    SET status = $3,
                        paid_at = COALESCE($4, paid_at),
                        closed_at = COALESCE($5, closed_at)
                    WHERE id = $1 AND status = $2
                    "#,
                )
                .bind(order_id)
                .bind(from.as_str())
                .bind(to.as_str())
                .bind(paid_at)
                .bind(closed_at)
                .execute(&self.pool),
            )
            .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        // 未更新：区分订单不存在与状态已变化
        let exists = self
            .timed(
                sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM seckill_orders WHERE id = $1")
                    .bind(order_id)
                    .fetch_one(&self.pool),
            )
            .await?;

        if exists.0 == 0 {
            Err(StorageError::NotFound(format!("订单 {}", order_id)))
        } else {
            Ok(false)
        }
    }

    async fn find_expired_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SeckillOrder>, StorageError> {
        let sql = format!(
            "SELECT {} FROM seckill_orders WHERE status = 'PENDING' AND payment_deadline < $1 \
             ORDER BY payment_deadline ASC LIMIT $2",
            ORDER_COLUMNS
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = self
            .timed(
                sqlx::query_as::<_, OrderRow>(&sql)
                    .bind(now)
                    .bind(limit)
                    .fetch_all(&self.pool),
            )
            .await?;

        rows.into_iter().map(order_from_row).collect()
    }
}

#[async_trait]
impl ActivityCatalog for PostgresStorage {
    async fn find_activity(
        &self,
        activity_id: &str,
    ) -> Result<Option<SeckillActivity>, StorageError> {
        let row = self
            .timed(
                sqlx::query_as::<_, ActivityRow>(
                    r#"
                    SELECT id, product_id, original_price_cents, seckill_price_cents, total_stock,
                           start_time, end_time, limit_per_user, cancelled
                    FROM seckill_activities
                    WHERE id = $1
                    "#,
                )
                .bind(activity_id)
                .fetch_optional(&self.pool),
            )
            .await?;

        row.map(activity_from_row).transpose()
    }
}
