//! Redis计数存储
//!
//! 基于Redis实现 [`CounterStore`]，供多个网关/服务实例共享库存计数、参与标记和限流窗口。
//!
//! # 特性
//!
//! - **连接管理**: 使用ConnectionManager管理连接，自动重连
//! - **Lua脚本**: 预加载脚本，检查并扣减、滑动窗口准入在服务端原子执行
//! - **超时控制**: 每次调用都受 `io_timeout` 约束
//! - **重试机制**: 只有幂等的读操作（`get`/`exists`）按指数退避重试
//!
//! 扣减、回补和限流脚本不会重试：超时后无法判断脚本是否已执行，重试可能重复扣减。

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, IntoConnectionInfo};
use secrecy::{ExposeSecret, Secret};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{parse_duration, RedisSettings};
use crate::constants::DEFAULT_COUNTER_STORE_TIMEOUT_MS;
use crate::error::{SeckillError, StorageError};
use crate::lua_scripts::{LuaScriptManager, LuaScriptType};
use crate::storage::{BucketOutcome, CounterStore, DecrementOutcome, WindowOutcome};

/// 最大键总长度
const MAX_KEY_LENGTH: usize = 1024;

/// 验证完整键
fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() {
        return Err(StorageError::QueryError("键不能为空".to_string()));
    }

    if key.len() > MAX_KEY_LENGTH {
        return Err(StorageError::QueryError(format!(
            "键长度超过限制（最大 {} 字符）",
            MAX_KEY_LENGTH
        )));
    }

    if key.contains('\0') {
        return Err(StorageError::QueryError("键包含非法字符".to_string()));
    }

    Ok(())
}

/// Redis配置
#[derive(Clone)]
pub struct RedisConfig {
    /// Redis连接URL
    pub url: String,
    /// 数据库索引
    pub db: i64,
    /// 密码（使用 Secret 包装以防止意外泄露）
    pub password: Option<Secret<String>>,
    /// 连接超时
    pub connection_timeout: Duration,
    /// 单次操作超时
    pub io_timeout: Duration,
    /// 读操作最大重试次数
    pub max_retries: u32,
    /// 重试初始退避时间
    pub retry_initial_backoff: Duration,
}

impl std::fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConfig")
            .field("url", &self.url)
            .field("db", &self.db)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("connection_timeout", &self.connection_timeout)
            .field("io_timeout", &self.io_timeout)
            .field("max_retries", &self.max_retries)
            .field("retry_initial_backoff", &self.retry_initial_backoff)
            .finish()
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            db: 0,
            password: None,
            connection_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_millis(DEFAULT_COUNTER_STORE_TIMEOUT_MS),
            max_retries: 2,
            retry_initial_backoff: Duration::from_millis(50),
        }
    }
}

impl RedisConfig {
    /// 创建新的Redis配置
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// 设置数据库索引
    pub fn db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }

    /// 设置密码
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Secret::new(password.into()));
        self
    }

    /// 设置密码（使用 Secret）
    pub fn password_secret(mut self, password: Secret<String>) -> Self {
        self.password = Some(password);
        self
    }

    /// 设置连接超时
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// 设置单次操作超时
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// 设置最大重试次数
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// 设置重试初始退避时间
    pub fn retry_initial_backoff(mut self, backoff: Duration) -> Self {
        self.retry_initial_backoff = backoff;
        self
    }

    /// 由配置文件中的 `redis` 段构造
    pub fn from_settings(settings: &RedisSettings) -> Result<Self, SeckillError> {
        settings.validate().map_err(SeckillError::ConfigError)?;
        let mut config = Self::new(settings.url.clone())
            .db(settings.db)
            .io_timeout(parse_duration(&settings.timeout)?);
        config.password = settings.password.clone();
        Ok(config)
    }
}

/// 重试统计
#[derive(Debug, Default, Clone)]
pub struct RetryStats {
    total_retries: Arc<AtomicU64>,
    successful_retries: Arc<AtomicU64>,
    failed_retries: Arc<AtomicU64>,
}

impl RetryStats {
    /// 获取总重试次数
    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// 获取成功重试次数
    pub fn successful_retries(&self) -> u64 {
        self.successful_retries.load(Ordering::Relaxed)
    }

    /// 获取失败重试次数
    pub fn failed_retries(&self) -> u64 {
        self.failed_retries.load(Ordering::Relaxed)
    }

    fn record_success(&self) {
        self.total_retries.fetch_add(1, Ordering::Relaxed);
        self.successful_retries.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.total_retries.fetch_add(1, Ordering::Relaxed);
        self.failed_retries.fetch_add(1, Ordering::Relaxed);
    }
}

/// Redis计数存储实现
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    config: RedisConfig,
    lua_manager: Arc<LuaScriptManager>,
    retry_stats: RetryStats,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("config", &self.config)
            .field("retry_stats", &self.retry_stats)
            .finish()
    }
}

impl RedisCounterStore {
    /// 建立连接并预加载所有脚本
    pub async fn new(config: RedisConfig) -> Result<Self, StorageError> {
        info!("创建Redis计数存储, URL: {}", config.url);

        let mut client_info = config.url.as_str().into_connection_info().map_err(|e| {
            error!("解析Redis URL失败: {}", e);
            StorageError::ConnectionError(format!("解析Redis URL失败: {}", e))
        })?;
        client_info.redis.db = config.db;
        if let Some(password) = &config.password {
            client_info.redis.password = Some(password.expose_secret().clone());
        }

        let client = Client::open(client_info).map_err(|e| {
            error!("创建Redis客户端失败: {}", e);
            StorageError::ConnectionError(format!("创建Redis客户端失败: {}", e))
        })?;

        let conn = tokio::time::timeout(config.connection_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StorageError::TimeoutError("Redis连接超时".to_string()))?
            .map_err(|e| {
                error!("创建Redis连接管理器失败: {}", e);
                StorageError::ConnectionError(format!("创建Redis连接管理器失败: {}", e))
            })?;

        let lua_manager = Arc::new(LuaScriptManager::new());
        let mut preload_conn = conn.clone();
        lua_manager.load_all(&mut preload_conn).await?;

        info!("Redis计数存储创建成功");
        Ok(Self {
            conn,
            config,
            lua_manager,
            retry_stats: RetryStats::default(),
        })
    }

    /// 检查Redis连接
    pub async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        self.with_timeout("PING", async move {
            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(StorageError::from)?;
            Ok(())
        })
        .await
    }

    /// 获取重试统计
    pub fn retry_stats(&self) -> &RetryStats {
        &self.retry_stats
    }

    /// 获取Lua脚本管理器
    pub fn lua_manager(&self) -> &Arc<LuaScriptManager> {
        &self.lua_manager
    }

    async fn with_timeout<T, Fut>(&self, operation: &str, fut: Fut) -> Result<T, StorageError>
    where
        Fut: Future<Output = Result<T, StorageError>>,
    {
        match tokio::time::timeout(self.config.io_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Redis操作超时: {}, 超时: {:?}", operation, self.config.io_timeout);
                Err(StorageError::TimeoutError(format!("{} 超时", operation)))
            }
        }
    }

    /// 带重试的执行，仅用于幂等读操作
    async fn execute_with_retry<F, Fut, T>(&self, operation: &str, f: F) -> Result<T, StorageError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut backoff = self.config.retry_initial_backoff;
        let mut attempt = 0;

        loop {
            match self.with_timeout(operation, f()).await {
                Ok(result) => {
                    if attempt > 0 {
                        self.retry_stats.record_success();
                        debug!("重试成功，尝试次数: {}", attempt);
                    }
                    return Ok(result);
                }
                Err(e) if attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        "操作失败，将在 {:?} 后重试 (尝试 {}/{}): {}",
                        backoff, attempt, self.config.max_retries, e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.mul_f32(2.0);
                }
                Err(e) => {
                    if attempt > 0 {
                        self.retry_stats.record_failure();
                    }
                    error!("操作失败: {}, 错误: {}", operation, e);
                    return Err(e);
                }
            }
        }
    }

    async fn eval<T>(
        &self,
        script_type: LuaScriptType,
        key: &str,
        args: &[&str],
    ) -> Result<T, StorageError>
    where
        T: redis::FromRedisValue,
    {
        validate_key(key)?;
        let mut conn = self.conn.clone();
        self.with_timeout(
            script_type.name(),
            self.lua_manager
                .invoke(&mut conn, script_type, &[key], args),
        )
        .await
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn try_decrement(
        &self,
        key: &str,
        amount: u64,
    ) -> Result<DecrementOutcome, StorageError> {
        // Lua 数值是双精度浮点，超出 i64 的数量直接按库存不足处理
        if i64::try_from(amount).is_err() {
            return Ok(match self.get(key).await? {
                Some(available) => DecrementOutcome::Insufficient {
                    available: available.max(0) as u64,
                },
                None => DecrementOutcome::Missing,
            });
        }

        let (status, value): (i64, i64) = self
            .eval(LuaScriptType::TryDecrement, key, &[&amount.to_string()])
            .await?;

        Ok(match status {
            1 => DecrementOutcome::Granted {
                remaining: value.max(0) as u64,
            },
            0 => DecrementOutcome::Insufficient {
                available: value.max(0) as u64,
            },
            _ => DecrementOutcome::Missing,
        })
    }

    async fn increment_existing(
        &self,
        key: &str,
        amount: u64,
    ) -> Result<Option<i64>, StorageError> {
        if i64::try_from(amount).is_err() {
            return Err(StorageError::QueryError(format!(
                "计数器溢出: {}, 增量 {}",
                key, amount
            )));
        }

        let (status, value): (i64, i64) = self
            .eval(
                LuaScriptType::IncrementExisting,
                key,
                &[&amount.to_string()],
            )
            .await?;

        Ok((status == 1).then_some(value))
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, StorageError> {
        validate_key(key)?;
        self.execute_with_retry("GET", || {
            let mut conn = self.conn.clone();
            async move {
                conn.get::<_, Option<i64>>(key)
                    .await
                    .map_err(StorageError::from)
            }
        })
        .await
    }

    async fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<(), StorageError> {
        validate_key(key)?;
        let mut conn = self.conn.clone();
        self.with_timeout("SET", async move {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
            }
            let _: () = cmd.query_async(&mut conn).await.map_err(StorageError::from)?;
            Ok(())
        })
        .await
    }

    async fn set_marker(&self, key: &str, ttl: Duration) -> Result<(), StorageError> {
        self.set(key, 1, Some(ttl)).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;
        self.execute_with_retry("EXISTS", || {
            let mut conn = self.conn.clone();
            async move { conn.exists::<_, bool>(key).await.map_err(StorageError::from) }
        })
        .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError> {
        validate_key(key)?;
        let mut conn = self.conn.clone();
        self.with_timeout("PEXPIRE", async move {
            let updated: i64 = redis::cmd("PEXPIRE")
                .arg(key)
                .arg(ttl.as_millis().max(1) as u64)
                .query_async(&mut conn)
                .await
                .map_err(StorageError::from)?;
            Ok(updated == 1)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        let mut conn = self.conn.clone();
        self.with_timeout("DEL", async move {
            let _: i64 = conn.del(key).await.map_err(StorageError::from)?;
            Ok(())
        })
        .await
    }

    async fn sliding_window_admit(
        &self,
        key: &str,
        window: Duration,
        limit: u64,
        now_ms: i64,
    ) -> Result<WindowOutcome, StorageError> {
        let window_ms = window.as_millis() as i64;
        // 同一毫秒内的请求必须是不同成员，否则 ZADD 会把它们合并为一条
        let member = format!("{}-{}", now_ms, uuid::Uuid::new_v4());

        let (allowed, count, reset_at_ms): (i64, i64, i64) = self
            .eval(
                LuaScriptType::SlidingWindow,
                key,
                &[
                    &window_ms.to_string(),
                    &limit.to_string(),
                    &now_ms.to_string(),
                    &member,
                ],
            )
            .await?;

        Ok(WindowOutcome {
            allowed: allowed == 1,
            count: count.max(0) as u64,
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
        let (allowed, remaining, reset_at_ms): (i64, i64, i64) = self
            .eval(
                LuaScriptType::TokenBucket,
                key,
                &[
                    &capacity.to_string(),
                    &refill_per_sec.to_string(),
                    &now_ms.to_string(),
                    &cost.to_string(),
                ],
            )
            .await?;

        Ok(BucketOutcome {
            allowed: allowed == 1,
            remaining: remaining.max(0) as u64,
            reset_at_ms,
        })
    }
}
