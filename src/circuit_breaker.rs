//! 熔断器实现
//!
//! 提供熔断器功能，支持三状态转换和自动恢复。
//!
//! # 特性
//!
//! - **三状态**: Closed（关闭）、Open（打开）、HalfOpen（半开）
//! - **自动熔断**: 连续失败次数达到阈值自动熔断
//! - **惰性恢复**: 不使用定时器，`is_open` 检查时间时完成 Open -> HalfOpen
//! - **按依赖隔离**: 每个逻辑服务一个实例，由 [`CircuitBreakerRegistry`] 管理
//!
//! 熔断状态只存在于本进程内存中，各实例独立判断。

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::BreakerConfigSet;
use crate::constants::{
    DEFAULT_CIRCUIT_BREAKER_FAILURE_THRESHOLD, DEFAULT_CIRCUIT_BREAKER_RECOVERY_TIMEOUT_SECS,
    DEFAULT_CIRCUIT_BREAKER_SUCCESS_THRESHOLD,
};
use crate::error::{CircuitBreakerStats, CircuitState, SeckillError};

/// 熔断器配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// 失败阈值（连续失败达到此值时熔断）
    pub failure_threshold: u64,
    /// 成功阈值（半开状态下连续成功达到此值时恢复）
    pub success_threshold: u64,
    /// 恢复超时（打开后等待此时间才允许半开探测）
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_CIRCUIT_BREAKER_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_CIRCUIT_BREAKER_SUCCESS_THRESHOLD,
            recovery_timeout: Duration::from_secs(DEFAULT_CIRCUIT_BREAKER_RECOVERY_TIMEOUT_SECS),
        }
    }
}

impl CircuitBreakerConfig {
    /// 创建新的熔断器配置
    pub fn new(failure_threshold: u64, success_threshold: u64, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            recovery_timeout,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u64,
    success_count: u64,
    last_failure_time: Option<DateTime<Utc>>,
    next_attempt: Option<Instant>,
    next_attempt_time: Option<DateTime<Utc>>,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            next_attempt: None,
            next_attempt_time: None,
        }
    }
}

/// 熔断器
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

impl CircuitBreaker {
    /// 创建新的熔断器
    ///
    /// # 示例
    /// ```rust
    /// use flashgate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
    /// use std::time::Duration;
    ///
    /// let config = CircuitBreakerConfig::new(5, 2, Duration::from_secs(30));
    /// let breaker = CircuitBreaker::new("order-service", config);
    /// assert!(!breaker.is_open());
    /// ```
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        debug!(
            "创建熔断器: name={}, failure_threshold={}, success_threshold={}, recovery_timeout={:?}",
            name, config.failure_threshold, config.success_threshold, config.recovery_timeout
        );

        Self {
            name,
            config,
            inner: Mutex::new(BreakerState::closed()),
        }
    }

    /// 依赖服务名称
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 配置
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// 熔断器是否打开
    ///
    /// 恢复超时已过时，本次调用会把状态转为半开并返回 `false`。
    pub fn is_open(&self) -> bool {
        self.is_open_at(Instant::now())
    }

    /// 熔断器是否打开（指定当前时间）
    pub fn is_open_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            return false;
        }

        match inner.next_attempt {
            Some(next_attempt) if now > next_attempt => {
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
                info!("熔断器状态变更: name={}, Open -> HalfOpen", self.name);
                false
            }
            _ => true,
        }
    }

    /// 是否允许请求通过
    pub fn allow_request(&self) -> bool {
        !self.is_open()
    }

    /// 当前状态（会执行惰性的 Open -> HalfOpen 检查）
    pub fn state(&self) -> CircuitState {
        self.is_open();
        self.inner.lock().state
    }

    /// 记录一次成功调用
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count += 1;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                trace!(
                    "半开探测成功: name={}, {}/{}",
                    self.name,
                    inner.success_count,
                    self.config.success_threshold
                );
                if inner.success_count >= self.config.success_threshold {
                    *inner = BreakerState::closed();
                    info!("熔断器状态变更: name={}, HalfOpen -> Closed", self.name);
                }
            }
            CircuitState::Open => {
                trace!("熔断器打开状态下收到成功响应: name={}", self.name);
            }
        }
    }

    /// 记录一次失败调用
    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    /// 记录一次失败调用（指定当前时间）
    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        inner.last_failure_time = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                inner.success_count = 0;
                if inner.failure_count >= self.config.failure_threshold {
                    self.trip(&mut inner, now);
                    warn!(
                        "熔断器状态变更: name={}, Closed -> Open, 失败次数: {}",
                        self.name, inner.failure_count
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.failure_count += 1;
                self.trip(&mut inner, now);
                warn!(
                    "熔断器状态变更: name={}, HalfOpen -> Open, 失败次数: {}",
                    self.name, inner.failure_count
                );
            }
            CircuitState::Open => {
                trace!("熔断器打开状态下收到失败响应: name={}", self.name);
            }
        }
    }

    fn trip(&self, inner: &mut BreakerState, now: Instant) {
        inner.state = CircuitState::Open;
        inner.success_count = 0;
        inner.next_attempt = Some(now + self.config.recovery_timeout);
        inner.next_attempt_time = chrono::Duration::from_std(self.config.recovery_timeout)
            .ok()
            .map(|timeout| Utc::now() + timeout);
    }

    /// 重置为关闭状态
    pub fn reset(&self) {
        *self.inner.lock() = BreakerState::closed();
        info!("重置熔断器: name={}", self.name);
    }

    /// 统计信息
    pub fn stats(&self) -> CircuitBreakerStats {
        self.is_open();
        let inner = self.inner.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_time: inner.last_failure_time,
            next_attempt_time: match inner.state {
                CircuitState::Open => inner.next_attempt_time,
                _ => None,
            },
        }
    }

    /// 在熔断器保护下执行操作
    ///
    /// 熔断器打开时不会执行 `operation`，直接返回服务不可用。
    pub async fn call<F, T>(&self, operation: F) -> Result<T, SeckillError>
    where
        F: Future<Output = Result<T, SeckillError>>,
    {
        if self.is_open() {
            return Err(SeckillError::ServiceUnavailable(format!(
                "{} 熔断中",
                self.name
            )));
        }

        match operation.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }
}

/// 熔断器注册表
///
/// 在启动时构造一次，以引用的方式传给所有调用方。首次使用某个服务名时
/// 按该服务的覆盖配置（没有则用默认配置）惰性创建熔断器。
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    /// 使用默认配置创建注册表
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            overrides: HashMap::new(),
            breakers: DashMap::new(),
        }
    }

    /// 从配置集合创建注册表
    pub fn from_settings(settings: &BreakerConfigSet) -> Result<Self, SeckillError> {
        let mut registry = Self::new(settings.default.to_breaker_config()?);
        for (service, service_settings) in &settings.services {
            registry = registry.with_override(service, service_settings.to_breaker_config()?);
        }
        Ok(registry)
    }

    /// 为某个服务指定配置
    pub fn with_override(mut self, service: &str, config: CircuitBreakerConfig) -> Self {
        self.overrides.insert(service.to_string(), config);
        self
    }

    /// 获取或创建服务对应的熔断器
    pub fn get_or_create(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(service) {
            return breaker.value().clone();
        }

        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(service)
                    .cloned()
                    .unwrap_or_else(|| self.default_config.clone());
                Arc::new(CircuitBreaker::new(service, config))
            })
            .value()
            .clone()
    }

    /// 获取已存在的熔断器
    pub fn get(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(service).map(|entry| entry.value().clone())
    }

    /// 所有熔断器的统计信息，按名称排序
    pub fn all_stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<CircuitBreakerStats> = self
            .breakers
            .iter()
            .map(|entry| entry.value().stats())
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// 重置所有熔断器
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }
}
