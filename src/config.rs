//! 配置模块
//!
//! 定义秒杀准入管线的配置结构，支持从 YAML 或 TOML 加载，加载时统一校验。
//! 时长使用 `"500ms"`、`"60s"`、`"5m"`、`"1h"` 形式的字符串。

use ahash::AHashSet as HashSet;
use secrecy::Secret;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::constants::{
    DEFAULT_CIRCUIT_BREAKER_FAILURE_THRESHOLD, DEFAULT_CIRCUIT_BREAKER_RECOVERY_TIMEOUT_SECS,
    DEFAULT_CIRCUIT_BREAKER_SUCCESS_THRESHOLD, DEFAULT_COUNTER_STORE_TIMEOUT_MS,
    DEFAULT_FORWARD_TIMEOUT_SECS, DEFAULT_HEARTBEAT_TTL_SECS, DEFAULT_MARK_RETRIES,
    DEFAULT_PAYMENT_TIMEOUT_SECS, DEFAULT_STOCK_GRACE_PERIOD_SECS, DEFAULT_SWEEP_BATCH_SIZE,
    DEFAULT_SWEEP_INTERVAL_SECS,
};
use crate::error::SeckillError;
use crate::limiters::RateLimitAlgorithm;
use crate::matchers::{KeyStrategy, MethodSet, PathPattern};

/// 解析时长字符串
///
/// 支持 `ms`、`s`、`m`、`h` 四种单位，数值必须是非负整数。
pub fn parse_duration(value: &str) -> Result<Duration, SeckillError> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| SeckillError::ConfigError(format!("时长缺少单位: {:?}", value)))?;
    let (number, unit) = value.split_at(split);

    let amount: u64 = number
        .parse()
        .map_err(|_| SeckillError::ConfigError(format!("时长格式错误: {:?}", value)))?;

    let overflow = || SeckillError::ConfigError(format!("时长超出范围: {:?}", value));
    match unit {
        "ms" => Ok(Duration::from_millis(amount)),
        "s" => Ok(Duration::from_secs(amount)),
        "m" => amount
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(overflow),
        "h" => amount
            .checked_mul(3600)
            .map(Duration::from_secs)
            .ok_or_else(overflow),
        _ => Err(SeckillError::ConfigError(format!(
            "未知的时长单位: {:?}",
            value
        ))),
    }
}

fn parse_positive_duration(value: &str, field: &str) -> Result<Duration, String> {
    let duration = parse_duration(value).map_err(|e| format!("{}: {}", field, e))?;
    if duration.is_zero() {
        return Err(format!("{} 必须大于0", field));
    }
    Ok(duration)
}

/// 顶层配置
#[derive(Debug, Clone, Deserialize)]
pub struct FlashgateConfig {
    pub version: String,
    #[serde(default)]
    pub redis: Option<RedisSettings>,
    #[serde(default)]
    pub rate_limit: Vec<RateLimitRule>,
    #[serde(default)]
    pub breakers: BreakerConfigSet,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub seckill: SeckillSettings,
}

impl Default for FlashgateConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            redis: None,
            rate_limit: Vec::new(),
            breakers: BreakerConfigSet::default(),
            routes: Vec::new(),
            gateway: GatewaySettings::default(),
            seckill: SeckillSettings::default(),
        }
    }
}

impl FlashgateConfig {
    /// 从YAML字符串加载并校验
    pub fn from_yaml_str(content: &str) -> Result<Self, SeckillError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validated()
    }

    /// 从TOML字符串加载并校验
    pub fn from_toml_str(content: &str) -> Result<Self, SeckillError> {
        let config: Self = toml::from_str(content)?;
        config.validated()
    }

    /// 按扩展名从文件加载
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SeckillError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            Some("toml") => Self::from_toml_str(&content),
            _ => Err(SeckillError::ConfigError(format!(
                "不支持的配置文件格式: {}",
                path.display()
            ))),
        }
    }

    fn validated(self) -> Result<Self, SeckillError> {
        self.validate().map_err(SeckillError::ConfigError)?;
        Ok(self)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), String> {
        if self.version.is_empty() {
            return Err("版本号不能为空".to_string());
        }

        if let Some(redis) = &self.redis {
            redis.validate()?;
        }

        let mut rule_ids = HashSet::new();
        for (index, rule) in self.rate_limit.iter().enumerate() {
            if !rule_ids.insert(rule.id.as_str()) {
                return Err(format!("规则ID重复: {}", rule.id));
            }
            rule.validate()
                .map_err(|e| format!("规则[{}]校验失败: {}", index, e))?;
        }

        self.breakers.validate()?;

        let mut prefixes = HashSet::new();
        for route in &self.routes {
            route.validate()?;
            if !prefixes.insert(route.prefix.as_str()) {
                return Err(format!("路由前缀重复: {}", route.prefix));
            }
        }

        self.gateway.validate()?;
        self.seckill.validate()?;
        Ok(())
    }
}

/// Redis连接配置
#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    pub url: String,
    #[serde(default)]
    pub db: i64,
    #[serde(default)]
    pub password: Option<Secret<String>>,
    #[serde(default = "default_redis_timeout")]
    pub timeout: String,
}

fn default_redis_timeout() -> String {
    format!("{}ms", DEFAULT_COUNTER_STORE_TIMEOUT_MS)
}

impl RedisSettings {
    /// 校验Redis配置
    pub fn validate(&self) -> Result<(), String> {
        if !self.url.starts_with("redis://") && !self.url.starts_with("rediss://") {
            return Err(format!("Redis URL格式错误: {}", self.url));
        }
        parse_positive_duration(&self.timeout, "redis.timeout")?;
        Ok(())
    }
}

/// 限流规则
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub id: String,
    pub path_pattern: String,
    #[serde(default)]
    pub methods: Vec<String>,
    pub algorithm: RateLimitAlgorithm,
    #[serde(default = "default_strategy")]
    pub strategy: KeyStrategy,
    /// 滑动窗口：窗口内上限；令牌桶：每秒补充令牌数
    pub rate: u64,
    /// 令牌桶容量
    #[serde(default)]
    pub capacity: u64,
    #[serde(default = "default_window")]
    pub window: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_strategy() -> KeyStrategy {
    KeyStrategy::PerIp
}

fn default_window() -> String {
    "60s".to_string()
}

fn default_enabled() -> bool {
    true
}

impl RateLimitRule {
    /// 校验规则
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("规则ID不能为空".to_string());
        }
        PathPattern::parse(&self.path_pattern).map_err(|e| e.to_string())?;
        MethodSet::parse(&self.methods).map_err(|e| e.to_string())?;

        if self.rate == 0 {
            return Err(format!("规则 {} 的 rate 必须大于0", self.id));
        }

        match self.algorithm {
            RateLimitAlgorithm::SlidingWindow => {
                parse_positive_duration(&self.window, "window")?;
            }
            RateLimitAlgorithm::TokenBucket => {
                if self.capacity == 0 {
                    return Err(format!("规则 {} 的令牌桶容量必须大于0", self.id));
                }
            }
        }
        Ok(())
    }

    /// 窗口时长
    pub fn window_duration(&self) -> Result<Duration, SeckillError> {
        parse_duration(&self.window)
    }
}

/// 单个依赖的熔断配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u64,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u64,
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout: String,
}

fn default_failure_threshold() -> u64 {
    DEFAULT_CIRCUIT_BREAKER_FAILURE_THRESHOLD
}

fn default_success_threshold() -> u64 {
    DEFAULT_CIRCUIT_BREAKER_SUCCESS_THRESHOLD
}

fn default_recovery_timeout() -> String {
    format!("{}s", DEFAULT_CIRCUIT_BREAKER_RECOVERY_TIMEOUT_SECS)
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            recovery_timeout: default_recovery_timeout(),
        }
    }
}

impl BreakerSettings {
    /// 校验熔断配置
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold 必须大于0".to_string());
        }
        if self.success_threshold == 0 {
            return Err("success_threshold 必须大于0".to_string());
        }
        parse_positive_duration(&self.recovery_timeout, "recovery_timeout")?;
        Ok(())
    }

    /// 转换为熔断器配置
    pub fn to_breaker_config(&self) -> Result<CircuitBreakerConfig, SeckillError> {
        Ok(CircuitBreakerConfig::new(
            self.failure_threshold,
            self.success_threshold,
            parse_duration(&self.recovery_timeout)?,
        ))
    }
}

/// 熔断配置集合：默认配置 + 按服务覆盖
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakerConfigSet {
    #[serde(default)]
    pub default: BreakerSettings,
    #[serde(default)]
    pub services: HashMap<String, BreakerSettings>,
}

impl BreakerConfigSet {
    /// 校验所有熔断配置
    pub fn validate(&self) -> Result<(), String> {
        self.default
            .validate()
            .map_err(|e| format!("默认熔断配置: {}", e))?;
        for (service, settings) in &self.services {
            settings
                .validate()
                .map_err(|e| format!("服务 {} 的熔断配置: {}", service, e))?;
        }
        Ok(())
    }
}

/// 路由配置：路径前缀 -> 逻辑服务名
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub prefix: String,
    pub service: String,
}

impl RouteConfig {
    /// 创建路由
    pub fn new(prefix: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            service: service.into(),
        }
    }

    /// 校验路由
    pub fn validate(&self) -> Result<(), String> {
        if !self.prefix.starts_with('/') {
            return Err(format!("路由前缀必须以 / 开头: {:?}", self.prefix));
        }
        if self.service.is_empty() {
            return Err(format!("路由 {} 的服务名不能为空", self.prefix));
        }
        Ok(())
    }
}

/// 网关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_forward_timeout")]
    pub forward_timeout: String,
    #[serde(default = "default_heartbeat_ttl")]
    pub heartbeat_ttl: String,
}

fn default_forward_timeout() -> String {
    format!("{}s", DEFAULT_FORWARD_TIMEOUT_SECS)
}

fn default_heartbeat_ttl() -> String {
    format!("{}s", DEFAULT_HEARTBEAT_TTL_SECS)
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            forward_timeout: default_forward_timeout(),
            heartbeat_ttl: default_heartbeat_ttl(),
        }
    }
}

impl GatewaySettings {
    /// 校验网关配置
    pub fn validate(&self) -> Result<(), String> {
        parse_positive_duration(&self.forward_timeout, "forward_timeout")?;
        parse_positive_duration(&self.heartbeat_ttl, "heartbeat_ttl")?;
        Ok(())
    }

    /// 转发超时
    pub fn forward_timeout(&self) -> Result<Duration, SeckillError> {
        parse_duration(&self.forward_timeout)
    }

    /// 心跳TTL
    pub fn heartbeat_ttl(&self) -> Result<Duration, SeckillError> {
        parse_duration(&self.heartbeat_ttl)
    }
}

/// 秒杀业务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeckillSettings {
    #[serde(default = "default_payment_timeout")]
    pub payment_timeout: String,
    #[serde(default = "default_stock_grace_period")]
    pub stock_grace_period: String,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: String,
    #[serde(default = "default_sweep_batch_size")]
    pub sweep_batch_size: usize,
    #[serde(default = "default_mark_retries")]
    pub mark_retries: u32,
}

fn default_payment_timeout() -> String {
    format!("{}s", DEFAULT_PAYMENT_TIMEOUT_SECS)
}

fn default_stock_grace_period() -> String {
    format!("{}s", DEFAULT_STOCK_GRACE_PERIOD_SECS)
}

fn default_sweep_interval() -> String {
    format!("{}s", DEFAULT_SWEEP_INTERVAL_SECS)
}

fn default_sweep_batch_size() -> usize {
    DEFAULT_SWEEP_BATCH_SIZE
}

fn default_mark_retries() -> u32 {
    DEFAULT_MARK_RETRIES
}

impl Default for SeckillSettings {
    fn default() -> Self {
        Self {
            payment_timeout: default_payment_timeout(),
            stock_grace_period: default_stock_grace_period(),
            sweep_interval: default_sweep_interval(),
            sweep_batch_size: default_sweep_batch_size(),
            mark_retries: default_mark_retries(),
        }
    }
}

impl SeckillSettings {
    /// 校验秒杀配置
    pub fn validate(&self) -> Result<(), String> {
        parse_positive_duration(&self.payment_timeout, "payment_timeout")?;
        parse_duration(&self.stock_grace_period)
            .map_err(|e| format!("stock_grace_period: {}", e))?;
        parse_positive_duration(&self.sweep_interval, "sweep_interval")?;
        if self.sweep_batch_size == 0 {
            return Err("sweep_batch_size 必须大于0".to_string());
        }
        if self.mark_retries == 0 {
            return Err("mark_retries 必须大于0".to_string());
        }
        Ok(())
    }

    /// 支付超时
    pub fn payment_timeout(&self) -> Result<Duration, SeckillError> {
        parse_duration(&self.payment_timeout)
    }

    /// 库存键宽限期
    pub fn stock_grace_period(&self) -> Result<Duration, SeckillError> {
        parse_duration(&self.stock_grace_period)
    }

    /// 过期扫描间隔
    pub fn sweep_interval(&self) -> Result<Duration, SeckillError> {
        parse_duration(&self.sweep_interval)
    }
}
