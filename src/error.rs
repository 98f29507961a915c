//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 错误类型定义
//!
//! 使用thiserror定义所有错误类型。业务错误按照秒杀准入管线的错误分类组织：
//! 校验错误、未找到、库存不足、限流、服务不可用、内部错误。

use thiserror::Error;

/// 秒杀管线错误类型
#[derive(Error, Debug)]
pub enum SeckillError {
    /// 请求校验失败（格式错误、不在活动窗口内等），不可重试
    #[error("校验错误: {0}")]
    ValidationError(String),

    /// 用户已参与过该活动
    #[error("用户已参与活动: user={user_id}, activity={activity_id}")]
    AlreadyParticipated {
        user_id: String,
        activity_id: String,
    },

    /// 活动或订单不存在
    #[error("未找到: {0}")]
    NotFound(String),

    /// 库存不足，终态错误，不可重试
    #[error("库存不足: 请求 {requested}, 剩余 {available}")]
    InsufficientStock { requested: u64, available: u64 },

    /// 请求被限流，客户端可在重置时间后重试
    #[error("请求过于频繁: key={key}, 重置时间={reset_at_ms}")]
    TooManyRequests {
        key: String,
        remaining: u64,
        reset_at_ms: i64,
    },

    /// 熔断器打开或无健康实例，客户端可退避后重试
    #[error("服务不可用: {0}")]
    ServiceUnavailable(String),

    /// 下游意外失败，详情只记录日志，不直接暴露给调用方
    #[error("内部错误: {0}")]
    InternalError(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// 存储错误
    #[error("存储错误: {0}")]
    StorageError(#[from] StorageError),

    /// IO错误
    #[error("IO错误: {0}")]
    IoError(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// YAML解析错误
    #[error("YAML解析错误: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML解析错误
    #[error("TOML解析错误: {0}")]
    TomlError(#[from] toml::de::Error),
}

impl SeckillError {
    /// 映射到等价的HTTP状态码
    pub fn status_code(&self) -> u16 {
        match self {
            SeckillError::ValidationError(_) => 400,
            SeckillError::AlreadyParticipated { .. } => 409,
            SeckillError::NotFound(_) => 404,
            SeckillError::InsufficientStock { .. } => 409,
            SeckillError::TooManyRequests { .. } => 429,
            SeckillError::ServiceUnavailable(_) => 503,
            SeckillError::StorageError(StorageError::TimeoutError(_)) => 503,
            SeckillError::StorageError(StorageError::NotFound(_)) => 404,
            SeckillError::StorageError(StorageError::Duplicate(_)) => 409,
            _ => 500,
        }
    }

    /// 客户端是否可以重试
    ///
    /// 库存不足、校验失败等终态错误返回 `false`。存储超时返回 `true`，
    /// 但调用方应当把它呈现为"请稍后再试"，不要自动重试秒杀流量。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SeckillError::TooManyRequests { .. }
                | SeckillError::ServiceUnavailable(_)
                | SeckillError::StorageError(StorageError::TimeoutError(_))
        )
    }

    /// 可以返回给调用方的消息
    pub fn public_message(&self) -> String {
        match self {
            SeckillError::InternalError(_)
            | SeckillError::ConfigError(_)
            | SeckillError::IoError(_)
            | SeckillError::SerdeError(_)
            | SeckillError::YamlError(_)
            | SeckillError::TomlError(_) => "服务内部错误".to_string(),
            SeckillError::StorageError(StorageError::TimeoutError(_)) => {
                "系统繁忙，请稍后再试".to_string()
            }
            SeckillError::StorageError(StorageError::Duplicate(_)) => "请勿重复下单".to_string(),
            SeckillError::StorageError(_) => "服务内部错误".to_string(),
            other => other.to_string(),
        }
    }
}

/// 存储错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// 连接错误
    #[error("连接错误: {0}")]
    ConnectionError(String),

    /// 查询错误
    #[error("查询错误: {0}")]
    QueryError(String),

    /// 超时错误
    #[error("超时错误: {0}")]
    TimeoutError(String),

    /// 未找到
    #[error("未找到: {0}")]
    NotFound(String),

    /// 唯一约束冲突
    #[error("重复记录: {0}")]
    Duplicate(String),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                if db_err.code().as_deref() == Some("23505") {
                    StorageError::Duplicate(db_err.to_string())
                } else {
                    StorageError::QueryError(db_err.to_string())
                }
            }
            sqlx::Error::PoolTimedOut => StorageError::TimeoutError("连接池超时".to_string()),
            sqlx::Error::PoolClosed => StorageError::ConnectionError("连接池已关闭".to_string()),
            sqlx::Error::RowNotFound => StorageError::NotFound("记录未找到".to_string()),
            _ => StorageError::QueryError(err.to_string()),
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            StorageError::TimeoutError(err.to_string())
        } else if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error()
        {
            StorageError::ConnectionError(err.to_string())
        } else {
            StorageError::QueryError(err.to_string())
        }
    }
}

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CircuitState {
    /// 关闭状态（正常）
    Closed,
    /// 打开状态（熔断）
    Open,
    /// 半开状态（探测）
    HalfOpen,
}

impl CircuitState {
    /// 状态名称
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// 熔断器统计信息
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CircuitBreakerStats {
    /// 依赖服务名称
    pub name: String,
    /// 当前状态
    pub state: CircuitState,
    /// 失败次数
    pub failure_count: u64,
    /// 成功次数
    pub success_count: u64,
    /// 最后失败时间
    pub last_failure_time: Option<chrono::DateTime<chrono::Utc>>,
    /// 允许半开探测的时间
    pub next_attempt_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// 限流决策结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// 是否允许
    pub allowed: bool,
    /// 剩余可用次数
    pub remaining: u64,
    /// 窗口重置时间（毫秒时间戳）
    pub reset_at_ms: i64,
    /// 限流键，未命中规则时为空
    pub key: Option<String>,
}

impl RateLimitDecision {
    /// 未命中任何规则时的放行结果
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining: u64::MAX,
            reset_at_ms: 0,
            key: None,
        }
    }

    /// 是否命中了限流规则
    pub fn is_limited(&self) -> bool {
        self.key.is_some()
    }

    /// 转换为错误（被拒绝时）
    pub fn into_result(self) -> Result<Self, SeckillError> {
        if self.allowed {
            Ok(self)
        } else {
            Err(SeckillError::TooManyRequests {
                key: self.key.unwrap_or_default(),
                remaining: self.remaining,
                reset_at_ms: self.reset_at_ms,
            })
        }
    }

    /// 生成响应元数据头
    pub fn headers(&self) -> Vec<(String, String)> {
        if !self.is_limited() {
            return Vec::new();
        }
        vec![
            ("X-RateLimit-Remaining".to_string(), self.remaining.to_string()),
            ("X-RateLimit-Reset".to_string(), self.reset_at_ms.to_string()),
        ]
    }
}
