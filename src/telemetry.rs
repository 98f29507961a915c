//! 监控和日志初始化模块
//!
//! # 功能
//!
//! - `telemetry` 特性：基于 `tracing-subscriber` 初始化日志输出，
//!   `RUST_LOG` 优先于配置中的默认过滤指令
//! - `monitoring` 特性：Prometheus 指标（预占、回补、订单终态、限流、熔断）
//!
//! # 示例
//!
//! ```rust,ignore
//! use flashgate::telemetry::{init_tracing, Metrics, TelemetryConfig};
//!
//! init_tracing(&TelemetryConfig::new("flashgate")).unwrap();
//! let metrics = Metrics::new().unwrap();
//! metrics.record_reservation(true);
//! println!("{}", metrics.gather());
//! ```

#[cfg(feature = "monitoring")]
pub use self::metrics::Metrics;
#[cfg(feature = "telemetry")]
pub use self::tracing_init::{init_tracing, TelemetryConfig};

#[cfg(feature = "telemetry")]
mod tracing_init {
    use tracing::info;
    use tracing_subscriber::EnvFilter;

    use crate::error::SeckillError;

    /// 日志配置
    #[derive(Debug, Clone)]
    pub struct TelemetryConfig {
        /// 服务名称
        pub service_name: String,
        /// 未设置 `RUST_LOG` 时使用的过滤指令
        pub default_directive: String,
        /// 是否输出日志目标（模块路径）
        pub with_target: bool,
    }

    impl Default for TelemetryConfig {
        fn default() -> Self {
            Self {
                service_name: "flashgate".to_string(),
                default_directive: "info".to_string(),
                with_target: true,
            }
        }
    }

    impl TelemetryConfig {
        /// 创建新的配置
        pub fn new(service_name: impl Into<String>) -> Self {
            Self {
                service_name: service_name.into(),
                ..Default::default()
            }
        }

        /// 设置默认过滤指令
        pub fn with_default_directive(mut self, directive: impl Into<String>) -> Self {
            self.default_directive = directive.into();
            self
        }

        pub(crate) fn env_filter(&self) -> Result<EnvFilter, SeckillError> {
            match EnvFilter::try_from_default_env() {
                Ok(filter) => Ok(filter),
                Err(_) => EnvFilter::try_new(&self.default_directive).map_err(|e| {
                    SeckillError::ConfigError(format!(
                        "无效的日志过滤指令 {}: {}",
                        self.default_directive, e
                    ))
                }),
            }
        }
    }

    /// 初始化全局日志订阅者
    ///
    /// 进程内只能成功初始化一次，重复调用返回配置错误。
    pub fn init_tracing(config: &TelemetryConfig) -> Result<(), SeckillError> {
        let filter = config.env_filter()?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(config.with_target)
            .try_init()
            .map_err(|e| SeckillError::ConfigError(format!("初始化日志失败: {}", e)))?;

        info!("日志系统初始化完成: service={}", config.service_name);
        Ok(())
    }

}

#[cfg(feature = "monitoring")]
mod metrics {
    use prometheus::{
        Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
        TextEncoder,
    };
    use std::time::Duration;
    use tracing::error;

    use crate::error::CircuitState;
    use crate::model::OrderStatus;

    /// 监控指标
    #[derive(Clone)]
    pub struct Metrics {
        /// 预占成功次数
        pub reservations_granted: IntCounter,
        /// 预占失败次数（库存不足或未初始化）
        pub reservations_rejected: IntCounter,
        /// 库存回补次数
        pub stock_restores: IntCounter,
        /// 创建的订单数
        pub orders_created: IntCounter,
        /// 按状态统计的订单状态变更
        pub order_transitions: IntCounterVec,
        /// 限流放行次数
        pub rate_limit_allowed: IntCounter,
        /// 限流拒绝次数
        pub rate_limit_denied: IntCounter,
        /// 熔断拒绝次数（按服务）
        pub breaker_rejections: IntCounterVec,
        /// 熔断器状态（0=Closed, 1=HalfOpen, 2=Open）
        pub breaker_state: IntGaugeVec,
        /// 转发耗时分布
        pub forward_duration: Histogram,
        registry: Registry,
    }

    impl Metrics {
        /// 创建并注册所有指标
        pub fn new() -> Result<Self, prometheus::Error> {
            let registry = Registry::new();

            let reservations_granted = IntCounter::with_opts(Opts::new(
                "flashgate_reservations_granted_total",
                "Stock reservations granted",
            ))?;
            let reservations_rejected = IntCounter::with_opts(Opts::new(
                "flashgate_reservations_rejected_total",
                "Stock reservations rejected",
            ))?;
            let stock_restores = IntCounter::with_opts(Opts::new(
                "flashgate_stock_restores_total",
                "Compensating stock restores",
            ))?;
            let orders_created = IntCounter::with_opts(Opts::new(
                "flashgate_orders_created_total",
                "Seckill orders created",
            ))?;
            let order_transitions = IntCounterVec::new(
                Opts::new(
                    "flashgate_order_transitions_total",
                    "Seckill order status transitions",
                ),
                &["status"],
            )?;
            let rate_limit_allowed = IntCounter::with_opts(Opts::new(
                "flashgate_rate_limit_allowed_total",
                "Requests allowed by rate limiting",
            ))?;
            let rate_limit_denied = IntCounter::with_opts(Opts::new(
                "flashgate_rate_limit_denied_total",
                "Requests denied by rate limiting",
            ))?;
            let breaker_rejections = IntCounterVec::new(
                Opts::new(
                    "flashgate_breaker_rejections_total",
                    "Requests short-circuited by an open breaker",
                ),
                &["service"],
            )?;
            let breaker_state = IntGaugeVec::new(
                Opts::new(
                    "flashgate_breaker_state",
                    "Breaker state (0=closed, 1=half_open, 2=open)",
                ),
                &["service"],
            )?;
            let forward_duration = Histogram::with_opts(
                HistogramOpts::new(
                    "flashgate_forward_duration_seconds",
                    "Downstream forwarding latency",
                )
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            )?;

            registry.register(Box::new(reservations_granted.clone()))?;
            registry.register(Box::new(reservations_rejected.clone()))?;
            registry.register(Box::new(stock_restores.clone()))?;
            registry.register(Box::new(orders_created.clone()))?;
            registry.register(Box::new(order_transitions.clone()))?;
            registry.register(Box::new(rate_limit_allowed.clone()))?;
            registry.register(Box::new(rate_limit_denied.clone()))?;
            registry.register(Box::new(breaker_rejections.clone()))?;
            registry.register(Box::new(breaker_state.clone()))?;
            registry.register(Box::new(forward_duration.clone()))?;

            Ok(Self {
                reservations_granted,
                reservations_rejected,
                stock_restores,
                orders_created,
                order_transitions,
                rate_limit_allowed,
                rate_limit_denied,
                breaker_rejections,
                breaker_state,
                forward_duration,
                registry,
            })
        }

        /// 收集所有指标并返回Prometheus文本格式
        pub fn gather(&self) -> String {
            let encoder = TextEncoder::new();
            let metric_families = self.registry.gather();
            let mut buffer = Vec::new();
            if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                error!("Failed to encode metrics: {}", e);
                return String::new();
            }
            String::from_utf8(buffer).unwrap_or_default()
        }

        /// 记录一次预占
        pub fn record_reservation(&self, granted: bool) {
            if granted {
                self.reservations_granted.inc();
            } else {
                self.reservations_rejected.inc();
            }
        }

        /// 记录一次回补
        pub fn record_restore(&self) {
            self.stock_restores.inc();
        }

        /// 记录订单创建
        pub fn record_order_created(&self) {
            self.orders_created.inc();
        }

        /// 记录订单状态变更
        pub fn record_order_transition(&self, status: OrderStatus) {
            self.order_transitions
                .with_label_values(&[status.as_str()])
                .inc();
        }

        /// 记录限流结果
        pub fn record_rate_limit(&self, allowed: bool) {
            if allowed {
                self.rate_limit_allowed.inc();
            } else {
                self.rate_limit_denied.inc();
            }
        }

        /// 记录熔断拒绝
        pub fn record_breaker_rejection(&self, service: &str) {
            self.breaker_rejections.with_label_values(&[service]).inc();
        }

        /// 更新熔断器状态
        pub fn set_breaker_state(&self, service: &str, state: CircuitState) {
            let value = match state {
                CircuitState::Closed => 0,
                CircuitState::HalfOpen => 1,
                CircuitState::Open => 2,
            };
            self.breaker_state.with_label_values(&[service]).set(value);
        }

        /// 记录转发耗时
        pub fn observe_forward(&self, duration: Duration) {
            self.forward_duration.observe(duration.as_secs_f64());
        }
    }

}
