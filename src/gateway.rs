//! 请求准入网关
//!
//! 处理顺序：限流 → 路由解析 → 熔断检查 → 服务发现 → 负载均衡 → 转发 → 记录结果。
//! 被限流或被熔断的请求不会触发服务发现和下游调用。

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, trace, warn};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::{GatewaySettings, RouteConfig};
use crate::constants::DEFAULT_FORWARD_TIMEOUT_SECS;
use crate::discovery::{ServiceDiscovery, ServiceInstance};
use crate::error::{RateLimitDecision, SeckillError};
use crate::governor::Governor;
use crate::load_balancer::{LoadBalancer, RoundRobinBalancer};
use crate::matchers::{PathPattern, RequestContext};
#[cfg(feature = "monitoring")]
use crate::telemetry::Metrics;

/// 网关请求
#[derive(Debug, Clone, Default)]
pub struct GatewayRequest {
    /// 请求上下文（方法、路径、头、身份）
    pub context: RequestContext,
    /// 请求体
    pub body: Vec<u8>,
}

impl GatewayRequest {
    /// 创建请求
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            context: RequestContext::new(method, path),
            body: Vec::new(),
        }
    }

    /// 添加HTTP头
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.context = self.context.with_header(key, value);
        self
    }

    /// 设置已认证用户
    pub fn with_user(mut self, user_id: &str) -> Self {
        self.context = self.context.with_user(user_id);
        self
    }

    /// 设置客户端IP
    pub fn with_client_ip(mut self, ip: &str) -> Self {
        self.context = self.context.with_client_ip(ip);
        self
    }

    /// 设置请求体
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// 请求路径
    pub fn path(&self) -> &str {
        &self.context.path
    }

    /// 请求方法
    pub fn method(&self) -> &str {
        &self.context.method
    }
}

/// 网关响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponse {
    /// 状态码
    pub status: u16,
    /// 响应头
    pub headers: Vec<(String, String)>,
    /// 响应体
    pub body: Vec<u8>,
}

impl GatewayResponse {
    /// 创建响应
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// 设置响应体
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// 是否为 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 按名称查找响应头（不区分大小写）
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// 请求转发 trait
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// 把请求转发到指定实例
    async fn forward(
        &self,
        instance: &ServiceInstance,
        request: &GatewayRequest,
    ) -> Result<GatewayResponse, SeckillError>;
}

/// 转发结果分类，决定熔断器记录成功还是失败
pub trait ResponseClassifier: Send + Sync {
    /// 结果是否计为失败
    fn is_failure(&self, outcome: &Result<GatewayResponse, SeckillError>) -> bool;
}

/// 转发错误和所有非 2xx 响应都计为失败（默认）
#[derive(Debug, Clone, Copy, Default)]
pub struct NonSuccessIsFailure;

impl ResponseClassifier for NonSuccessIsFailure {
    fn is_failure(&self, outcome: &Result<GatewayResponse, SeckillError>) -> bool {
        match outcome {
            Ok(response) => !response.is_success(),
            Err(_) => true,
        }
    }
}

/// 只有转发错误和 5xx 响应计为失败
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerErrorIsFailure;

impl ResponseClassifier for ServerErrorIsFailure {
    fn is_failure(&self, outcome: &Result<GatewayResponse, SeckillError>) -> bool {
        match outcome {
            Ok(response) => response.status >= 500,
            Err(_) => true,
        }
    }
}

/// 路径前缀到服务名的映射，最长前缀优先
#[derive(Debug, Clone)]
pub struct ServiceRouter {
    routes: Vec<(PathPattern, usize, String)>,
}

impl ServiceRouter {
    /// 根据路由配置创建
    pub fn new(routes: &[RouteConfig]) -> Result<Self, SeckillError> {
        let mut compiled = Vec::with_capacity(routes.len());
        for route in routes {
            route.validate().map_err(SeckillError::ConfigError)?;
            let prefix = route.prefix.trim_end_matches('/');
            let pattern = if prefix.is_empty() {
                PathPattern::Any
            } else {
                PathPattern::Prefix(prefix.to_string())
            };
            compiled.push((pattern, prefix.len(), route.service.clone()));
        }
        compiled.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(Self { routes: compiled })
    }

    /// 解析路径对应的服务名
    pub fn resolve(&self, path: &str) -> Option<&str> {
        self.routes
            .iter()
            .find(|(pattern, _, _)| pattern.matches(path))
            .map(|(_, _, service)| service.as_str())
    }
}

/// 请求准入网关
pub struct Gateway {
    router: ServiceRouter,
    governor: Option<Arc<Governor>>,
    breakers: Arc<CircuitBreakerRegistry>,
    discovery: Arc<dyn ServiceDiscovery>,
    balancer: Arc<dyn LoadBalancer>,
    forwarder: Arc<dyn Forwarder>,
    classifier: Arc<dyn ResponseClassifier>,
    forward_timeout: Duration,
    #[cfg(feature = "monitoring")]
    metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("router", &self.router)
            .field("governor", &self.governor)
            .field("forward_timeout", &self.forward_timeout)
            .finish()
    }
}

impl Gateway {
    /// 创建网关，默认使用轮询负载均衡和 [`NonSuccessIsFailure`] 分类
    pub fn new(
        routes: &[RouteConfig],
        breakers: Arc<CircuitBreakerRegistry>,
        discovery: Arc<dyn ServiceDiscovery>,
        forwarder: Arc<dyn Forwarder>,
    ) -> Result<Self, SeckillError> {
        Ok(Self {
            router: ServiceRouter::new(routes)?,
            governor: None,
            breakers,
            discovery,
            balancer: Arc::new(RoundRobinBalancer::new()),
            forwarder,
            classifier: Arc::new(NonSuccessIsFailure),
            forward_timeout: Duration::from_secs(DEFAULT_FORWARD_TIMEOUT_SECS),
            #[cfg(feature = "monitoring")]
            metrics: None,
        })
    }

    /// 设置单次转发超时
    pub fn with_forward_timeout(mut self, timeout: Duration) -> Self {
        self.forward_timeout = timeout;
        self
    }

    /// 应用 `gateway` 配置段
    pub fn with_settings(self, settings: &GatewaySettings) -> Result<Self, SeckillError> {
        Ok(self.with_forward_timeout(settings.forward_timeout()?))
    }

    /// 单次转发超时
    pub fn forward_timeout(&self) -> Duration {
        self.forward_timeout
    }

    /// 启用限流
    pub fn with_governor(mut self, governor: Arc<Governor>) -> Self {
        self.governor = Some(governor);
        self
    }

    /// 替换负载均衡策略
    pub fn with_balancer(mut self, balancer: Arc<dyn LoadBalancer>) -> Self {
        self.balancer = balancer;
        self
    }

    /// 替换结果分类器
    pub fn with_classifier(mut self, classifier: Arc<dyn ResponseClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// 记录监控指标
    #[cfg(feature = "monitoring")]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// 熔断器注册表
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    async fn check_rate_limit(
        &self,
        request: &GatewayRequest,
    ) -> Result<RateLimitDecision, SeckillError> {
        let Some(governor) = &self.governor else {
            return Ok(RateLimitDecision::unlimited());
        };

        let decision = governor.check_request(&request.context).await?;

        #[cfg(feature = "monitoring")]
        if let Some(metrics) = &self.metrics {
            if decision.is_limited() {
                metrics.record_rate_limit(decision.allowed);
            }
        }

        decision.into_result()
    }

    /// 路由一个请求
    #[instrument(skip(self, request), fields(method = %request.method(), path = %request.path()))]
    pub async fn route_request(
        &self,
        request: &GatewayRequest,
    ) -> Result<GatewayResponse, SeckillError> {
        let decision = self.check_rate_limit(request).await?;

        let service = self.router.resolve(request.path()).ok_or_else(|| {
            SeckillError::NotFound(format!("service not found: {}", request.path()))
        })?;

        let breaker = self.breakers.get_or_create(service);
        if breaker.is_open() {
            debug!("熔断器打开，拒绝请求: service={}", service);
            #[cfg(feature = "monitoring")]
            if let Some(metrics) = &self.metrics {
                metrics.record_breaker_rejection(service);
            }
            return Err(SeckillError::ServiceUnavailable(format!(
                "{} 熔断中",
                service
            )));
        }

        let instances = self.discovery.discover(service).await?;
        let instance = self.balancer.select(service, &instances).ok_or_else(|| {
            warn!("没有健康的服务实例: service={}", service);
            SeckillError::ServiceUnavailable(format!("{} 没有健康实例", service))
        })?;

        trace!("转发请求: service={}, instance={}", service, instance.id);
        let started = Instant::now();
        let outcome = match tokio::time::timeout(
            self.forward_timeout,
            self.forwarder.forward(instance, request),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    "转发超时: service={}, instance={}, timeout={:?}",
                    service, instance.id, self.forward_timeout
                );
                breaker.record_failure();
                return Err(SeckillError::ServiceUnavailable(format!(
                    "{} 响应超时",
                    service
                )));
            }
        };
        let elapsed = started.elapsed();

        if self.classifier.is_failure(&outcome) {
            match &outcome {
                Ok(response) => debug!(
                    "下游返回失败响应: service={}, status={}",
                    service, response.status
                ),
                Err(e) => debug!("下游调用失败: service={}, 错误: {}", service, e),
            }
            breaker.record_failure();
        } else {
            breaker.record_success();
        }

        #[cfg(feature = "monitoring")]
        if let Some(metrics) = &self.metrics {
            metrics.observe_forward(elapsed);
            metrics.set_breaker_state(service, breaker.state());
        }
        trace!("转发耗时: service={}, {:?}", service, elapsed);

        let mut response = outcome?;
        response.headers.extend(decision.headers());
        Ok(response)
    }
}
