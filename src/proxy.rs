//! HTTP 转发
//!
//! 基于 `reqwest` 的 [`Forwarder`] 实现。每次转发都带有请求超时，
//! 超时和连接失败映射为服务不可用，由网关计入熔断器失败。

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::GatewaySettings;
use crate::constants::DEFAULT_FORWARD_TIMEOUT_SECS;
use crate::discovery::ServiceInstance;
use crate::error::SeckillError;
use crate::gateway::{Forwarder, GatewayRequest, GatewayResponse};

/// 不转发的逐跳头
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name) || name == "host"
}

/// 拼接实例地址与请求路径
pub fn target_url(instance: &ServiceInstance, path: &str) -> String {
    let base = instance.address.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

/// HTTP 转发器
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpForwarder {
    /// 使用默认超时创建
    pub fn new() -> Result<Self, SeckillError> {
        Self::with_timeout(Duration::from_secs(DEFAULT_FORWARD_TIMEOUT_SECS))
    }

    /// 指定请求超时创建
    pub fn with_timeout(timeout: Duration) -> Result<Self, SeckillError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| SeckillError::ConfigError(format!("创建HTTP客户端失败: {}", e)))?;
        Ok(Self { client, timeout })
    }

    /// 按 `gateway.forward_timeout` 创建
    pub fn from_settings(settings: &GatewaySettings) -> Result<Self, SeckillError> {
        Self::with_timeout(settings.forward_timeout()?)
    }

    /// 请求超时
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn outbound_headers(request: &GatewayRequest) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in &request.context.headers {
            if is_hop_by_hop(name) {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => debug!("跳过无效的请求头: {}", name),
            }
        }
        headers
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(
        &self,
        instance: &ServiceInstance,
        request: &GatewayRequest,
    ) -> Result<GatewayResponse, SeckillError> {
        let method = Method::from_bytes(request.method().as_bytes()).map_err(|_| {
            SeckillError::ValidationError(format!("无效的HTTP方法: {}", request.method()))
        })?;
        let url = target_url(instance, request.path());

        let response = self
            .client
            .request(method, &url)
            .headers(Self::outbound_headers(request))
            .body(request.body.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                warn!("转发失败: url={}, 错误: {}", url, e);
                SeckillError::ServiceUnavailable(format!("{} 请求失败", instance.service))
            })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(|e| {
            warn!("读取下游响应失败: url={}, 错误: {}", url, e);
            SeckillError::ServiceUnavailable(format!("{} 响应读取失败", instance.service))
        })?;

        Ok(GatewayResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}
