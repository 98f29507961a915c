//! 服务发现
//!
//! 网关通过 [`ServiceDiscovery`] 解析某个逻辑服务当前健康的实例。
//! 内存实现以心跳判断健康：最近一次心跳在 TTL 内的实例才会被返回。

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

use crate::constants::DEFAULT_HEARTBEAT_TTL_SECS;
use crate::error::SeckillError;

/// 服务实例
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// 实例ID，同一服务内唯一
    pub id: String,
    /// 所属服务名
    pub service: String,
    /// 访问地址，例如 `http://10.0.0.1:8080`
    pub address: String,
    /// 元数据（版本、区域等）
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ServiceInstance {
    /// 创建实例
    pub fn new(
        id: impl Into<String>,
        service: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            service: service.into(),
            address: address.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// 附加元数据
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// 服务发现 trait
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// 返回服务的健康实例
    async fn discover(&self, service: &str) -> Result<Vec<ServiceInstance>, SeckillError>;

    /// 注册实例（重复注册视为一次心跳并更新地址）
    async fn register(&self, instance: ServiceInstance) -> Result<(), SeckillError>;

    /// 实例心跳
    async fn heartbeat(&self, service: &str, instance_id: &str) -> Result<(), SeckillError>;

    /// 注销实例，返回实例是否存在
    async fn deregister(&self, service: &str, instance_id: &str) -> Result<bool, SeckillError>;
}

#[derive(Debug, Clone)]
struct Registration {
    instance: ServiceInstance,
    last_heartbeat: Instant,
}

/// 基于心跳的内存服务注册表
#[derive(Debug)]
pub struct MemoryServiceRegistry {
    services: DashMap<String, Vec<Registration>>,
    heartbeat_ttl: Duration,
}

impl Default for MemoryServiceRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_HEARTBEAT_TTL_SECS))
    }
}

impl MemoryServiceRegistry {
    /// 创建注册表
    pub fn new(heartbeat_ttl: Duration) -> Self {
        Self {
            services: DashMap::new(),
            heartbeat_ttl,
        }
    }

    /// 心跳TTL
    pub fn heartbeat_ttl(&self) -> Duration {
        self.heartbeat_ttl
    }

    /// 注册实例（指定当前时间）
    pub fn register_at(&self, instance: ServiceInstance, now: Instant) {
        let mut entries = self.services.entry(instance.service.clone()).or_default();
        match entries.iter_mut().find(|r| r.instance.id == instance.id) {
            Some(existing) => {
                existing.instance = instance;
                existing.last_heartbeat = now;
            }
            None => {
                info!(
                    "注册服务实例: service={}, id={}, address={}",
                    instance.service, instance.id, instance.address
                );
                entries.push(Registration {
                    instance,
                    last_heartbeat: now,
                });
            }
        }
    }

    /// 实例心跳（指定当前时间）
    pub fn heartbeat_at(
        &self,
        service: &str,
        instance_id: &str,
        now: Instant,
    ) -> Result<(), SeckillError> {
        let mut entries = self
            .services
            .get_mut(service)
            .ok_or_else(|| SeckillError::NotFound(format!("服务 {}", service)))?;

        let registration = entries
            .iter_mut()
            .find(|r| r.instance.id == instance_id)
            .ok_or_else(|| {
                SeckillError::NotFound(format!("服务实例 {}/{}", service, instance_id))
            })?;

        registration.last_heartbeat = now;
        trace!("实例心跳: service={}, id={}", service, instance_id);
        Ok(())
    }

    /// 健康实例（指定当前时间）
    pub fn discover_at(&self, service: &str, now: Instant) -> Vec<ServiceInstance> {
        let Some(entries) = self.services.get(service) else {
            return Vec::new();
        };

        let healthy: Vec<ServiceInstance> = entries
            .iter()
            .filter(|r| now.saturating_duration_since(r.last_heartbeat) <= self.heartbeat_ttl)
            .map(|r| r.instance.clone())
            .collect();

        if healthy.len() < entries.len() {
            debug!(
                "服务 {} 有 {} 个实例心跳超时",
                service,
                entries.len() - healthy.len()
            );
        }
        healthy
    }

    /// 移除心跳超时的实例，返回移除数量
    pub fn prune_unhealthy(&self, now: Instant) -> usize {
        let mut removed = 0;
        for mut entry in self.services.iter_mut() {
            let before = entry.len();
            entry.retain(|r| now.saturating_duration_since(r.last_heartbeat) <= self.heartbeat_ttl);
            removed += before - entry.len();
        }
        self.services.retain(|_, entries| !entries.is_empty());
        if removed > 0 {
            info!("移除心跳超时的服务实例: {}", removed);
        }
        removed
    }
}

#[async_trait]
impl ServiceDiscovery for MemoryServiceRegistry {
    async fn discover(&self, service: &str) -> Result<Vec<ServiceInstance>, SeckillError> {
        Ok(self.discover_at(service, Instant::now()))
    }

    async fn register(&self, instance: ServiceInstance) -> Result<(), SeckillError> {
        if instance.id.is_empty() || instance.service.is_empty() {
            return Err(SeckillError::ValidationError(
                "实例ID和服务名不能为空".to_string(),
            ));
        }
        self.register_at(instance, Instant::now());
        Ok(())
    }

    async fn heartbeat(&self, service: &str, instance_id: &str) -> Result<(), SeckillError> {
        self.heartbeat_at(service, instance_id, Instant::now())
    }

    async fn deregister(&self, service: &str, instance_id: &str) -> Result<bool, SeckillError> {
        let Some(mut entries) = self.services.get_mut(service) else {
            return Ok(false);
        };
        let before = entries.len();
        entries.retain(|r| r.instance.id != instance_id);
        let removed = entries.len() < before;
        if removed {
            info!("注销服务实例: service={}, id={}", service, instance_id);
        }
        Ok(removed)
    }
}
