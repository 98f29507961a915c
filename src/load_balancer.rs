//! 负载均衡
//!
//! 从服务发现返回的健康实例中选择一个转发目标。

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::discovery::ServiceInstance;

/// 负载均衡 trait
pub trait LoadBalancer: Send + Sync {
    /// 从实例列表中选择一个，列表为空时返回 `None`
    fn select<'a>(&self, service: &str, instances: &'a [ServiceInstance])
        -> Option<&'a ServiceInstance>;
}

/// 轮询负载均衡，每个服务一个独立游标
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    cursors: DashMap<String, AtomicUsize>,
}

impl RoundRobinBalancer {
    /// 创建轮询负载均衡器
    pub fn new() -> Self {
        Self::default()
    }

    fn next_index(&self, service: &str) -> usize {
        if let Some(cursor) = self.cursors.get(service) {
            return cursor.fetch_add(1, Ordering::Relaxed);
        }
        self.cursors
            .entry(service.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn select<'a>(
        &self,
        service: &str,
        instances: &'a [ServiceInstance],
    ) -> Option<&'a ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        let index = self.next_index(service) % instances.len();
        instances.get(index)
    }
}
