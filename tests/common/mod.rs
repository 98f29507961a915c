//! 测试通用工具模块
//!
//! 提供内存后端上的活动、服务与网关构造函数。

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use flashgate::{
    config::RateLimitRule,
    error::SeckillError,
    gateway::{Forwarder, GatewayRequest, GatewayResponse},
    governor::Governor,
    limiters::RateLimitAlgorithm,
    matchers::KeyStrategy,
    model::SeckillActivity,
    repository::{MemoryActivityCatalog, MemoryOrderRepository},
    seckill::SeckillService,
    storage::{CounterStore, MemoryCounterStore},
    ServiceInstance,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const ACTIVITY_ID: &str = "flash-001";

/// 创建进行中的活动
pub fn active_activity(id: &str, stock: u64) -> SeckillActivity {
    activity_starting_at(id, stock, Utc::now() - ChronoDuration::minutes(1))
}

/// 创建指定开始时间、持续一小时的活动
pub fn activity_starting_at(id: &str, stock: u64, start: DateTime<Utc>) -> SeckillActivity {
    SeckillActivity::new(
        id,
        "product-1",
        10_000,
        1_000,
        stock,
        start,
        start + ChronoDuration::hours(1),
    )
}

/// 内存后端上的秒杀服务
pub struct Fixture {
    pub store: Arc<MemoryCounterStore>,
    pub orders: Arc<MemoryOrderRepository>,
    pub catalog: Arc<MemoryActivityCatalog>,
    pub service: Arc<SeckillService>,
}

/// 创建服务并预热活动库存
pub async fn setup_service(activity: SeckillActivity) -> Fixture {
    setup_with(activity, |service| service).await
}

/// 创建服务，构造后可以再调整服务
pub async fn setup_with(
    activity: SeckillActivity,
    customize: impl FnOnce(SeckillService) -> SeckillService,
) -> Fixture {
    let store = Arc::new(MemoryCounterStore::new());
    let orders = Arc::new(MemoryOrderRepository::new());
    let catalog = Arc::new(MemoryActivityCatalog::new());
    let activity_id = activity.id.clone();
    catalog.upsert(activity);

    let service = customize(SeckillService::new(
        store.clone(),
        orders.clone(),
        catalog.clone(),
    ));
    service.warm_up(&activity_id).await.unwrap();

    Fixture {
        store,
        orders,
        catalog,
        service: Arc::new(service),
    }
}

/// 创建滑动窗口规则
pub fn sliding_window_rule(id: &str, path: &str, limit: u64, window: &str) -> RateLimitRule {
    RateLimitRule {
        id: id.to_string(),
        path_pattern: path.to_string(),
        methods: vec![],
        algorithm: RateLimitAlgorithm::SlidingWindow,
        strategy: KeyStrategy::PerUser,
        rate: limit,
        capacity: 0,
        window: window.to_string(),
        enabled: true,
    }
}

/// 创建令牌桶规则
pub fn token_bucket_rule(id: &str, path: &str, rate: u64, capacity: u64) -> RateLimitRule {
    RateLimitRule {
        id: id.to_string(),
        path_pattern: path.to_string(),
        methods: vec![],
        algorithm: RateLimitAlgorithm::TokenBucket,
        strategy: KeyStrategy::PerUser,
        rate,
        capacity,
        window: "60s".to_string(),
        enabled: true,
    }
}

/// 在新的内存存储上创建限流器
pub fn create_governor(rules: &[RateLimitRule]) -> Governor {
    let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());
    Governor::new(store, rules).unwrap()
}

/// 按脚本返回结果的转发器
#[derive(Default)]
pub struct ScriptedForwarder {
    script: parking_lot::Mutex<VecDeque<Result<u16, String>>>,
    calls: AtomicU64,
}

impl ScriptedForwarder {
    /// 依次返回给定的结果，脚本用完后返回 200
    pub fn new(script: Vec<Result<u16, String>>) -> Self {
        Self {
            script: parking_lot::Mutex::new(script.into()),
            calls: AtomicU64::new(0),
        }
    }

    /// 累计转发次数
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Forwarder for ScriptedForwarder {
    async fn forward(
        &self,
        instance: &ServiceInstance,
        _request: &GatewayRequest,
    ) -> Result<GatewayResponse, SeckillError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().pop_front() {
            Some(Ok(status)) => Ok(GatewayResponse::new(status).with_body(instance.id.clone())),
            Some(Err(message)) => Err(SeckillError::ServiceUnavailable(message)),
            None => Ok(GatewayResponse::new(200).with_body(instance.id.clone())),
        }
    }
}
