//! 秒杀场景模拟
//!
//! 在内存后端上搭建完整管线：限流 + 库存预扣 + 参与去重 + 订单状态机 + 过期扫描，
//! 再通过网关对一个不稳定的下游触发熔断。

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use flashgate::prelude::*;
use flashgate::{
    init_tracing, CircuitState, Forwarder, OrderSweeper, ServiceDiscovery, ServiceInstance,
    TelemetryConfig,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CONFIG: &str = r#"
version: "1.0"
rate_limit:
  - id: seckill_order
    path_pattern: /api/seckill/*
    methods: [POST]
    algorithm: token_bucket
    strategy: per_user
    rate: 1
    capacity: 3
breakers:
  default:
    failure_threshold: 3
    success_threshold: 1
    recovery_timeout: 200ms
routes:
  - prefix: /api/inventory
    service: inventory-service
seckill:
  payment_timeout: 1s
  sweep_interval: 100ms
"#;

const BUYERS: usize = 200;
const TOTAL_STOCK: u64 = 50;

/// 前几次调用失败的下游
struct FlakyForwarder {
    calls: AtomicU64,
    failures: u64,
}

#[async_trait]
impl Forwarder for FlakyForwarder {
    async fn forward(
        &self,
        instance: &ServiceInstance,
        _request: &GatewayRequest,
    ) -> Result<GatewayResponse, SeckillError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let status = if call < self.failures { 503 } else { 200 };
        Ok(GatewayResponse::new(status).with_body(instance.id.clone()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(&TelemetryConfig::new("flash-sale-simulation").with_default_directive("warn"))?;

    let config = FlashgateConfig::from_yaml_str(CONFIG).context("加载配置失败")?;
    let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());
    let orders = Arc::new(MemoryOrderRepository::new());
    let catalog = Arc::new(MemoryActivityCatalog::new());

    let now = Utc::now();
    catalog.upsert(
        SeckillActivity::new(
            "flash-001",
            "phone-x",
            599_900,
            99_900,
            TOTAL_STOCK,
            now - ChronoDuration::seconds(1),
            now + ChronoDuration::minutes(10),
        )
        .with_limit_per_user(1),
    );

    let governor = Arc::new(Governor::new(store.clone(), &config.rate_limit)?);
    let service = Arc::new(
        SeckillService::from_settings(store, orders.clone(), catalog, &config.seckill)?
            .with_rate_limit(governor.clone(), "seckill_order"),
    );
    service.warm_up("flash-001").await?;

    println!("=== 秒杀模拟: {} 人抢 {} 件 ===", BUYERS, TOTAL_STOCK);
    let (won, sold_out, rejected) = run_flash_sale(&service).await;
    let remaining = service.stock().remaining("flash-001").await?;
    println!("成功下单: {}", won.len());
    println!("库存不足: {}", sold_out);
    println!("其他拒绝: {}", rejected);
    println!("剩余库存: {:?}", remaining);

    // 一半订单支付，其余取消或等待过期
    let (to_pay, rest) = won.split_at(won.len() / 2);
    for order in to_pay {
        service.pay_order(order.id).await?;
    }
    if let Some(order) = rest.first() {
        service.cancel_order(order.id).await?;
    }
    println!(
        "支付 {} 单, 取消 1 单, 剩余库存: {:?}",
        to_pay.len(),
        service.stock().remaining("flash-001").await?
    );

    let sweeper =
        OrderSweeper::new(service.clone()).with_batch_size(config.seckill.sweep_batch_size);
    let handle = sweeper.start(config.seckill.sweep_interval()?);
    tokio::time::sleep(service.payment_timeout() + Duration::from_millis(500)).await;
    handle.shutdown().await?;

    println!(
        "过期扫描后: PAID={}, CANCELLED={}, EXPIRED={}, 剩余库存: {:?}",
        orders.count_by_status("flash-001", OrderStatus::Paid),
        orders.count_by_status("flash-001", OrderStatus::Cancelled),
        orders.count_by_status("flash-001", OrderStatus::Expired),
        service.stock().remaining("flash-001").await?
    );

    run_gateway(&config).await?;
    Ok(())
}

async fn run_flash_sale(service: &Arc<SeckillService>) -> (Vec<SeckillOrder>, usize, usize) {
    let mut handles = Vec::with_capacity(BUYERS);
    for i in 0..BUYERS {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service
                .process_seckill_order(&format!("user-{}", i), "flash-001", 1)
                .await
        }));
    }

    let mut won = Vec::new();
    let mut sold_out = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await {
            Ok(Ok(order)) => won.push(order),
            Ok(Err(SeckillError::InsufficientStock { .. })) => sold_out += 1,
            Ok(Err(e)) => {
                tracing::debug!("下单被拒绝: {}", e.public_message());
                rejected += 1;
            }
            Err(e) => {
                tracing::error!("下单任务失败: {}", e);
                rejected += 1;
            }
        }
    }
    (won, sold_out, rejected)
}

async fn run_gateway(config: &FlashgateConfig) -> anyhow::Result<()> {
    println!("\n=== 网关熔断演示 ===");

    let discovery = Arc::new(MemoryServiceRegistry::new(config.gateway.heartbeat_ttl()?));
    discovery
        .register(ServiceInstance::new(
            "inv-1",
            "inventory-service",
            "http://10.0.0.1:8080",
        ))
        .await?;

    let breakers = Arc::new(CircuitBreakerRegistry::from_settings(&config.breakers)?);
    let forwarder = Arc::new(FlakyForwarder {
        calls: AtomicU64::new(0),
        failures: 3,
    });
    let gateway = Gateway::new(&config.routes, breakers.clone(), discovery, forwarder)?
        .with_settings(&config.gateway)?;
    let request = GatewayRequest::new("GET", "/api/inventory/phone-x");

    for attempt in 1..=5 {
        match gateway.route_request(&request).await {
            Ok(response) => println!("请求 {}: 状态 {}", attempt, response.status),
            Err(e) => println!("请求 {}: {}", attempt, e),
        }
    }

    let breaker = breakers.get_or_create("inventory-service");
    println!("熔断器状态: {}", breaker.state().as_str());

    tokio::time::sleep(breaker.config().recovery_timeout + Duration::from_millis(50)).await;
    let response = gateway.route_request(&request).await?;
    println!("恢复后请求: 状态 {}", response.status);
    if breaker.state() == CircuitState::Closed {
        println!("熔断器已恢复");
    }
    Ok(())
}
