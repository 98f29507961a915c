//! Redis集成测试
//!
//! 需要本地 Redis 服务：`cargo test --features redis -- --ignored`

use crate::common::*;
use flashgate::{
    limiters::{Limiter, SlidingWindowLimiter},
    redis_storage::{RedisConfig, RedisCounterStore},
    repository::{MemoryActivityCatalog, MemoryOrderRepository},
    seckill::SeckillService,
    stock::{ReserveOutcome, StockReservation},
    storage::{CounterStore, DecrementOutcome},
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

async fn connect() -> Arc<RedisCounterStore> {
    let config = RedisConfig::new("redis://localhost:6379").io_timeout(Duration::from_secs(2));
    Arc::new(RedisCounterStore::new(config).await.unwrap())
}

fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

/// 测试Redis连接
#[tokio::test]
#[ignore] // 需要Redis服务器运行
async fn test_redis_connection() {
    let store = connect().await;
    assert!(store.ping().await.is_ok());
}

/// 测试原子扣减
#[tokio::test]
#[ignore]
async fn test_redis_try_decrement() {
    let store = connect().await;
    let key = unique("test:stock");

    assert_eq!(
        store.try_decrement(&key, 1).await.unwrap(),
        DecrementOutcome::Missing
    );

    store.set(&key, 2, Some(Duration::from_secs(60))).await.unwrap();
    assert_eq!(
        store.try_decrement(&key, 2).await.unwrap(),
        DecrementOutcome::Granted { remaining: 0 }
    );
    assert_eq!(
        store.try_decrement(&key, 1).await.unwrap(),
        DecrementOutcome::Insufficient { available: 0 }
    );

    // 只对已存在的键回补
    assert_eq!(store.increment_existing(&key, 1).await.unwrap(), Some(1));
    store.delete(&key).await.unwrap();
    assert_eq!(store.increment_existing(&key, 1).await.unwrap(), None);
}

/// 测试并发预扣不超卖
#[tokio::test]
#[ignore]
async fn test_redis_concurrent_reserve() {
    let store = connect().await;
    let stock = StockReservation::new(store);
    let activity = active_activity(&unique("redis-flash"), 20);
    stock.initialize(&activity).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..100 {
        let stock = stock.clone();
        let id = activity.id.clone();
        handles.push(tokio::spawn(async move { stock.reserve(&id, 1).await }));
    }

    let mut granted = 0;
    for handle in handles {
        if let ReserveOutcome::Granted { .. } = handle.await.unwrap().unwrap() {
            granted += 1;
        }
    }
    assert_eq!(granted, 20);
    assert_eq!(stock.remaining(&activity.id).await.unwrap(), Some(0));
}

/// 测试滑动窗口边界
#[tokio::test]
#[ignore]
async fn test_redis_sliding_window() {
    let store = connect().await;
    let limiter = SlidingWindowLimiter::new(store, Duration::from_secs(60), 5);
    let key = unique("ratelimit:user:u1:orders");

    for _ in 0..5 {
        assert!(limiter.admit(&key, 0).await.unwrap().allowed);
    }
    assert!(!limiter.admit(&key, 1_000).await.unwrap().allowed);
    assert!(limiter.admit(&key, 61_000).await.unwrap().allowed);
}

/// 测试Redis上的完整下单流程
#[tokio::test]
#[ignore]
async fn test_redis_seckill_flow() {
    let store = connect().await;
    let catalog = Arc::new(MemoryActivityCatalog::new());
    let activity = active_activity(&unique("redis-flow"), 2);
    let activity_id = activity.id.clone();
    catalog.upsert(activity);

    let service = SeckillService::new(store, Arc::new(MemoryOrderRepository::new()), catalog);
    service.warm_up(&activity_id).await.unwrap();

    let order = service
        .process_seckill_order("user-1", &activity_id, 1)
        .await
        .unwrap();
    assert!(service
        .process_seckill_order("user-1", &activity_id, 1)
        .await
        .is_err());

    service.cancel_order(order.id).await.unwrap();
    assert_eq!(
        service.stock().remaining(&activity_id).await.unwrap(),
        Some(2)
    );
}
