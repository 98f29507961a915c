//! 端到端测试：秒杀下单
//!
//! 测试场景：
//! - 并发抢购不超卖
//! - 同一用户并发下单只成功一单
//! - 持久化失败时库存回补
//! - 取消后库存可被其他用户购买

use crate::common::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flashgate::{
    error::{SeckillError, StorageError},
    model::{OrderStatus, SeckillOrder},
    repository::{MemoryActivityCatalog, MemoryOrderRepository, OrderRepository},
    seckill::SeckillService,
    stock::ReserveOutcome,
    storage::MemoryCounterStore,
};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

#[tokio::test]
async fn test_concurrent_buyers_never_oversell() {
    let fixture = setup_service(active_activity(ACTIVITY_ID, 50)).await;

    let mut handles = Vec::new();
    for i in 0..200 {
        let service = fixture.service.clone();
        handles.push(tokio::spawn(async move {
            service
                .process_seckill_order(&format!("user-{}", i), ACTIVITY_ID, 1)
                .await
        }));
    }

    let mut won = 0;
    let mut sold_out = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(order) => {
                assert_eq!(order.status, OrderStatus::Pending);
                won += 1;
            }
            Err(SeckillError::InsufficientStock { .. }) => sold_out += 1,
            Err(e) => panic!("意外错误: {}", e),
        }
    }

    assert_eq!(won, 50);
    assert_eq!(sold_out, 150);
    assert_eq!(
        fixture.service.stock().remaining(ACTIVITY_ID).await.unwrap(),
        Some(0)
    );
    assert_eq!(
        fixture
            .orders
            .count_by_status(ACTIVITY_ID, OrderStatus::Pending),
        50
    );
}

#[tokio::test]
async fn test_same_user_concurrent_orders_admit_one() {
    let fixture = setup_service(active_activity(ACTIVITY_ID, 10)).await;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let service = fixture.service.clone();
        handles.push(tokio::spawn(async move {
            service.process_seckill_order("user-1", ACTIVITY_ID, 1).await
        }));
    }

    let mut won = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => won += 1,
            Err(SeckillError::AlreadyParticipated { .. })
            | Err(SeckillError::InsufficientStock { .. }) => {}
            Err(e) => panic!("意外错误: {}", e),
        }
    }

    assert_eq!(won, 1);
    assert_eq!(fixture.orders.len(), 1);
    // 重复的预扣全部回补
    assert_eq!(
        fixture.service.stock().remaining(ACTIVITY_ID).await.unwrap(),
        Some(9)
    );
}

#[tokio::test]
async fn test_two_units_three_buyers_then_cancel() {
    let fixture = setup_service(active_activity(ACTIVITY_ID, 2)).await;
    let service = &fixture.service;

    let first = service
        .process_seckill_order("user-1", ACTIVITY_ID, 1)
        .await
        .unwrap();
    service
        .process_seckill_order("user-2", ACTIVITY_ID, 1)
        .await
        .unwrap();

    let third = service.process_seckill_order("user-3", ACTIVITY_ID, 1).await;
    assert!(matches!(
        third,
        Err(SeckillError::InsufficientStock {
            requested: 1,
            available: 0
        })
    ));

    let cancelled = service.cancel_order(first.id).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert!(cancelled.closed_at.is_some());
    assert_eq!(service.stock().remaining(ACTIVITY_ID).await.unwrap(), Some(1));

    let fourth = service
        .process_seckill_order("user-4", ACTIVITY_ID, 1)
        .await
        .unwrap();
    assert_eq!(fourth.user_id, "user-4");
    assert_eq!(service.stock().remaining(ACTIVITY_ID).await.unwrap(), Some(0));

    // 取消过的用户仍然算已参与
    let again = service.process_seckill_order("user-1", ACTIVITY_ID, 1).await;
    assert!(matches!(again, Err(SeckillError::AlreadyParticipated { .. })));
}

#[tokio::test]
async fn test_cancel_twice_restores_once() {
    let fixture = setup_service(active_activity(ACTIVITY_ID, 3).with_limit_per_user(2)).await;
    let service = &fixture.service;

    let order = service
        .process_seckill_order("user-1", ACTIVITY_ID, 2)
        .await
        .unwrap();
    assert_eq!(service.stock().remaining(ACTIVITY_ID).await.unwrap(), Some(1));

    service.cancel_order(order.id).await.unwrap();
    let second = service.cancel_order(order.id).await;
    assert!(matches!(second, Err(SeckillError::ValidationError(_))));
    assert!(!service.expire_order(order.id).await.unwrap());

    assert_eq!(service.stock().remaining(ACTIVITY_ID).await.unwrap(), Some(3));
}

#[tokio::test]
async fn test_paid_order_cannot_be_cancelled() {
    let fixture = setup_service(active_activity(ACTIVITY_ID, 3)).await;
    let service = &fixture.service;

    let order = service
        .process_seckill_order("user-1", ACTIVITY_ID, 1)
        .await
        .unwrap();
    let paid = service.pay_order(order.id).await.unwrap();
    assert_eq!(paid.status, OrderStatus::Paid);
    assert!(paid.paid_at.is_some());

    assert!(service.cancel_order(order.id).await.is_err());
    assert_eq!(service.stock().remaining(ACTIVITY_ID).await.unwrap(), Some(2));
    assert_eq!(
        service.get_order(order.id).await.unwrap().status,
        OrderStatus::Paid
    );
}

/// 保存订单总是失败的仓库
struct FailingSaveRepository {
    inner: MemoryOrderRepository,
}

#[async_trait]
impl OrderRepository for FailingSaveRepository {
    async fn save_order(&self, _order: &SeckillOrder) -> Result<(), StorageError> {
        Err(StorageError::QueryError("磁盘已满".to_string()))
    }

    async fn find_order(
        &self,
        user_id: &str,
        activity_id: &str,
    ) -> Result<Option<SeckillOrder>, StorageError> {
        self.inner.find_order(user_id, activity_id).await
    }

    async fn get_order(&self, order_id: Uuid) -> Result<Option<SeckillOrder>, StorageError> {
        self.inner.get_order(order_id).await
    }

    async fn transition_status(
        &self,
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        self.inner.transition_status(order_id, from, to, at).await
    }

    async fn find_expired_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SeckillOrder>, StorageError> {
        self.inner.find_expired_pending(now, limit).await
    }
}

#[tokio::test]
async fn test_failed_persistence_restores_stock() {
    let catalog = Arc::new(MemoryActivityCatalog::new());
    catalog.upsert(active_activity(ACTIVITY_ID, 5));
    let service = SeckillService::new(
        Arc::new(MemoryCounterStore::new()),
        Arc::new(FailingSaveRepository {
            inner: MemoryOrderRepository::new(),
        }),
        catalog,
    );
    service.warm_up(ACTIVITY_ID).await.unwrap();

    for i in 0..10 {
        let result = service
            .process_seckill_order(&format!("user-{}", i), ACTIVITY_ID, 1)
            .await;
        assert!(matches!(result, Err(SeckillError::StorageError(_))));
    }

    assert_eq!(service.stock().remaining(ACTIVITY_ID).await.unwrap(), Some(5));
}

#[tokio::test]
async fn test_rejections_do_not_touch_stock() {
    let fixture = setup_service(active_activity(ACTIVITY_ID, 5)).await;
    let service = &fixture.service;

    let cases = [
        service.process_seckill_order("", ACTIVITY_ID, 1).await,
        service.process_seckill_order("user-1", ACTIVITY_ID, 0).await,
        service.process_seckill_order("user-1", "missing", 1).await,
        service.process_seckill_order("user-1", ACTIVITY_ID, 2).await,
    ];
    assert!(matches!(cases[0], Err(SeckillError::ValidationError(_))));
    assert!(matches!(cases[1], Err(SeckillError::ValidationError(_))));
    assert!(matches!(cases[2], Err(SeckillError::NotFound(_))));
    assert!(matches!(cases[3], Err(SeckillError::ValidationError(_))));

    assert_eq!(service.stock().remaining(ACTIVITY_ID).await.unwrap(), Some(5));
    assert!(fixture.orders.is_empty());
}

#[tokio::test]
async fn test_oversized_quantities_are_insufficient_stock() {
    let fixture =
        setup_service(active_activity(ACTIVITY_ID, 5).with_limit_per_user(u32::MAX)).await;
    let service = &fixture.service;

    service
        .process_seckill_order("user-1", ACTIVITY_ID, 2)
        .await
        .unwrap();

    // 超过剩余库存
    let over_remaining = service.process_seckill_order("user-2", ACTIVITY_ID, 4).await;
    assert!(matches!(
        over_remaining,
        Err(SeckillError::InsufficientStock {
            requested: 4,
            available: 3
        })
    ));

    // 超过初始库存
    for quantity in [6, u32::MAX] {
        let result = service
            .process_seckill_order("user-3", ACTIVITY_ID, quantity)
            .await;
        match result {
            Err(SeckillError::InsufficientStock {
                requested,
                available,
            }) => {
                assert_eq!(requested, u64::from(quantity));
                assert_eq!(available, 3);
            }
            other => panic!("预期库存不足: {:?}", other.map(|o| o.id)),
        }
    }

    assert_eq!(service.stock().remaining(ACTIVITY_ID).await.unwrap(), Some(3));
    assert_eq!(fixture.orders.len(), 1);

    // 库存直接预扣同样不会超卖
    let outcome = service.stock().reserve(ACTIVITY_ID, u64::MAX).await.unwrap();
    assert!(matches!(
        outcome,
        ReserveOutcome::InsufficientStock { available: 3, .. }
    ));
    assert_eq!(service.stock().remaining(ACTIVITY_ID).await.unwrap(), Some(3));
}

#[tokio::test]
async fn test_rate_limited_users_keep_stock() {
    let governor = Arc::new(create_governor(&[sliding_window_rule(
        "seckill_order",
        "/api/seckill/*",
        1,
        "60s",
    )]));
    let fixture = setup_with(active_activity(ACTIVITY_ID, 5), |service| {
        service.with_rate_limit(governor.clone(), "seckill_order")
    })
    .await;
    let service = &fixture.service;

    service
        .process_seckill_order("user-1", ACTIVITY_ID, 1)
        .await
        .unwrap();
    let limited = service.process_seckill_order("user-1", ACTIVITY_ID, 1).await;
    match limited {
        Err(e @ SeckillError::TooManyRequests { .. }) => assert_eq!(e.status_code(), 429),
        other => panic!("预期被限流: {:?}", other.map(|o| o.id)),
    }

    // 限流按用户隔离
    service
        .process_seckill_order("user-2", ACTIVITY_ID, 1)
        .await
        .unwrap();
    assert_eq!(service.stock().remaining(ACTIVITY_ID).await.unwrap(), Some(3));
}

#[tokio::test]
async fn test_each_winner_has_unique_order_id() {
    let fixture = setup_service(active_activity(ACTIVITY_ID, 20)).await;

    let mut ids = HashSet::new();
    for i in 0..20 {
        let order = fixture
            .service
            .process_seckill_order(&format!("user-{}", i), ACTIVITY_ID, 1)
            .await
            .unwrap();
        assert_eq!(order.total_amount_cents(), 1_000);
        assert!(ids.insert(order.id));
    }
    assert_eq!(ids.len(), 20);
}
