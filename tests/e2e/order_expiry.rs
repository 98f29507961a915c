//! 端到端测试：订单过期
//!
//! 测试场景：
//! - 超时未支付的订单被扫描过期，库存回补恰好一次
//! - 过期后支付失败
//! - 取消与过期并发时只回补一次

use crate::common::*;
use chrono::{Duration as ChronoDuration, Utc};
use flashgate::{error::SeckillError, model::OrderStatus, sweeper::OrderSweeper};
use futures::future::join_all;
use std::time::Duration;

#[tokio::test]
async fn test_sweeper_expires_unpaid_orders_exactly_once() {
    let fixture = setup_with(active_activity(ACTIVITY_ID, 10), |service| {
        service.with_payment_timeout(Duration::from_secs(60))
    })
    .await;
    let service = fixture.service.clone();
    let now = Utc::now();

    let mut orders = Vec::new();
    for i in 0..6 {
        orders.push(
            service
                .process_seckill_order_at(&format!("user-{}", i), ACTIVITY_ID, 1, now)
                .await
                .unwrap(),
        );
    }
    service.pay_order_at(orders[0].id, now).await.unwrap();
    assert_eq!(service.stock().remaining(ACTIVITY_ID).await.unwrap(), Some(4));

    let sweeper = OrderSweeper::new(service.clone()).with_batch_size(2);
    let later = now + ChronoDuration::minutes(5);

    let report = sweeper.run_once(later).await.unwrap();
    assert_eq!(report.expired, 5);
    assert_eq!(report.failed, 0);
    assert_eq!(service.stock().remaining(ACTIVITY_ID).await.unwrap(), Some(9));

    // 再次扫描不会重复回补
    let again = sweeper.run_once(later).await.unwrap();
    assert_eq!(again.scanned, 0);
    assert_eq!(service.stock().remaining(ACTIVITY_ID).await.unwrap(), Some(9));

    assert_eq!(
        fixture
            .orders
            .count_by_status(ACTIVITY_ID, OrderStatus::Expired),
        5
    );
    assert_eq!(
        fixture.orders.count_by_status(ACTIVITY_ID, OrderStatus::Paid),
        1
    );
}

#[tokio::test]
async fn test_pay_after_deadline_expires_order() {
    let fixture = setup_with(active_activity(ACTIVITY_ID, 3), |service| {
        service.with_payment_timeout(Duration::from_secs(60))
    })
    .await;
    let service = &fixture.service;
    let now = Utc::now();

    let order = service
        .process_seckill_order_at("user-1", ACTIVITY_ID, 1, now)
        .await
        .unwrap();
    assert_eq!(order.payment_deadline, now + ChronoDuration::seconds(60));

    let late = service
        .pay_order_at(order.id, now + ChronoDuration::seconds(61))
        .await;
    assert!(matches!(late, Err(SeckillError::ValidationError(_))));

    let stored = service.get_order(order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Expired);
    assert_eq!(service.stock().remaining(ACTIVITY_ID).await.unwrap(), Some(3));

    // 已过期的订单再次支付或过期都不会回补
    assert!(service.pay_order(order.id).await.is_err());
    assert!(!service.expire_order(order.id).await.unwrap());
    assert_eq!(service.stock().remaining(ACTIVITY_ID).await.unwrap(), Some(3));
}

#[tokio::test]
async fn test_concurrent_cancel_and_sweep_restore_once() {
    let fixture = setup_with(active_activity(ACTIVITY_ID, 20), |service| {
        service.with_payment_timeout(Duration::from_secs(1))
    })
    .await;
    let service = fixture.service.clone();
    let now = Utc::now();

    let mut order_ids = Vec::new();
    for i in 0..20 {
        let order = service
            .process_seckill_order_at(&format!("user-{}", i), ACTIVITY_ID, 1, now)
            .await
            .unwrap();
        order_ids.push(order.id);
    }
    assert_eq!(service.stock().remaining(ACTIVITY_ID).await.unwrap(), Some(0));

    let later = now + ChronoDuration::seconds(5);
    let sweeper = OrderSweeper::new(service.clone()).with_batch_size(3);
    let sweep = tokio::spawn(async move { sweeper.run_once(later).await });

    let cancels = order_ids.into_iter().map(|id| {
        let service = service.clone();
        tokio::spawn(async move { service.cancel_order_at(id, later).await })
    });
    let cancelled = join_all(cancels)
        .await
        .into_iter()
        .filter(|result| matches!(result, Ok(Ok(_))))
        .count();
    let report = sweep.await.unwrap().unwrap();

    assert_eq!(cancelled + report.expired, 20);
    assert_eq!(
        fixture.service.stock().remaining(ACTIVITY_ID).await.unwrap(),
        Some(20)
    );
}

#[tokio::test]
async fn test_background_sweeper_expires_overdue_orders() {
    let fixture = setup_with(active_activity(ACTIVITY_ID, 2), |service| {
        service.with_payment_timeout(Duration::from_millis(50))
    })
    .await;
    let service = fixture.service.clone();

    service
        .process_seckill_order("user-1", ACTIVITY_ID, 1)
        .await
        .unwrap();
    assert_eq!(service.stock().remaining(ACTIVITY_ID).await.unwrap(), Some(1));

    let handle = OrderSweeper::new(service.clone()).start(Duration::from_millis(20));
    tokio::time::sleep(Duration::from_millis(300)).await;
    handle.shutdown().await.unwrap();

    assert_eq!(
        fixture
            .orders
            .count_by_status(ACTIVITY_ID, OrderStatus::Expired),
        1
    );
    assert_eq!(service.stock().remaining(ACTIVITY_ID).await.unwrap(), Some(2));
}
