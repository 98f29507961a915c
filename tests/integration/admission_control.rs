//! 准入控制集成测试
//!
//! 测试限流规则表和熔断器在共享存储上的行为

use crate::common::*;
use flashgate::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig},
    error::{CircuitState, SeckillError},
    governor::{rate_limit_key, Governor},
    matchers::{KeyStrategy, RequestContext},
    storage::{CounterStore, MemoryCounterStore},
};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_sliding_window_boundary_through_governor() {
    let governor = create_governor(&[sliding_window_rule("orders", "/api/*", 5, "60s")]);

    for _ in 0..5 {
        let decision = governor.is_allowed_at("user-1", "orders", 0).await.unwrap();
        assert!(decision.allowed);
    }

    let denied = governor
        .is_allowed_at("user-1", "orders", 1_000)
        .await
        .unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.remaining, 0);
    assert_eq!(denied.reset_at_ms, 60_000);
    assert!(matches!(
        denied.into_result(),
        Err(SeckillError::TooManyRequests { .. })
    ));

    let after_window = governor
        .is_allowed_at("user-1", "orders", 61_000)
        .await
        .unwrap();
    assert!(after_window.allowed);
}

#[tokio::test]
async fn test_token_bucket_refills_over_time() {
    let governor = create_governor(&[token_bucket_rule("burst", "/api/*", 1, 3)]);

    for _ in 0..3 {
        assert!(governor.is_allowed_at("user-1", "burst", 0).await.unwrap().allowed);
    }
    let denied = governor.is_allowed_at("user-1", "burst", 100).await.unwrap();
    assert!(!denied.allowed);
    assert!(denied.reset_at_ms > 100);

    let refilled = governor
        .is_allowed_at("user-1", "burst", 1_100)
        .await
        .unwrap();
    assert!(refilled.allowed);
}

#[tokio::test]
async fn test_unknown_action_is_unlimited() {
    let governor = create_governor(&[sliding_window_rule("orders", "/api/*", 1, "60s")]);

    for _ in 0..10 {
        let decision = governor.is_allowed("user-1", "browse").await.unwrap();
        assert!(decision.allowed);
        assert!(!decision.is_limited());
        assert!(decision.headers().is_empty());
    }
}

#[tokio::test]
async fn test_first_matching_rule_wins() {
    let mut checkout = sliding_window_rule("checkout", "/api/orders/checkout", 1, "60s");
    checkout.methods = vec!["POST".to_string()];
    let governor = create_governor(&[
        checkout,
        sliding_window_rule("orders", "/api/orders/*", 3, "60s"),
    ]);

    let post = RequestContext::new("POST", "/api/orders/checkout").with_user("user-1");
    let first = governor.check_request_at(&post, 0).await.unwrap();
    assert_eq!(
        first.key.as_deref(),
        Some("ratelimit:user:user-1:checkout")
    );
    assert!(!governor.check_request_at(&post, 1).await.unwrap().allowed);

    // 方法不匹配时落到下一条规则
    let get = RequestContext::new("GET", "/api/orders/checkout").with_user("user-1");
    let decision = governor.check_request_at(&get, 2).await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.key.as_deref(), Some("ratelimit:user:user-1:orders"));

    let unmatched = RequestContext::new("GET", "/health");
    assert!(!governor
        .check_request_at(&unmatched, 3)
        .await
        .unwrap()
        .is_limited());
}

#[tokio::test]
async fn test_disabled_rules_are_skipped() {
    let mut rule = sliding_window_rule("orders", "/api/*", 1, "60s");
    rule.enabled = false;
    let governor = create_governor(&[rule]);

    assert_eq!(governor.stats().active_rules, 0);
    assert_eq!(governor.stats().disabled_rules, 1);
    for _ in 0..3 {
        assert!(governor.is_allowed("user-1", "orders").await.unwrap().allowed);
    }
}

#[tokio::test]
async fn test_per_user_falls_back_to_ip() {
    let governor = create_governor(&[sliding_window_rule("orders", "/api/*", 1, "60s")]);

    let anonymous = RequestContext::new("GET", "/api/items").with_client_ip("203.0.113.7");
    let decision = governor.check_request_at(&anonymous, 0).await.unwrap();
    assert_eq!(
        decision.key.as_deref(),
        Some(rate_limit_key(KeyStrategy::PerIp, "203.0.113.7", "orders").as_str())
    );
}

#[tokio::test]
async fn test_governors_share_counters_through_store() {
    let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());
    let rules = [sliding_window_rule("orders", "/api/*", 2, "60s")];
    let node_a = Governor::new(store.clone(), &rules).unwrap();
    let node_b = Governor::new(store, &rules).unwrap();

    assert!(node_a.is_allowed_at("user-1", "orders", 0).await.unwrap().allowed);
    assert!(node_b.is_allowed_at("user-1", "orders", 1).await.unwrap().allowed);
    assert!(!node_a.is_allowed_at("user-1", "orders", 2).await.unwrap().allowed);
}

#[test]
fn test_invalid_rules_are_rejected() {
    let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());

    let duplicate = [
        sliding_window_rule("orders", "/api/*", 1, "60s"),
        sliding_window_rule("orders", "/api/v2/*", 1, "60s"),
    ];
    assert!(Governor::new(store.clone(), &duplicate).is_err());

    let zero_capacity = [token_bucket_rule("burst", "/api/*", 1, 0)];
    assert!(Governor::new(store.clone(), &zero_capacity).is_err());

    let bad_window = [sliding_window_rule("orders", "/api/*", 1, "soon")];
    assert!(Governor::new(store, &bad_window).is_err());
}

#[test]
fn test_breaker_state_machine() {
    let breaker = CircuitBreaker::new(
        "inventory-service",
        CircuitBreakerConfig::new(3, 2, Duration::from_secs(10)),
    );
    let start = Instant::now();

    // 成功会清零连续失败计数
    breaker.record_failure_at(start);
    breaker.record_failure_at(start);
    breaker.record_success();
    breaker.record_failure_at(start);
    breaker.record_failure_at(start);
    assert_eq!(breaker.state(), CircuitState::Closed);

    breaker.record_failure_at(start);
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(breaker.is_open_at(start + Duration::from_secs(5)));

    assert!(!breaker.is_open_at(start + Duration::from_secs(11)));
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    breaker.record_success();
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    breaker.record_success();
    assert_eq!(breaker.state(), CircuitState::Closed);

    let stats = breaker.stats();
    assert_eq!(stats.failure_count, 0);
    assert_eq!(stats.success_count, 0);
}

#[tokio::test]
async fn test_breaker_call_short_circuits_when_open() {
    let breaker = CircuitBreaker::new(
        "payment-service",
        CircuitBreakerConfig::new(1, 1, Duration::from_secs(60)),
    );

    let failed: Result<(), SeckillError> = breaker
        .call(async { Err(SeckillError::ServiceUnavailable("超时".to_string())) })
        .await;
    assert!(failed.is_err());
    assert_eq!(breaker.state(), CircuitState::Open);

    let rejected = breaker.call(async { Ok::<_, SeckillError>(42) }).await;
    assert!(matches!(rejected, Err(SeckillError::ServiceUnavailable(_))));
}
