//! 端到端测试：网关熔断与故障转移
//!
//! 测试场景：
//! - 连续失败打开熔断器，打开期间不调用下游
//! - 恢复超时后探测成功关闭熔断器
//! - 不同服务的熔断器互相隔离
//! - 限流先于路由执行
//! - 下游无响应时按转发超时失败并计入熔断

use crate::common::*;
use async_trait::async_trait;
use flashgate::{
    circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry},
    config::{FlashgateConfig, RouteConfig},
    discovery::{MemoryServiceRegistry, ServiceDiscovery, ServiceInstance},
    error::{CircuitState, SeckillError},
    gateway::{Forwarder, Gateway, GatewayRequest, GatewayResponse, ServerErrorIsFailure},
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

async fn registry_with(instances: &[(&str, &str)]) -> Arc<MemoryServiceRegistry> {
    let registry = Arc::new(MemoryServiceRegistry::new(Duration::from_secs(30)));
    for (id, service) in instances {
        registry
            .register(ServiceInstance::new(*id, *service, format!("http://{}", id)))
            .await
            .unwrap();
    }
    registry
}

fn routes() -> Vec<RouteConfig> {
    vec![
        RouteConfig::new("/api/inventory", "inventory-service"),
        RouteConfig::new("/api/orders", "order-service"),
    ]
}

fn breakers(recovery: Duration) -> Arc<CircuitBreakerRegistry> {
    Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::new(
        3, 1, recovery,
    )))
}

#[tokio::test]
async fn test_breaker_opens_and_recovers() {
    let discovery = registry_with(&[("inv-1", "inventory-service")]).await;
    let forwarder = Arc::new(ScriptedForwarder::new(vec![
        Ok(503),
        Err("连接被拒绝".to_string()),
        Ok(500),
    ]));
    let breakers = breakers(Duration::from_millis(100));
    let gateway = Gateway::new(&routes(), breakers.clone(), discovery, forwarder.clone()).unwrap();
    let request = GatewayRequest::new("GET", "/api/inventory/sku-1");

    let first = gateway.route_request(&request).await.unwrap();
    assert_eq!(first.status, 503);
    assert!(gateway.route_request(&request).await.is_err());
    assert_eq!(gateway.route_request(&request).await.unwrap().status, 500);

    let breaker = breakers.get("inventory-service").unwrap();
    assert_eq!(breaker.state(), CircuitState::Open);

    // 打开期间快速失败，不调用下游
    for _ in 0..5 {
        let rejected = gateway.route_request(&request).await;
        assert!(matches!(rejected, Err(SeckillError::ServiceUnavailable(_))));
    }
    assert_eq!(forwarder.calls(), 3);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let probe = gateway.route_request(&request).await.unwrap();
    assert_eq!(probe.status, 200);
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(forwarder.calls(), 4);
}

#[tokio::test]
async fn test_failed_probe_reopens_breaker() {
    let discovery = registry_with(&[("inv-1", "inventory-service")]).await;
    let forwarder = Arc::new(ScriptedForwarder::new(vec![
        Ok(503),
        Ok(503),
        Ok(503),
        Ok(503),
    ]));
    let breakers = breakers(Duration::from_millis(50));
    let gateway = Gateway::new(&routes(), breakers.clone(), discovery, forwarder.clone()).unwrap();
    let request = GatewayRequest::new("GET", "/api/inventory/sku-1");

    for _ in 0..3 {
        gateway.route_request(&request).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(80)).await;

    // 半开探测失败，重新打开
    assert_eq!(gateway.route_request(&request).await.unwrap().status, 503);
    let breaker = breakers.get("inventory-service").unwrap();
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(gateway.route_request(&request).await.is_err());
    assert_eq!(forwarder.calls(), 4);
}

#[tokio::test]
async fn test_breakers_are_isolated_per_service() {
    let discovery = registry_with(&[
        ("inv-1", "inventory-service"),
        ("ord-1", "order-service"),
    ])
    .await;
    let forwarder = Arc::new(ScriptedForwarder::new(vec![Ok(500), Ok(500), Ok(500)]));
    let breakers = breakers(Duration::from_secs(60));
    let gateway = Gateway::new(&routes(), breakers.clone(), discovery, forwarder).unwrap();

    let inventory = GatewayRequest::new("GET", "/api/inventory/sku-1");
    for _ in 0..3 {
        gateway.route_request(&inventory).await.unwrap();
    }
    assert!(gateway.route_request(&inventory).await.is_err());

    let orders = GatewayRequest::new("POST", "/api/orders");
    assert_eq!(gateway.route_request(&orders).await.unwrap().status, 200);

    let stats = breakers.all_stats();
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[0].name, "inventory-service");
    assert_eq!(stats[0].state, CircuitState::Open);
    assert_eq!(stats[1].state, CircuitState::Closed);
}

#[tokio::test]
async fn test_client_errors_keep_breaker_closed_with_server_error_classifier() {
    let discovery = registry_with(&[("ord-1", "order-service")]).await;
    let forwarder = Arc::new(ScriptedForwarder::new(vec![Ok(404); 5]));
    let breakers = breakers(Duration::from_secs(60));
    let gateway = Gateway::new(&routes(), breakers.clone(), discovery, forwarder)
        .unwrap()
        .with_classifier(Arc::new(ServerErrorIsFailure));

    let request = GatewayRequest::new("GET", "/api/orders/missing");
    for _ in 0..5 {
        assert_eq!(gateway.route_request(&request).await.unwrap().status, 404);
    }
    assert_eq!(
        breakers.get("order-service").unwrap().state(),
        CircuitState::Closed
    );
}

#[tokio::test]
async fn test_round_robin_and_deregistration() {
    let discovery = registry_with(&[
        ("ord-1", "order-service"),
        ("ord-2", "order-service"),
        ("ord-3", "order-service"),
    ])
    .await;
    let forwarder = Arc::new(ScriptedForwarder::default());
    let gateway = Gateway::new(
        &routes(),
        breakers(Duration::from_secs(60)),
        discovery.clone(),
        forwarder,
    )
    .unwrap();
    let request = GatewayRequest::new("GET", "/api/orders/1");

    let mut seen = HashSet::new();
    for _ in 0..3 {
        let response = gateway.route_request(&request).await.unwrap();
        seen.insert(String::from_utf8(response.body).unwrap());
    }
    assert_eq!(seen.len(), 3);

    for id in ["ord-1", "ord-2", "ord-3"] {
        assert!(discovery.deregister("order-service", id).await.unwrap());
    }
    let unavailable = gateway.route_request(&request).await;
    assert!(matches!(
        unavailable,
        Err(SeckillError::ServiceUnavailable(_))
    ));
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let discovery = registry_with(&[]).await;
    let forwarder = Arc::new(ScriptedForwarder::default());
    let gateway = Gateway::new(
        &routes(),
        breakers(Duration::from_secs(60)),
        discovery,
        forwarder.clone(),
    )
    .unwrap();

    let result = gateway
        .route_request(&GatewayRequest::new("GET", "/api/unknown"))
        .await;
    match result {
        Err(e @ SeckillError::NotFound(_)) => assert_eq!(e.status_code(), 404),
        other => panic!("预期路由不存在: {:?}", other.map(|r| r.status)),
    }
    assert_eq!(forwarder.calls(), 0);
}

#[tokio::test]
async fn test_rate_limit_runs_before_routing() {
    let discovery = registry_with(&[("ord-1", "order-service")]).await;
    let forwarder = Arc::new(ScriptedForwarder::default());
    let governor = Arc::new(create_governor(&[sliding_window_rule(
        "orders",
        "/api/orders/*",
        2,
        "60s",
    )]));
    let gateway = Gateway::new(
        &routes(),
        breakers(Duration::from_secs(60)),
        discovery,
        forwarder.clone(),
    )
    .unwrap()
    .with_governor(governor);

    let request = GatewayRequest::new("POST", "/api/orders/create").with_user("user-1");
    let first = gateway.route_request(&request).await.unwrap();
    assert_eq!(first.header("X-RateLimit-Remaining"), Some("1"));
    gateway.route_request(&request).await.unwrap();

    let limited = gateway.route_request(&request).await;
    assert!(matches!(limited, Err(SeckillError::TooManyRequests { .. })));
    assert_eq!(forwarder.calls(), 2);

    // 其他用户不受影响
    let other = GatewayRequest::new("POST", "/api/orders/create").with_user("user-2");
    assert!(gateway.route_request(&other).await.is_ok());
}

/// 永远不返回的下游
#[derive(Default)]
struct HangingForwarder {
    calls: AtomicUsize,
}

#[async_trait]
impl Forwarder for HangingForwarder {
    async fn forward(
        &self,
        _instance: &ServiceInstance,
        _request: &GatewayRequest,
    ) -> Result<GatewayResponse, SeckillError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_hanging_downstream_times_out_and_opens_breaker() {
    let config = FlashgateConfig::from_yaml_str(
        r#"
version: "1.0"
gateway:
  forward_timeout: 50ms
"#,
    )
    .unwrap();
    let discovery = registry_with(&[("inv-1", "inventory-service")]).await;
    let forwarder = Arc::new(HangingForwarder::default());
    let breakers = breakers(Duration::from_secs(60));
    let gateway = Gateway::new(&routes(), breakers.clone(), discovery, forwarder.clone())
        .unwrap()
        .with_settings(&config.gateway)
        .unwrap();
    assert_eq!(gateway.forward_timeout(), Duration::from_millis(50));

    let request = GatewayRequest::new("GET", "/api/inventory/sku-1");
    for _ in 0..3 {
        let started = Instant::now();
        let result = gateway.route_request(&request).await;
        assert!(matches!(result, Err(SeckillError::ServiceUnavailable(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    let breaker = breakers.get("inventory-service").unwrap();
    assert_eq!(breaker.state(), CircuitState::Open);

    // 熔断后不再调用下游
    assert!(gateway.route_request(&request).await.is_err());
    assert_eq!(forwarder.calls.load(Ordering::SeqCst), 3);
}
