//! 配置加载集成测试

use flashgate::{
    circuit_breaker::CircuitBreakerRegistry,
    config::FlashgateConfig,
    error::SeckillError,
    gateway::ServiceRouter,
    limiters::RateLimitAlgorithm,
    matchers::KeyStrategy,
};
use std::io::Write;
use std::time::Duration;

const YAML_CONFIG: &str = r#"
version: "1.0"
rate_limit:
  - id: seckill_order
    path_pattern: /api/seckill/*
    methods: [POST]
    algorithm: sliding_window
    strategy: per_user
    rate: 5
    window: 60s
  - id: browse
    path_pattern: /api/*
    algorithm: token_bucket
    rate: 100
    capacity: 200
breakers:
  default:
    failure_threshold: 5
    success_threshold: 2
    recovery_timeout: 30s
  services:
    payment-service:
      failure_threshold: 2
      recovery_timeout: 5s
routes:
  - prefix: /api/inventory
    service: inventory-service
  - prefix: /api/orders
    service: order-service
seckill:
  payment_timeout: 10m
  sweep_batch_size: 50
"#;

const TOML_CONFIG: &str = r#"
version = "1.0"

[[rate_limit]]
id = "seckill_order"
path_pattern = "/api/seckill/*"
algorithm = "sliding_window"
rate = 10
window = "1s"

[breakers.default]
failure_threshold = 3

[[routes]]
prefix = "/api/orders"
service = "order-service"

[seckill]
payment_timeout = "5m"
"#;

#[test]
fn test_load_yaml_config() {
    let config = FlashgateConfig::from_yaml_str(YAML_CONFIG).unwrap();

    assert_eq!(config.rate_limit.len(), 2);
    let order_rule = &config.rate_limit[0];
    assert_eq!(order_rule.algorithm, RateLimitAlgorithm::SlidingWindow);
    assert_eq!(order_rule.strategy, KeyStrategy::PerUser);
    assert_eq!(order_rule.window_duration().unwrap(), Duration::from_secs(60));

    let browse = &config.rate_limit[1];
    assert_eq!(browse.strategy, KeyStrategy::PerIp);
    assert!(browse.enabled);

    assert_eq!(
        config.seckill.payment_timeout().unwrap(),
        Duration::from_secs(600)
    );
    assert_eq!(config.seckill.sweep_batch_size, 50);
    assert_eq!(
        config.seckill.stock_grace_period().unwrap(),
        Duration::from_secs(3600)
    );
}

#[test]
fn test_breaker_overrides_from_config() {
    let config = FlashgateConfig::from_yaml_str(YAML_CONFIG).unwrap();
    let registry = CircuitBreakerRegistry::from_settings(&config.breakers).unwrap();

    let payment = registry.get_or_create("payment-service");
    assert_eq!(payment.config().failure_threshold, 2);
    assert_eq!(payment.config().success_threshold, 2);
    assert_eq!(payment.config().recovery_timeout, Duration::from_secs(5));

    let inventory = registry.get_or_create("inventory-service");
    assert_eq!(inventory.config().failure_threshold, 5);
    assert_eq!(inventory.config().recovery_timeout, Duration::from_secs(30));
}

#[test]
fn test_routes_from_config() {
    let config = FlashgateConfig::from_yaml_str(YAML_CONFIG).unwrap();
    let router = ServiceRouter::new(&config.routes).unwrap();

    assert_eq!(router.resolve("/api/inventory/sku-1"), Some("inventory-service"));
    assert_eq!(router.resolve("/api/orders"), Some("order-service"));
    assert_eq!(router.resolve("/api/users/1"), None);
}

#[test]
fn test_load_config_files() {
    let dir = tempfile::tempdir().unwrap();

    let yaml_path = dir.path().join("flashgate.yaml");
    std::fs::File::create(&yaml_path)
        .unwrap()
        .write_all(YAML_CONFIG.as_bytes())
        .unwrap();
    let yaml = FlashgateConfig::from_file(&yaml_path).unwrap();
    assert_eq!(yaml.routes.len(), 2);

    let toml_path = dir.path().join("flashgate.toml");
    std::fs::write(&toml_path, TOML_CONFIG).unwrap();
    let toml = FlashgateConfig::from_file(&toml_path).unwrap();
    assert_eq!(toml.rate_limit[0].rate, 10);
    assert_eq!(toml.breakers.default.failure_threshold, 3);
    assert_eq!(
        toml.seckill.payment_timeout().unwrap(),
        Duration::from_secs(300)
    );

    let unknown = dir.path().join("flashgate.ini");
    std::fs::write(&unknown, "version = 1").unwrap();
    assert!(matches!(
        FlashgateConfig::from_file(&unknown),
        Err(SeckillError::ConfigError(_))
    ));
}

#[test]
fn test_invalid_configs_are_rejected() {
    let duplicate_rules = r#"
version: "1.0"
rate_limit:
  - id: a
    path_pattern: /api/*
    algorithm: sliding_window
    rate: 1
  - id: a
    path_pattern: /other/*
    algorithm: sliding_window
    rate: 1
"#;
    assert!(matches!(
        FlashgateConfig::from_yaml_str(duplicate_rules),
        Err(SeckillError::ConfigError(_))
    ));

    let zero_threshold = r#"
version: "1.0"
breakers:
  default:
    failure_threshold: 0
"#;
    assert!(FlashgateConfig::from_yaml_str(zero_threshold).is_err());

    let bad_timeout = r#"
version: "1.0"
seckill:
  payment_timeout: 0s
"#;
    assert!(FlashgateConfig::from_yaml_str(bad_timeout).is_err());

    let duplicate_routes = r#"
version: "1.0"
routes:
  - prefix: /api/orders
    service: a
  - prefix: /api/orders
    service: b
"#;
    assert!(FlashgateConfig::from_yaml_str(duplicate_routes).is_err());

    assert!(FlashgateConfig::from_yaml_str("version: [").is_err());
}

#[test]
fn test_defaults_apply_to_minimal_config() {
    let config = FlashgateConfig::from_yaml_str("version: \"1.0\"\n").unwrap();
    assert!(config.rate_limit.is_empty());
    assert!(config.routes.is_empty());
    assert!(config.redis.is_none());
    assert_eq!(
        config.seckill.payment_timeout().unwrap(),
        Duration::from_secs(900)
    );
    assert_eq!(
        config.gateway.heartbeat_ttl().unwrap(),
        Duration::from_secs(15)
    );
}
