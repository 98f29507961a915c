//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Flashgate - Flash-Sale Order Admission Pipeline
//!
//! Provides atomic stock reservation, per-user participation deduplication, the
//! seckill order lifecycle, rate limiting, and circuit breaking for the routing layer.
//!
//! # API Layers
//!
//! ## Prelude (Quick Start)
//!
//! Use `use flashgate::prelude::*;` to import all commonly used types.
//!
//! ## Core API
//!
//! - [`SeckillService`] - Order admission: reserve, persist, mark, compensate
//! - [`StockReservation`] - Atomic check-and-decrement against the counter store
//! - [`Governor`] - Rule-table rate limiting
//! - [`Gateway`] - Request routing guarded by per-service circuit breakers
//! - [`SeckillError`] - Error taxonomy
//!
//! ## Storage
//!
//! - [`CounterStore`] - Shared counter store (memory always, Redis with `redis`)
//! - [`OrderRepository`] / [`ActivityCatalog`] - Durable storage (memory always,
//!   PostgreSQL with `postgres`)
//!
//! # Examples
//!
//! ```rust
//! use flashgate::prelude::*;
//! use chrono::{Duration, Utc};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let now = Utc::now();
//!     let catalog = Arc::new(MemoryActivityCatalog::new());
//!     catalog.upsert(SeckillActivity::new(
//!         "a1", "p1", 10_000, 1_000, 2,
//!         now - Duration::minutes(1),
//!         now + Duration::hours(1),
//!     ));
//!
//!     let service = SeckillService::new(
//!         Arc::new(MemoryCounterStore::new()),
//!         Arc::new(MemoryOrderRepository::new()),
//!         catalog,
//!     );
//!     service.warm_up("a1").await.unwrap();
//!
//!     let order = service.process_seckill_order("u1", "a1", 1).await.unwrap();
//!     assert_eq!(order.status, OrderStatus::Pending);
//! }
//! ```
//!
//! # Features
//!
//! - `redis`: Redis counter store with preloaded Lua scripts
//! - `postgres`: PostgreSQL order and activity storage
//! - `proxy`: HTTP forwarding with `reqwest`
//! - `telemetry`: `tracing-subscriber` initialisation
//! - `monitoring`: Prometheus metrics

pub mod prelude;

pub mod circuit_breaker;
pub mod config;
pub mod constants;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod governor;
pub mod limiters;
pub mod load_balancer;
#[cfg(feature = "redis")]
pub mod lua_scripts;
pub mod matchers;
pub mod model;
pub mod participation;
#[cfg(feature = "postgres")]
pub mod postgres_storage;
#[cfg(feature = "proxy")]
pub mod proxy;
#[cfg(feature = "redis")]
pub mod redis_storage;
pub mod repository;
pub mod seckill;
pub mod stock;
pub mod storage;
pub mod sweeper;
#[cfg(any(feature = "telemetry", feature = "monitoring"))]
pub mod telemetry;

// 重新导出常用类型
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry};
pub use config::{
    BreakerConfigSet, BreakerSettings, FlashgateConfig, GatewaySettings, RateLimitRule,
    RedisSettings, RouteConfig, SeckillSettings,
};
pub use discovery::{MemoryServiceRegistry, ServiceDiscovery, ServiceInstance};
pub use error::{
    CircuitBreakerStats, CircuitState, RateLimitDecision, SeckillError, StorageError,
};
pub use gateway::{
    Forwarder, Gateway, GatewayRequest, GatewayResponse, NonSuccessIsFailure, ResponseClassifier,
    ServerErrorIsFailure, ServiceRouter,
};
pub use governor::{Governor, GovernorStats};
pub use limiters::{Limiter, RateLimitAlgorithm, SlidingWindowLimiter, TokenBucketLimiter};
pub use load_balancer::{LoadBalancer, RoundRobinBalancer};
#[cfg(feature = "redis")]
pub use lua_scripts::{LoadedScript, LuaScriptManager, LuaScriptType};
pub use matchers::{
    Identifier, IdentifierExtractor, IpExtractor, KeyStrategy, RequestContext, UserIdExtractor,
};
pub use model::{ActivityStatus, OrderStatus, SeckillActivity, SeckillOrder};
pub use participation::ParticipationGuard;
#[cfg(feature = "postgres")]
pub use postgres_storage::{PostgresStorage, PostgresStorageConfig};
#[cfg(feature = "proxy")]
pub use proxy::HttpForwarder;
#[cfg(feature = "redis")]
pub use redis_storage::{RedisConfig, RedisCounterStore, RetryStats};
pub use repository::{
    ActivityCatalog, MemoryActivityCatalog, MemoryOrderRepository, OrderRepository,
};
pub use seckill::SeckillService;
pub use stock::{ReserveOutcome, StockReservation};
pub use storage::{CounterStore, MemoryCounterStore};
pub use sweeper::{OrderSweeper, SweepReport, SweeperHandle};
#[cfg(feature = "monitoring")]
pub use telemetry::Metrics;
#[cfg(feature = "telemetry")]
pub use telemetry::{init_tracing, TelemetryConfig};
