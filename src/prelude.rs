//! Prelude module - Commonly used types for quick imports
//!
//! This module re-exports the most commonly used types from Flashgate,
//! allowing users to import them with a single `use flashgate::prelude::*;`
//! statement instead of importing each type individually.

// Core types - always available
pub use crate::config::FlashgateConfig;
pub use crate::error::{RateLimitDecision, SeckillError, StorageError};
pub use crate::model::{OrderStatus, SeckillActivity, SeckillOrder};
pub use crate::seckill::SeckillService;
pub use crate::stock::StockReservation;

// Admission control
pub use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry};
pub use crate::gateway::{Gateway, GatewayRequest, GatewayResponse};
pub use crate::governor::Governor;
pub use crate::matchers::{KeyStrategy, RequestContext};

// In-memory backends
pub use crate::discovery::MemoryServiceRegistry;
pub use crate::repository::{MemoryActivityCatalog, MemoryOrderRepository};
pub use crate::storage::{CounterStore, MemoryCounterStore};

// Feature-gated exports
#[cfg(feature = "postgres")]
pub use crate::postgres_storage::PostgresStorage;

#[cfg(feature = "redis")]
pub use crate::redis_storage::RedisCounterStore;

#[cfg(feature = "proxy")]
pub use crate::proxy::HttpForwarder;
