//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Centralized configuration constants for Flashgate.
//!
//! All magic numbers used by the admission pipeline are defined here with their
//! purpose and usage context.

// ============================================================================
// Key Prefixes
// ============================================================================

/// Key prefix of the remaining-stock counter of an activity.
///
/// Full key: `seckill:stock:{activity_id}`.
pub const STOCK_KEY_PREFIX: &str = "seckill:stock";

/// Key prefix of the participation marker.
///
/// Full key: `seckill:participant:{activity_id}:{user_id}`.
pub const PARTICIPANT_KEY_PREFIX: &str = "seckill:participant";

/// Key prefix of rate-limit windows and buckets.
///
/// Full key: `ratelimit:{strategy}:{subject}:{action}`.
pub const RATE_LIMIT_KEY_PREFIX: &str = "ratelimit";

// ============================================================================
// Stock Reservation Constants
// ============================================================================

/// Grace period added to the stock counter TTL past the activity end (1 hour).
///
/// Exhausted or aborted activities self-clean from the counter store once it elapses.
pub const DEFAULT_STOCK_GRACE_PERIOD_SECS: u64 = 3600;

/// Timeout of a single counter-store operation (500 milliseconds).
///
/// A `Reserve` that times out is treated as "no stock granted".
pub const DEFAULT_COUNTER_STORE_TIMEOUT_MS: u64 = 500;

/// Minimum TTL of any marker or counter (1 second).
pub const MIN_KEY_TTL_SECS: u64 = 1;

// ============================================================================
// Order Lifecycle Constants
// ============================================================================

/// Payment deadline of a pending seckill order (15 minutes).
pub const DEFAULT_PAYMENT_TIMEOUT_SECS: u64 = 900;

/// Interval of the expiry sweep (30 seconds).
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;

/// 最小扫描间隔（毫秒）
pub const MIN_SWEEP_INTERVAL_MS: u64 = 1;

/// Maximum number of expired orders handled per sweep batch.
pub const DEFAULT_SWEEP_BATCH_SIZE: usize = 500;

/// Default maximum quantity a single user may reserve in one activity.
pub const DEFAULT_LIMIT_PER_USER: u32 = 1;

/// Attempts for the best-effort participation marker write.
pub const DEFAULT_MARK_RETRIES: u32 = 3;

/// Initial backoff between participation marker attempts (20 milliseconds).
pub const DEFAULT_MARK_BACKOFF_MS: u64 = 20;

// ============================================================================
// Circuit Breaker Constants
// ============================================================================

/// Default failure threshold for circuit breaker.
///
/// The circuit breaker transitions to open state after this many failures.
pub const DEFAULT_CIRCUIT_BREAKER_FAILURE_THRESHOLD: u64 = 5;

/// Default success threshold for circuit breaker half-open state.
///
/// The circuit breaker transitions to closed state after this many consecutive
/// successes in half-open state.
pub const DEFAULT_CIRCUIT_BREAKER_SUCCESS_THRESHOLD: u64 = 2;

/// Default recovery timeout for circuit breaker (30 seconds).
///
/// How long the circuit breaker remains open before a half-open probe is permitted.
pub const DEFAULT_CIRCUIT_BREAKER_RECOVERY_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// Gateway Constants
// ============================================================================

/// Timeout of a forwarded downstream request (5 seconds).
pub const DEFAULT_FORWARD_TIMEOUT_SECS: u64 = 5;

/// Heartbeat TTL after which a registered instance is considered unhealthy (15 seconds).
pub const DEFAULT_HEARTBEAT_TTL_SECS: u64 = 15;

/// Header carrying the forwarded client address chain.
pub const FORWARDED_FOR_HEADER: &str = "X-Forwarded-For";

/// Header carrying the authenticated user identity.
pub const USER_ID_HEADER: &str = "X-User-Id";
