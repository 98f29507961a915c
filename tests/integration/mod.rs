//! 集成测试模块
//!
//! 测试各组件之间的集成和交互

mod admission_control;
mod config_loading;
#[cfg(feature = "postgres")]
mod postgres_test;
#[cfg(feature = "redis")]
mod redis_test;
