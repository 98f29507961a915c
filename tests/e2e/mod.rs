//! 端到端测试模块
//!
//! 测试完整的下单流程和网关场景

mod flash_sale;
mod gateway_failover;
mod order_expiry;
