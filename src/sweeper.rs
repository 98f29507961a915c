//! 过期订单扫描
//!
//! 定期查找超过支付截止时间的待支付订单，逐个置为过期并回补库存。
//! 转换通过比较并设置完成，重复扫描同一订单不会重复回补。

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::constants::{DEFAULT_SWEEP_BATCH_SIZE, MIN_SWEEP_INTERVAL_MS};
use crate::error::SeckillError;
use crate::seckill::SeckillService;

/// 单次扫描结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// 扫描到的超时订单数
    pub scanned: usize,
    /// 本次完成过期转换的订单数
    pub expired: usize,
    /// 已被其他调用方处理的订单数
    pub skipped: usize,
    /// 处理失败的订单数
    pub failed: usize,
}

/// 过期订单扫描器
#[derive(Debug, Clone)]
pub struct OrderSweeper {
    service: Arc<SeckillService>,
    batch_size: usize,
}

impl OrderSweeper {
    /// 创建扫描器
    pub fn new(service: Arc<SeckillService>) -> Self {
        Self {
            service,
            batch_size: DEFAULT_SWEEP_BATCH_SIZE,
        }
    }

    /// 设置每批处理的订单数
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// 执行一次扫描
    ///
    /// 一批满额时继续取下一批，直到没有超时订单或本批没有任何进展。
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SweepReport, SeckillError> {
        let mut report = SweepReport::default();

        loop {
            let batch = self.service.overdue_orders(now, self.batch_size).await?;
            let batch_len = batch.len();
            let mut progressed = false;

            for order in batch {
                report.scanned += 1;
                match self.service.expire_pending(&order, now).await {
                    Ok(true) => {
                        report.expired += 1;
                        progressed = true;
                    }
                    Ok(false) => {
                        report.skipped += 1;
                        progressed = true;
                    }
                    Err(e) => {
                        report.failed += 1;
                        warn!("过期订单处理失败: order={}, 错误: {}", order.id, e);
                    }
                }
            }

            if batch_len < self.batch_size || !progressed {
                break;
            }
        }

        if report.scanned > 0 {
            info!(
                "过期扫描完成: scanned={}, expired={}, skipped={}, failed={}",
                report.scanned, report.expired, report.skipped, report.failed
            );
        }
        Ok(report)
    }

    /// 在后台按固定间隔扫描
    ///
    /// 间隔不小于 [`MIN_SWEEP_INTERVAL_MS`] 毫秒。
    pub fn start(self, interval: Duration) -> SweeperHandle {
        let min_interval = Duration::from_millis(MIN_SWEEP_INTERVAL_MS);
        if interval < min_interval {
            warn!("扫描间隔过小，使用最小值: {:?} -> {:?}", interval, min_interval);
        }
        let interval = interval.max(min_interval);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("过期订单扫描启动: interval={:?}", interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // 批次在 select 分支体内执行，关闭信号不会打断它
                        if let Err(e) = self.run_once(Utc::now()).await {
                            error!("过期扫描失败: {}", e);
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("过期订单扫描已停止");
        });

        SweeperHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// 后台扫描任务句柄
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// 通知停止并等待当前批次完成
    pub async fn shutdown(self) -> Result<(), SeckillError> {
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|e| SeckillError::InternalError(format!("扫描任务异常退出: {}", e)))
    }
}
