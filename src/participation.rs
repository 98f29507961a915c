//! 参与去重
//!
//! 快路径检查共享计数存储中的参与标记；未命中时回退到订单仓库查询，
//! 找到订单则按活动剩余时长回填标记。标记只是优化，订单表的唯一约束才是最终仲裁。

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, trace, warn};

use crate::constants::{
    DEFAULT_MARK_BACKOFF_MS, DEFAULT_MARK_RETRIES, MIN_KEY_TTL_SECS, PARTICIPANT_KEY_PREFIX,
};
use crate::error::SeckillError;
use crate::model::SeckillActivity;
use crate::repository::OrderRepository;
use crate::storage::CounterStore;

/// 参与标记键
pub fn participant_key(activity_id: &str, user_id: &str) -> String {
    format!("{}:{}:{}", PARTICIPANT_KEY_PREFIX, activity_id, user_id)
}

/// 参与去重守卫
#[derive(Clone)]
pub struct ParticipationGuard {
    store: Arc<dyn CounterStore>,
    orders: Arc<dyn OrderRepository>,
    mark_retries: u32,
    mark_backoff: Duration,
}

impl std::fmt::Debug for ParticipationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticipationGuard")
            .field("mark_retries", &self.mark_retries)
            .field("mark_backoff", &self.mark_backoff)
            .finish()
    }
}

impl ParticipationGuard {
    /// 创建守卫
    pub fn new(store: Arc<dyn CounterStore>, orders: Arc<dyn OrderRepository>) -> Self {
        Self {
            store,
            orders,
            mark_retries: DEFAULT_MARK_RETRIES,
            mark_backoff: Duration::from_millis(DEFAULT_MARK_BACKOFF_MS),
        }
    }

    /// 设置标记写入的重试次数与初始退避
    pub fn with_mark_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.mark_retries = retries.max(1);
        self.mark_backoff = backoff;
        self
    }

    fn marker_ttl(activity: &SeckillActivity, now: DateTime<Utc>) -> Duration {
        activity
            .remaining_lifetime(now)
            .max(Duration::from_secs(MIN_KEY_TTL_SECS))
    }

    /// 用户是否已参与该活动
    #[instrument(skip(self, activity), fields(activity_id = %activity.id))]
    pub async fn has_participated(
        &self,
        user_id: &str,
        activity: &SeckillActivity,
    ) -> Result<bool, SeckillError> {
        self.has_participated_at(user_id, activity, Utc::now()).await
    }

    /// 用户是否已参与该活动（指定当前时间，用于计算回填TTL）
    pub async fn has_participated_at(
        &self,
        user_id: &str,
        activity: &SeckillActivity,
        now: DateTime<Utc>,
    ) -> Result<bool, SeckillError> {
        let key = participant_key(&activity.id, user_id);

        match self.store.exists(&key).await {
            Ok(true) => {
                trace!("参与标记命中: {}", key);
                return Ok(true);
            }
            Ok(false) => {}
            Err(e) => {
                // 快路径不可用时直接走订单仓库
                warn!("读取参与标记失败，回退到订单查询: {}, 错误: {}", key, e);
            }
        }

        let existing = self.orders.find_order(user_id, &activity.id).await?;
        if existing.is_none() {
            return Ok(false);
        }

        debug!("参与标记缺失但订单存在，回填标记: {}", key);
        if let Err(e) = self
            .store
            .set_marker(&key, Self::marker_ttl(activity, now))
            .await
        {
            warn!("回填参与标记失败: {}, 错误: {}", key, e);
        }
        Ok(true)
    }

    /// 标记用户已参与（尽力而为）
    ///
    /// 重试耗尽后只记录日志并返回 `false`，不阻塞下单。
    #[instrument(skip(self, activity), fields(activity_id = %activity.id))]
    pub async fn mark_participated(&self, user_id: &str, activity: &SeckillActivity) -> bool {
        self.mark_participated_at(user_id, activity, Utc::now()).await
    }

    /// 标记用户已参与（指定当前时间）
    pub async fn mark_participated_at(
        &self,
        user_id: &str,
        activity: &SeckillActivity,
        now: DateTime<Utc>,
    ) -> bool {
        let key = participant_key(&activity.id, user_id);
        let ttl = Self::marker_ttl(activity, now);
        let mut backoff = self.mark_backoff;

        for attempt in 1..=self.mark_retries {
            match self.store.set_marker(&key, ttl).await {
                Ok(()) => {
                    trace!("写入参与标记: {}, ttl={:?}", key, ttl);
                    return true;
                }
                Err(e) if attempt < self.mark_retries => {
                    debug!(
                        "写入参与标记失败，{:?} 后重试 ({}/{}): {}",
                        backoff, attempt, self.mark_retries, e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    warn!(
                        "写入参与标记失败，已放弃: {}, 尝试次数: {}, 错误: {}",
                        key, attempt, e
                    );
                }
            }
        }
        false
    }
}
