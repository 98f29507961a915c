//! Governor 限流控制器
//!
//! 把配置中的限流规则编译为 {路径模式, 方法集合, 键策略, 限流器}，
//! 对每个请求按声明顺序找到第一条匹配的启用规则并做一次准入判断。
//! 没有匹配规则的请求不限流。
//!
//! 限流键格式: `ratelimit:{strategy}:{subject}:{rule_id}`。

use ahash::AHashSet as HashSet;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, trace, warn};

use crate::config::RateLimitRule;
use crate::constants::RATE_LIMIT_KEY_PREFIX;
use crate::error::{RateLimitDecision, SeckillError};
use crate::limiters::{Limiter, RateLimitAlgorithm, SlidingWindowLimiter, TokenBucketLimiter};
use crate::matchers::{KeyStrategy, MethodSet, PathPattern, RequestContext};
use crate::storage::CounterStore;

/// 生成限流键
pub fn rate_limit_key(strategy: KeyStrategy, subject: &str, action: &str) -> String {
    format!(
        "{}:{}:{}:{}",
        RATE_LIMIT_KEY_PREFIX,
        strategy.as_str(),
        subject,
        action
    )
}

/// 编译后的规则
struct CompiledRule {
    id: String,
    path: PathPattern,
    methods: MethodSet,
    strategy: KeyStrategy,
    limiter: Arc<dyn Limiter>,
}

impl CompiledRule {
    fn compile(rule: &RateLimitRule, store: Arc<dyn CounterStore>) -> Result<Self, SeckillError> {
        rule.validate().map_err(SeckillError::ConfigError)?;

        let limiter: Arc<dyn Limiter> = match rule.algorithm {
            RateLimitAlgorithm::SlidingWindow => Arc::new(SlidingWindowLimiter::new(
                store,
                rule.window_duration()?,
                rule.rate,
            )),
            RateLimitAlgorithm::TokenBucket => {
                Arc::new(TokenBucketLimiter::new(store, rule.capacity, rule.rate))
            }
        };

        Ok(Self {
            id: rule.id.clone(),
            path: PathPattern::parse(&rule.path_pattern)?,
            methods: MethodSet::parse(&rule.methods)?,
            strategy: rule.strategy,
            limiter,
        })
    }

    fn matches(&self, context: &RequestContext) -> bool {
        self.path.matches(&context.path) && self.methods.matches(&context.method)
    }
}

/// Governor 统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GovernorStats {
    /// 生效的规则数
    pub active_rules: usize,
    /// 被跳过的禁用规则数
    pub disabled_rules: usize,
}

/// Governor 限流控制器
pub struct Governor {
    rules: Vec<CompiledRule>,
    by_id: HashMap<String, usize>,
    disabled_rules: usize,
}

impl std::fmt::Debug for Governor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Governor")
            .field(
                "rules",
                &self.rules.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            )
            .field("disabled_rules", &self.disabled_rules)
            .finish()
    }
}

impl Governor {
    /// 根据规则表创建 Governor
    ///
    /// 每条规则在这里完成校验，禁用的规则不会被编译。
    pub fn new(store: Arc<dyn CounterStore>, rules: &[RateLimitRule]) -> Result<Self, SeckillError> {
        let mut compiled = Vec::with_capacity(rules.len());
        let mut by_id = HashMap::new();
        let mut seen_ids = HashSet::new();
        let mut disabled_rules = 0;

        for rule in rules {
            if !seen_ids.insert(rule.id.as_str()) {
                return Err(SeckillError::ConfigError(format!(
                    "重复的限流规则ID: {}",
                    rule.id
                )));
            }
            if !rule.enabled {
                debug!("跳过禁用的限流规则: {}", rule.id);
                disabled_rules += 1;
                continue;
            }

            by_id.insert(rule.id.clone(), compiled.len());
            compiled.push(CompiledRule::compile(rule, store.clone())?);
        }

        debug!(
            "Governor 初始化完成: {} 条规则生效, {} 条禁用",
            compiled.len(),
            disabled_rules
        );

        Ok(Self {
            rules: compiled,
            by_id,
            disabled_rules,
        })
    }

    /// 统计信息
    pub fn stats(&self) -> GovernorStats {
        GovernorStats {
            active_rules: self.rules.len(),
            disabled_rules: self.disabled_rules,
        }
    }

    /// 按主体和动作（规则ID）判断是否允许
    ///
    /// 动作没有对应的启用规则时不限流。
    #[instrument(skip(self))]
    pub async fn is_allowed(
        &self,
        subject: &str,
        action: &str,
    ) -> Result<RateLimitDecision, SeckillError> {
        self.is_allowed_at(subject, action, Utc::now().timestamp_millis())
            .await
    }

    /// 按主体和动作判断是否允许（指定当前毫秒时间）
    pub async fn is_allowed_at(
        &self,
        subject: &str,
        action: &str,
        now_ms: i64,
    ) -> Result<RateLimitDecision, SeckillError> {
        let Some(&index) = self.by_id.get(action) else {
            trace!("动作没有限流规则: {}", action);
            return Ok(RateLimitDecision::unlimited());
        };

        let rule = &self.rules[index];
        let key = rate_limit_key(rule.strategy, subject, &rule.id);
        let decision = rule.limiter.admit(&key, now_ms).await?;
        if !decision.allowed {
            warn!("请求被限流: key={}, action={}", key, action);
        }
        Ok(decision)
    }

    /// 对请求做限流检查
    #[instrument(skip(self, context), fields(path = %context.path, method = %context.method))]
    pub async fn check_request(
        &self,
        context: &RequestContext,
    ) -> Result<RateLimitDecision, SeckillError> {
        self.check_request_at(context, Utc::now().timestamp_millis())
            .await
    }

    /// 对请求做限流检查（指定当前毫秒时间）
    pub async fn check_request_at(
        &self,
        context: &RequestContext,
        now_ms: i64,
    ) -> Result<RateLimitDecision, SeckillError> {
        let Some(rule) = self.rules.iter().find(|rule| rule.matches(context)) else {
            trace!("没有匹配的限流规则: {} {}", context.method, context.path);
            return Ok(RateLimitDecision::unlimited());
        };

        let (strategy, subject) = rule.strategy.resolve(context);
        let key = rate_limit_key(strategy, &subject, &rule.id);
        let decision = rule.limiter.admit(&key, now_ms).await?;

        if decision.allowed {
            trace!(
                "限流放行: key={}, algorithm={}, remaining={}",
                key,
                rule.limiter.algorithm().as_str(),
                decision.remaining
            );
        } else {
            warn!("请求被限流: key={}, path={}", key, context.path);
        }
        Ok(decision)
    }
}
