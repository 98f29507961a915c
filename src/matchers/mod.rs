//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 匹配器模块
//!
//! 实现标识符提取器和限流规则匹配所需的路径/方法匹配。
//!
//! # 标识符提取器
//!
//! 支持从请求中提取两类标识符：
//! - 用户ID (UserId)，来自认证后的身份或 `X-User-Id` 头
//! - IP地址 (Ip)，来自 `X-Forwarded-For` 的第一个地址或传输层对端地址
//!
//! # 路径匹配
//!
//! - 精确匹配：`/api/orders`
//! - 前缀通配：`/api/seckill/*` 匹配前缀本身及其下所有路径
//! - 全匹配：`*`

use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

use crate::constants::{FORWARDED_FOR_HEADER, USER_ID_HEADER};
use crate::error::SeckillError;

// ============================================================================
// 标识符提取器
// ============================================================================

/// 标识符类型
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    /// 用户ID
    UserId(String),
    /// IP地址
    Ip(String),
}

impl Identifier {
    /// 获取标识符的字符串表示
    pub fn as_str(&self) -> &str {
        match self {
            Identifier::UserId(s) => s,
            Identifier::Ip(s) => s,
        }
    }

    /// 获取标识符类型名称
    pub fn type_name(&self) -> &'static str {
        match self {
            Identifier::UserId(_) => "user_id",
            Identifier::Ip(_) => "ip",
        }
    }
}

/// HTTP请求上下文
///
/// 简化的HTTP请求表示，包含提取标识符和匹配规则所需的信息。
#[derive(Clone, Default)]
pub struct RequestContext {
    /// 已认证的用户ID
    pub user_id: Option<String>,
    /// HTTP头（键统一为小写）
    pub headers: HashMap<String, String>,
    /// 请求路径
    pub path: String,
    /// 请求方法（大写）
    pub method: String,
    /// 传输层对端地址
    pub client_ip: Option<String>,
    /// 查询参数
    pub query_params: HashMap<String, String>,
}

fn is_sensitive(name: &str) -> bool {
    let name = name.to_lowercase();
    name.contains("auth")
        || name.contains("cookie")
        || name.contains("key")
        || name.contains("token")
        || name.contains("secret")
}

fn redact(map: &HashMap<String, String>) -> HashMap<String, String> {
    map.iter()
        .map(|(k, v)| {
            let v = if is_sensitive(k) {
                "***".to_string()
            } else {
                v.clone()
            };
            (k.clone(), v)
        })
        .collect()
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("user_id", &self.user_id)
            .field("headers", &redact(&self.headers))
            .field("path", &self.path)
            .field("method", &self.method)
            .field("client_ip", &self.client_ip)
            .field("query_params", &redact(&self.query_params))
            .finish()
    }
}

impl RequestContext {
    /// 创建新的请求上下文
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_uppercase(),
            path: path.to_string(),
            ..Default::default()
        }
    }

    /// 设置已认证用户
    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    /// 添加HTTP头
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_lowercase(), value.to_string());
        self
    }

    /// 设置客户端IP
    pub fn with_client_ip(mut self, ip: &str) -> Self {
        self.client_ip = Some(ip.to_string());
        self
    }

    /// 添加查询参数
    pub fn with_query_param(mut self, key: &str, value: &str) -> Self {
        self.query_params.insert(key.to_string(), value.to_string());
        self
    }

    /// 获取HTTP头（不区分大小写）
    pub fn get_header(&self, key: &str) -> Option<&String> {
        self.headers.get(&key.to_lowercase())
    }
}

/// 标识符提取器 trait
pub trait IdentifierExtractor: Send + Sync {
    /// 从请求上下文中提取标识符
    fn extract(&self, context: &RequestContext) -> Option<Identifier>;

    /// 获取提取器名称
    fn name(&self) -> &str;
}

/// 用户ID提取器
///
/// 优先使用上下文中已认证的用户，其次读取用户头。
pub struct UserIdExtractor {
    header_name: String,
}

impl UserIdExtractor {
    /// 从指定HTTP头提取用户ID
    pub fn from_header(header_name: &str) -> Self {
        Self {
            header_name: header_name.to_string(),
        }
    }
}

impl Default for UserIdExtractor {
    fn default() -> Self {
        Self::from_header(USER_ID_HEADER)
    }
}

impl IdentifierExtractor for UserIdExtractor {
    fn extract(&self, context: &RequestContext) -> Option<Identifier> {
        context
            .user_id
            .as_ref()
            .or_else(|| context.get_header(&self.header_name))
            .filter(|id| !id.is_empty())
            .map(|id| Identifier::UserId(id.clone()))
    }

    fn name(&self) -> &str {
        "UserIdExtractor"
    }
}

/// IP提取器
///
/// 取转发头中最左边的地址，缺失时使用传输层对端地址。
pub struct IpExtractor {
    header_names: Vec<String>,
    validate: bool,
}

impl IpExtractor {
    /// 创建新的IP提取器
    pub fn new(header_names: Vec<String>, validate: bool) -> Self {
        Self {
            header_names,
            validate,
        }
    }

    /// 从多个HTTP头提取（按优先级顺序）
    pub fn from_headers(header_names: Vec<&str>) -> Self {
        Self::new(header_names.iter().map(|s| s.to_string()).collect(), true)
    }

    /// 解析IP地址（支持 `client, proxy1, proxy2` 格式的列表）
    fn parse_ip(&self, value: &str) -> Option<String> {
        let ip = value.split(',').map(str::trim).find(|s| !s.is_empty())?;

        if self.validate && ip.parse::<IpAddr>().is_err() {
            return None;
        }

        Some(ip.to_string())
    }
}

impl Default for IpExtractor {
    fn default() -> Self {
        Self::from_headers(vec![FORWARDED_FOR_HEADER])
    }
}

impl IdentifierExtractor for IpExtractor {
    fn extract(&self, context: &RequestContext) -> Option<Identifier> {
        for header_name in &self.header_names {
            if let Some(ip) = context
                .get_header(header_name)
                .and_then(|value| self.parse_ip(value))
            {
                return Some(Identifier::Ip(ip));
            }
        }

        context
            .client_ip
            .as_deref()
            .and_then(|value| self.parse_ip(value))
            .map(Identifier::Ip)
    }

    fn name(&self) -> &str {
        "IpExtractor"
    }
}

// ============================================================================
// 限流键策略
// ============================================================================

/// 没有可用地址时的IP主体
pub const UNKNOWN_SUBJECT: &str = "unknown";

/// 全局策略的主体
pub const GLOBAL_SUBJECT: &str = "all";

/// 限流键策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// 按用户
    PerUser,
    /// 按IP
    PerIp,
    /// 按路由
    PerRoute,
    /// 全局
    Global,
}

impl KeyStrategy {
    /// 键中使用的策略名
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStrategy::PerUser => "user",
            KeyStrategy::PerIp => "ip",
            KeyStrategy::PerRoute => "route",
            KeyStrategy::Global => "global",
        }
    }

    /// 解析请求的限流主体，返回实际生效的策略与主体
    ///
    /// 按用户限流时没有身份会退化为按IP；按IP时没有地址使用 `unknown`。
    pub fn resolve(&self, context: &RequestContext) -> (KeyStrategy, String) {
        match self {
            KeyStrategy::PerUser => match UserIdExtractor::default().extract(context) {
                Some(identifier) => (KeyStrategy::PerUser, identifier.as_str().to_string()),
                None => KeyStrategy::PerIp.resolve(context),
            },
            KeyStrategy::PerIp => {
                let subject = IpExtractor::default()
                    .extract(context)
                    .map(|identifier| identifier.as_str().to_string())
                    .unwrap_or_else(|| UNKNOWN_SUBJECT.to_string());
                (KeyStrategy::PerIp, subject)
            }
            KeyStrategy::PerRoute => (KeyStrategy::PerRoute, context.path.clone()),
            KeyStrategy::Global => (KeyStrategy::Global, GLOBAL_SUBJECT.to_string()),
        }
    }
}

// ============================================================================
// 路径与方法匹配
// ============================================================================

/// 路径模式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    /// 精确匹配
    Exact(String),
    /// 前缀通配（存储去掉 `/*` 后的前缀）
    Prefix(String),
    /// 匹配所有路径
    Any,
}

impl PathPattern {
    /// 解析路径模式
    pub fn parse(pattern: &str) -> Result<Self, SeckillError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(SeckillError::ConfigError("路径模式不能为空".to_string()));
        }
        if pattern == "*" || pattern == "/*" {
            return Ok(PathPattern::Any);
        }
        if let Some(prefix) = pattern.strip_suffix("/*") {
            return Ok(PathPattern::Prefix(prefix.to_string()));
        }
        if pattern.contains('*') {
            return Err(SeckillError::ConfigError(format!(
                "只支持末尾的前缀通配符: {}",
                pattern
            )));
        }
        Ok(PathPattern::Exact(pattern.to_string()))
    }

    /// 路径是否匹配
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Any => true,
            PathPattern::Exact(exact) => path == exact,
            PathPattern::Prefix(prefix) => {
                path == prefix
                    || path
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
        }
    }
}

/// 允许的HTTP方法
pub const HTTP_METHODS: [&str; 7] = ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

/// 方法集合，空集合或包含 `*` 表示任意方法
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MethodSet {
    methods: Vec<String>,
}

impl MethodSet {
    /// 解析方法列表，未知方法返回错误
    pub fn parse(methods: &[String]) -> Result<Self, SeckillError> {
        if methods.iter().any(|m| m.trim() == "*") {
            return Ok(Self::default());
        }

        let mut parsed = Vec::with_capacity(methods.len());
        for method in methods {
            let method = method.trim().to_uppercase();
            if !HTTP_METHODS.contains(&method.as_str()) {
                return Err(SeckillError::ConfigError(format!(
                    "未知的HTTP方法: {}",
                    method
                )));
            }
            parsed.push(method);
        }
        Ok(Self { methods: parsed })
    }

    /// 方法是否匹配
    pub fn matches(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}
