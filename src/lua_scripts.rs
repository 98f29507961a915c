//! Redis Lua 脚本
//!
//! 库存扣减、回补、滑动窗口准入和令牌桶都必须在 Redis 端一次执行完成，
//! 这里集中定义这些脚本，并负责 `SCRIPT LOAD` 预加载与 `EVALSHA` 调用。
//! 脚本 SHA 在构造时计算；Redis 重启或执行 `SCRIPT FLUSH` 后收到 `NOSCRIPT`
//! 会重新加载并重试一次。

use redis::aio::ConnectionLike;
use redis::Script;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, trace};

use crate::error::StorageError;

/// Lua脚本类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LuaScriptType {
    /// 检查并扣减（库存预扣）
    TryDecrement,
    /// 仅当键存在时增加（库存回补）
    IncrementExisting,
    /// 滑动窗口准入
    SlidingWindow,
    /// 令牌桶
    TokenBucket,
}

impl LuaScriptType {
    /// 脚本名称
    pub fn name(&self) -> &'static str {
        match self {
            LuaScriptType::TryDecrement => "try_decrement",
            LuaScriptType::IncrementExisting => "increment_existing",
            LuaScriptType::SlidingWindow => "sliding_window_admit",
            LuaScriptType::TokenBucket => "token_bucket",
        }
    }

    /// 脚本版本
    pub fn version(&self) -> &'static str {
        match self {
            LuaScriptType::TryDecrement => "1.0",
            LuaScriptType::IncrementExisting => "1.0",
            LuaScriptType::SlidingWindow => "1.2",
            LuaScriptType::TokenBucket => "1.1",
        }
    }

    /// 所有脚本类型
    pub fn all() -> [LuaScriptType; 4] {
        [
            LuaScriptType::TryDecrement,
            LuaScriptType::IncrementExisting,
            LuaScriptType::SlidingWindow,
            LuaScriptType::TokenBucket,
        ]
    }

    fn index(&self) -> usize {
        match self {
            LuaScriptType::TryDecrement => 0,
            LuaScriptType::IncrementExisting => 1,
            LuaScriptType::SlidingWindow => 2,
            LuaScriptType::TokenBucket => 3,
        }
    }

    fn source(&self) -> &'static str {
        match self {
            LuaScriptType::TryDecrement => TRY_DECREMENT_SCRIPT,
            LuaScriptType::IncrementExisting => INCREMENT_EXISTING_SCRIPT,
            LuaScriptType::SlidingWindow => SLIDING_WINDOW_SCRIPT,
            LuaScriptType::TokenBucket => TOKEN_BUCKET_SCRIPT,
        }
    }
}

/// 检查并扣减Lua脚本
///
/// 参数: KEYS[1] - key, ARGV[1] - amount
/// 返回: (status, value)
/// - status = 1: 扣减成功，value 为剩余数量
/// - status = 0: 数量不足，value 为当前数量
/// - status = -1: 键不存在
pub const TRY_DECREMENT_SCRIPT: &str = r#"
local key = KEYS[1]
local amount = tonumber(ARGV[1])

local current = redis.call('GET', key)
if not current then
    return {-1, 0}
end

current = tonumber(current)
if current >= amount then
    local remaining = redis.call('DECRBY', key, amount)
    return {1, remaining}
end

return {0, current}
"#;

/// 仅当键存在时增加的Lua脚本
///
/// 已过期的库存键不能被回补重新创建（否则会丢失TTL）。
/// 参数: KEYS[1] - key, ARGV[1] - amount
/// 返回: (status, value) - status = 1 时 value 为增加后的值，status = -1 表示键不存在
pub const INCREMENT_EXISTING_SCRIPT: &str = r#"
local key = KEYS[1]
local amount = tonumber(ARGV[1])

if redis.call('EXISTS', key) == 0 then
    return {-1, 0}
end

local value = redis.call('INCRBY', key, amount)
return {1, value}
"#;

/// 滑动窗口准入脚本
///
/// 窗口用有序集合保存，分值为请求时间，成员带唯一后缀（同一毫秒内的请求分别计数）。
/// 参数: KEYS[1] - key, ARGV[1] - 窗口毫秒数, ARGV[2] - 上限, ARGV[3] - 当前毫秒, ARGV[4] - 成员
/// 返回: (allowed, 准入前计数, 最早请求滑出窗口的时间)
pub const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local window_ms = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now_ms - window_ms)
local count = redis.call('ZCARD', key)

local admitted = 0
if count < limit then
    redis.call('ZADD', key, now_ms, ARGV[4])
    redis.call('PEXPIRE', key, window_ms)
    admitted = 1
end

local reset_at = now_ms + window_ms
local first = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if first[2] then
    reset_at = tonumber(first[2]) + window_ms
end

return {admitted, count, reset_at}
"#;

/// 令牌桶脚本
///
/// 桶状态保存在哈希的 `tokens` 与 `refilled_at` 字段中，首次访问时桶是满的。
/// 参数: KEYS[1] - key, ARGV[1] - 容量, ARGV[2] - 每秒补充数, ARGV[3] - 当前毫秒, ARGV[4] - 本次消耗
/// 返回: (allowed, 剩余令牌, 重置时间)
pub const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local per_sec = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])

local state = redis.call('HMGET', key, 'tokens', 'refilled_at')
local tokens = tonumber(state[1]) or capacity
local refilled_at = tonumber(state[2]) or now_ms

if now_ms > refilled_at then
    tokens = math.min(capacity, tokens + (now_ms - refilled_at) * per_sec / 1000)
    refilled_at = now_ms
end

local admitted = 0
if tokens >= cost then
    tokens = tokens - cost
    admitted = 1
end

redis.call('HSET', key, 'tokens', tokens, 'refilled_at', refilled_at)
redis.call('EXPIRE', key, math.ceil(capacity / math.max(per_sec, 1)) + 60)

local deficit = capacity - tokens
if admitted == 0 then
    deficit = cost - tokens
end
local reset_at = now_ms
if deficit > 0 and per_sec > 0 then
    reset_at = now_ms + math.ceil(deficit * 1000 / per_sec)
end

return {admitted, math.floor(tokens), reset_at}
"#;

/// 已注册的脚本
#[derive(Debug)]
pub struct LoadedScript {
    script_type: LuaScriptType,
    sha: String,
    loaded: AtomicBool,
}

impl LoadedScript {
    fn new(script_type: LuaScriptType) -> Self {
        Self {
            script_type,
            sha: Script::new(script_type.source()).get_hash().to_string(),
            loaded: AtomicBool::new(false),
        }
    }

    /// 脚本类型
    pub fn script_type(&self) -> LuaScriptType {
        self.script_type
    }

    /// 脚本源码
    pub fn source(&self) -> &'static str {
        self.script_type.source()
    }

    /// 脚本SHA1
    pub fn sha(&self) -> &str {
        &self.sha
    }

    /// 是否已确认加载到当前 Redis
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }
}

/// Lua 脚本管理器
#[derive(Debug)]
pub struct LuaScriptManager {
    scripts: [LoadedScript; 4],
}

impl LuaScriptManager {
    /// 注册全部脚本（不访问 Redis）
    pub fn new() -> Self {
        Self {
            scripts: LuaScriptType::all().map(LoadedScript::new),
        }
    }

    /// 获取脚本
    pub fn script(&self, script_type: LuaScriptType) -> &LoadedScript {
        &self.scripts[script_type.index()]
    }

    /// 全部脚本
    pub fn scripts(&self) -> impl Iterator<Item = &LoadedScript> {
        self.scripts.iter()
    }

    /// 把全部脚本加载到 Redis
    pub async fn load_all<C>(&self, conn: &mut C) -> Result<(), StorageError>
    where
        C: ConnectionLike + Send,
    {
        for script in &self.scripts {
            self.load(conn, script).await?;
        }
        info!("Lua脚本已加载: {} 个", self.scripts.len());
        Ok(())
    }

    async fn load<C>(&self, conn: &mut C, script: &LoadedScript) -> Result<(), StorageError>
    where
        C: ConnectionLike + Send,
    {
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(script.source())
            .query_async(conn)
            .await
            .map_err(|e| {
                error!("加载脚本失败: {}, 错误: {}", script.script_type.name(), e);
                StorageError::from(e)
            })?;

        if sha != script.sha {
            return Err(StorageError::QueryError(format!(
                "脚本 {} 的SHA不一致: {} != {}",
                script.script_type.name(),
                sha,
                script.sha
            )));
        }
        script.loaded.store(true, Ordering::Release);
        debug!(
            "脚本已加载: {} v{}, SHA: {}",
            script.script_type.name(),
            script.script_type.version(),
            sha
        );
        Ok(())
    }

    /// 通过 `EVALSHA` 执行脚本
    ///
    /// 收到 `NOSCRIPT` 时脚本没有执行过，重新加载后重试一次。
    pub async fn invoke<C, T>(
        &self,
        conn: &mut C,
        script_type: LuaScriptType,
        keys: &[&str],
        args: &[&str],
    ) -> Result<T, StorageError>
    where
        C: ConnectionLike + Send,
        T: redis::FromRedisValue,
    {
        let script = self.script(script_type);
        if !script.is_loaded() {
            self.load(conn, script).await?;
        }

        trace!("执行脚本: {}", script_type.name());
        match evalsha(conn, script, keys, args).await {
            Err(e) if e.kind() == redis::ErrorKind::NoScriptError => {
                debug!("Redis 中没有脚本，重新加载: {}", script_type.name());
                script.loaded.store(false, Ordering::Release);
                self.load(conn, script).await?;
                evalsha(conn, script, keys, args).await.map_err(|e| {
                    error!("脚本执行失败: {}, 错误: {}", script_type.name(), e);
                    StorageError::from(e)
                })
            }
            Err(e) => {
                error!("脚本执行失败: {}, 错误: {}", script_type.name(), e);
                Err(StorageError::from(e))
            }
            Ok(value) => Ok(value),
        }
    }

    /// 标记全部脚本为未加载，下次执行前重新加载
    pub fn invalidate(&self) {
        for script in &self.scripts {
            script.loaded.store(false, Ordering::Release);
        }
    }
}

impl Default for LuaScriptManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn evalsha<C, T>(
    conn: &mut C,
    script: &LoadedScript,
    keys: &[&str],
    args: &[&str],
) -> redis::RedisResult<T>
where
    C: ConnectionLike + Send,
    T: redis::FromRedisValue,
{
    redis::cmd("EVALSHA")
        .arg(script.sha())
        .arg(keys.len())
        .arg(keys)
        .arg(args)
        .query_async(conn)
        .await
}
