//! Redis-backed store.
//!
//! Layout under the channel prefix:
//!
//! ```text
//! {channel}.message_id   counter, last issued id
//! {channel}.messages     hash   id -> "ttr;priority;payload"
//! {channel}.waiting      zset   id scored by priority
//! {channel}.delayed      zset   id scored by due unix time
//! {channel}.reserved     zset   id scored by ttr expiry unix time
//! {channel}.attempts     hash   id -> number of reservations
//! ```
//!
//! Ids are zero-padded inside the sets so equal priorities pop in FIFO order.
//! Every mutation runs as a Lua script, which keeps `reserve` exclusive across
//! any number of consumers. Settlements compare the caller's attempt with
//! `attempts`, so a holder whose reservation was handed out again is ignored.

use super::{QueueStats, Store};
use crate::error::{JobError, JobResult};
use crate::message::{MessageId, PushOptions, ReservedMessage, Status};
use arcana_queue_config::RedisConfig;
use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Config, Pool, Runtime};
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const PUSH_SCRIPT: &str = r"
local id = redis.call('incr', KEYS[1])
local member = string.format('%020d', id)
redis.call('hset', KEYS[2], member, ARGV[1])
if tonumber(ARGV[3]) > 0 then
    redis.call('zadd', KEYS[4], tonumber(ARGV[4]) + tonumber(ARGV[3]), member)
else
    redis.call('zadd', KEYS[3], ARGV[2], member)
end
return id
";

const RESERVE_SCRIPT: &str = r"
local now = tonumber(ARGV[1])
local function requeue(set)
    local due = redis.call('zrangebyscore', set, '-inf', now)
    for _, member in ipairs(due) do
        redis.call('zrem', set, member)
        local value = redis.call('hget', KEYS[5], member)
        if value then
            local priority = string.match(value, '^%d+;(%d+);')
            redis.call('zadd', KEYS[1], priority, member)
        end
    end
end
requeue(KEYS[2])
requeue(KEYS[3])
local head = redis.call('zrange', KEYS[1], 0, 0)
if #head == 0 then
    return false
end
local member = head[1]
redis.call('zrem', KEYS[1], member)
local value = redis.call('hget', KEYS[5], member)
if not value then
    return false
end
local ttr = tonumber(string.match(value, '^(%d+);'))
redis.call('zadd', KEYS[3], now + ttr, member)
local attempt = redis.call('hincrby', KEYS[4], member, 1)
return {member, value, attempt}
";

const RETRY_SCRIPT: &str = r"
if tonumber(redis.call('hget', KEYS[5], ARGV[1])) ~= tonumber(ARGV[4]) then
    return 0
end
local value = redis.call('hget', KEYS[4], ARGV[1])
if not value then
    return 0
end
redis.call('zrem', KEYS[1], ARGV[1])
redis.call('zrem', KEYS[2], ARGV[1])
redis.call('zrem', KEYS[3], ARGV[1])
if tonumber(ARGV[2]) > 0 then
    redis.call('zadd', KEYS[3], tonumber(ARGV[3]) + tonumber(ARGV[2]), ARGV[1])
else
    local priority = string.match(value, '^%d+;(%d+);')
    redis.call('zadd', KEYS[2], priority, ARGV[1])
end
return 1
";

const FINISH_SCRIPT: &str = r"
if tonumber(redis.call('hget', KEYS[5], ARGV[1])) ~= tonumber(ARGV[2]) then
    return 0
end
redis.call('zrem', KEYS[1], ARGV[1])
redis.call('zrem', KEYS[2], ARGV[1])
redis.call('zrem', KEYS[3], ARGV[1])
redis.call('hdel', KEYS[4], ARGV[1])
redis.call('hdel', KEYS[5], ARGV[1])
return 1
";

const REMOVE_SCRIPT: &str = r"
if redis.call('hdel', KEYS[1], ARGV[1]) == 0 then
    return 0
end
redis.call('zrem', KEYS[2], ARGV[1])
redis.call('zrem', KEYS[3], ARGV[1])
redis.call('zrem', KEYS[4], ARGV[1])
redis.call('hdel', KEYS[5], ARGV[1])
return 1
";

const CLEAR_SCRIPT: &str = r"
for i = 1, 2 do
    local members = redis.call('zrange', KEYS[i], 0, -1)
    for _, member in ipairs(members) do
        redis.call('hdel', KEYS[3], member)
        redis.call('hdel', KEYS[4], member)
    end
    redis.call('del', KEYS[i])
end
return 1
";

/// Poll interval of a blocking `reserve`.
const RESERVE_POLL: Duration = Duration::from_millis(500);

/// Create a Redis connection pool and verify it with a PING.
pub async fn create_pool(config: &RedisConfig) -> JobResult<Pool> {
    info!("Creating Redis connection pool for queue...");

    let pool = Config::from_url(&config.url)
        .builder()
        .map_err(|e| JobError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(config.pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| JobError::Configuration(format!("Failed to create pool: {}", e)))?;

    let timeout = Duration::from_secs(config.connect_timeout_secs);
    let ping = async {
        let mut conn = pool.get().await?;
        redis::cmd("PING").query_async::<String>(&mut *conn).await?;
        Ok::<_, JobError>(())
    };
    tokio::time::timeout(timeout, ping)
        .await
        .map_err(|_| JobError::Configuration(format!("Redis at {} did not answer", config.url)))??;

    info!("Redis connection pool created successfully");
    Ok(pool)
}

/// Key builder for one channel.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    /// Create a new key builder with the given channel prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn message_id(&self) -> String {
        format!("{}.message_id", self.prefix)
    }

    pub fn messages(&self) -> String {
        format!("{}.messages", self.prefix)
    }

    pub fn waiting(&self) -> String {
        format!("{}.waiting", self.prefix)
    }

    pub fn delayed(&self) -> String {
        format!("{}.delayed", self.prefix)
    }

    pub fn reserved(&self) -> String {
        format!("{}.reserved", self.prefix)
    }

    pub fn attempts(&self) -> String {
        format!("{}.attempts", self.prefix)
    }

    /// Set member / hash field for an id.
    pub fn member(id: MessageId) -> String {
        format!("{:020}", id.get())
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new("queue")
    }
}

/// Splits a stored `"ttr;priority;payload"` value.
fn decode_value(value: &str) -> JobResult<(u32, u32, String)> {
    let mut parts = value.splitn(3, ';');
    let mut number = |field: &str| -> JobResult<u32> {
        parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| JobError::Internal(format!("Corrupt stored message: bad {}", field)))
    };
    let ttr = number("ttr")?;
    let priority = number("priority")?;
    let payload = parts
        .next()
        .ok_or_else(|| JobError::Internal("Corrupt stored message: no payload".to_string()))?;
    Ok((ttr, priority, payload.to_string()))
}

struct Scripts {
    push: Script,
    reserve: Script,
    retry: Script,
    finish: Script,
    remove: Script,
    clear: Script,
}

impl Default for Scripts {
    fn default() -> Self {
        Self {
            push: Script::new(PUSH_SCRIPT),
            reserve: Script::new(RESERVE_SCRIPT),
            retry: Script::new(RETRY_SCRIPT),
            finish: Script::new(FINISH_SCRIPT),
            remove: Script::new(REMOVE_SCRIPT),
            clear: Script::new(CLEAR_SCRIPT),
        }
    }
}

/// Redis-backed store, shareable between processes and hosts.
pub struct RedisStore {
    pool: Pool,
    keys: RedisKeys,
    scripts: Scripts,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").field("keys", &self.keys).finish()
    }
}

impl RedisStore {
    /// Create a store on an existing pool.
    pub fn new(pool: Pool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(channel),
            scripts: Scripts::default(),
        }
    }

    /// Connect using the redis section of the configuration.
    pub async fn connect(config: &RedisConfig) -> JobResult<Self> {
        let pool = create_pool(config).await?;
        Ok(Self::new(pool, config.channel.clone()))
    }

    async fn conn(&self) -> JobResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    async fn try_reserve(&self) -> JobResult<Option<ReservedMessage>> {
        let mut conn = self.conn().await?;
        let reply: Option<(String, String, u32)> = self
            .scripts
            .reserve
            .key(self.keys.waiting())
            .key(self.keys.delayed())
            .key(self.keys.reserved())
            .key(self.keys.attempts())
            .key(self.keys.messages())
            .arg(Utc::now().timestamp())
            .invoke_async(&mut *conn)
            .await?;

        let Some((member, value, attempt)) = reply else {
            return Ok(None);
        };
        let id: u64 = member
            .parse()
            .map_err(|_| JobError::Internal(format!("Corrupt message id: {}", member)))?;
        let (ttr, priority, payload) = decode_value(&value)?;

        Ok(Some(ReservedMessage {
            id: MessageId::new(id),
            payload,
            ttr,
            attempt,
            priority,
        }))
    }

    async fn last_id(&self, conn: &mut deadpool_redis::Connection) -> JobResult<u64> {
        let last: Option<u64> = conn.get(self.keys.message_id()).await?;
        Ok(last.unwrap_or(0))
    }

    /// Drops `message` if its reservation is still the latest one.
    async fn finish(&self, message: &ReservedMessage) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let finished: i32 = self
            .scripts
            .finish
            .key(self.keys.reserved())
            .key(self.keys.waiting())
            .key(self.keys.delayed())
            .key(self.keys.messages())
            .key(self.keys.attempts())
            .arg(RedisKeys::member(message.id))
            .arg(message.attempt)
            .invoke_async(&mut *conn)
            .await?;
        Ok(finished == 1)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn push(&self, payload: String, options: PushOptions) -> JobResult<MessageId> {
        let value = format!("{};{};{}", options.ttr, options.priority, payload);
        let mut conn = self.conn().await?;
        let id: u64 = self
            .scripts
            .push
            .key(self.keys.message_id())
            .key(self.keys.messages())
            .key(self.keys.waiting())
            .key(self.keys.delayed())
            .arg(value)
            .arg(options.priority)
            .arg(options.delay)
            .arg(Utc::now().timestamp())
            .invoke_async(&mut *conn)
            .await?;

        debug!(job_id = id, delay = options.delay, "Stored message in redis");
        Ok(MessageId::new(id))
    }

    async fn reserve(&self, timeout: Option<Duration>) -> JobResult<Option<ReservedMessage>> {
        let Some(timeout) = timeout else {
            return self.try_reserve().await;
        };

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.try_reserve().await? {
                return Ok(Some(message));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(RESERVE_POLL.min(deadline - now)).await;
        }
    }

    async fn complete(&self, message: &ReservedMessage) -> JobResult<()> {
        if self.finish(message).await? {
            debug!(job_id = %message.id, "Completed message");
        } else {
            warn!(job_id = %message.id, attempt = message.attempt, "Ignored completion of a stale reservation");
        }
        Ok(())
    }

    async fn retry(&self, message: &ReservedMessage, delay: Duration) -> JobResult<MessageId> {
        let mut conn = self.conn().await?;
        let moved: i32 = self
            .scripts
            .retry
            .key(self.keys.reserved())
            .key(self.keys.waiting())
            .key(self.keys.delayed())
            .key(self.keys.messages())
            .key(self.keys.attempts())
            .arg(RedisKeys::member(message.id))
            .arg(delay.as_secs())
            .arg(Utc::now().timestamp())
            .arg(message.attempt)
            .invoke_async(&mut *conn)
            .await?;

        if moved == 0 {
            warn!(job_id = %message.id, attempt = message.attempt, "Ignored retry of a stale reservation");
        }
        Ok(message.id)
    }

    async fn fail(&self, message: &ReservedMessage) -> JobResult<()> {
        if self.finish(message).await? {
            debug!(job_id = %message.id, "Failed message");
        } else {
            warn!(job_id = %message.id, attempt = message.attempt, "Ignored failure of a stale reservation");
        }
        Ok(())
    }

    async fn status(&self, id: MessageId) -> JobResult<Status> {
        let mut conn = self.conn().await?;
        if id.get() == 0 || id.get() > self.last_id(&mut conn).await? {
            return Err(JobError::InvalidArgument(format!("Unknown message ID: {}", id)));
        }

        let member = RedisKeys::member(id);
        let (expires_at, stored): (Option<f64>, bool) = redis::pipe()
            .zscore(self.keys.reserved(), &member)
            .hexists(self.keys.messages(), &member)
            .query_async(&mut *conn)
            .await?;

        Ok(match (expires_at, stored) {
            (Some(at), true) if at > Utc::now().timestamp() as f64 => Status::Reserved,
            (_, true) => Status::Waiting,
            (_, false) => Status::Done,
        })
    }

    async fn clear(&self) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: i32 = self
            .scripts
            .clear
            .key(self.keys.waiting())
            .key(self.keys.delayed())
            .key(self.keys.messages())
            .key(self.keys.attempts())
            .invoke_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn remove(&self, id: MessageId) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i32 = self
            .scripts
            .remove
            .key(self.keys.messages())
            .key(self.keys.waiting())
            .key(self.keys.delayed())
            .key(self.keys.reserved())
            .key(self.keys.attempts())
            .arg(RedisKeys::member(id))
            .invoke_async(&mut *conn)
            .await?;
        Ok(removed == 1)
    }

    async fn stats(&self) -> JobResult<QueueStats> {
        let mut conn = self.conn().await?;
        let (total, waiting, delayed, reserved): (Option<u64>, u64, u64, u64) = redis::pipe()
            .get(self.keys.message_id())
            .zcard(self.keys.waiting())
            .zcard(self.keys.delayed())
            .zcard(self.keys.reserved())
            .query_async(&mut *conn)
            .await?;

        Ok(QueueStats {
            waiting,
            delayed,
            reserved,
            total: total.unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_keys() {
        let keys = RedisKeys::new("mail");

        assert_eq!(keys.message_id(), "mail.message_id");
        assert_eq!(keys.messages(), "mail.messages");
        assert_eq!(keys.waiting(), "mail.waiting");
        assert_eq!(keys.reserved(), "mail.reserved");
        assert_eq!(RedisKeys::default().delayed(), "queue.delayed");
    }

    #[test]
    fn test_members_sort_numerically() {
        let nine = RedisKeys::member(MessageId::new(9));
        let ten = RedisKeys::member(MessageId::new(10));
        assert!(nine < ten);
        assert_eq!(nine.parse::<u64>().unwrap(), 9);
    }

    #[test]
    fn test_decode_value_keeps_separators_in_payload() {
        let (ttr, priority, payload) = decode_value(r#"60;5;{"a":"x;y"}"#).unwrap();
        assert_eq!(ttr, 60);
        assert_eq!(priority, 5);
        assert_eq!(payload, r#"{"a":"x;y"}"#);
    }

    #[test]
    fn test_decode_value_rejects_corrupt_input() {
        assert!(matches!(decode_value("abc"), Err(JobError::Internal(_))));
        assert!(matches!(decode_value("60;5"), Err(JobError::Internal(_))));
    }
}
