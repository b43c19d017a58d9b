use lazy_static::lazy_static;
use redis::{aio::ConnectionManager, AsyncCommands, RedisError, RedisResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

use crate::domain::UserCounters;

/// Generation keys outlive any fill that could still be in flight
const GENERATION_TTL_SECS: i64 = 86_400;

lazy_static! {
    /// Write both counters only if no invalidation happened since the read
    static ref FILL_SCRIPT: redis::Script = redis::Script::new(
        r#"
        local current = redis.call('GET', KEYS[3]) or '0'
        if current ~= ARGV[1] then
            return 0
        end
        redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[4])
        redis.call('SET', KEYS[2], ARGV[3], 'EX', ARGV[4])
        return 1
        "#
    );
}

/// Result of a cache read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterLookup {
    Hit(UserCounters),
    /// Generation observed with the miss; pass it to [`CounterCache::fill`]
    Miss { generation: i64 },
}

/// Redis read-through cache for follower/following counters
///
/// Keys: user:{user_id}:followers, user:{user_id}:following and the
/// invalidation counter user:{user_id}:counters_gen
///
/// - Get: MGET all three keys; a miss on either counter is a miss for the user
/// - Fill: Lua script, SET EX both counters unless the generation moved
/// - Invalidate: DEL the counters and INCR the generation, atomically
///
/// Every command is bounded by the command timeout.
#[derive(Clone)]
pub struct CounterCache {
    redis: ConnectionManager,
    ttl_secs: u64,
    command_timeout: Duration,
}

impl CounterCache {
    pub fn new(redis: ConnectionManager, ttl_secs: u64, command_timeout: Duration) -> Self {
        Self {
            redis,
            ttl_secs,
            command_timeout,
        }
    }

    fn keys(user_id: Uuid) -> [String; 3] {
        [
            format!("user:{}:followers", user_id),
            format!("user:{}:following", user_id),
            format!("user:{}:counters_gen", user_id),
        ]
    }

    pub async fn get(&self, user_id: Uuid) -> RedisResult<CounterLookup> {
        let mut conn = self.redis.clone();
        let values: Vec<Option<i64>> = run_with_timeout(
            self.command_timeout,
            conn.mget(Self::keys(user_id).to_vec()),
        )
        .await?;

        Ok(match values.as_slice() {
            [Some(followers), Some(following), _] => {
                CounterLookup::Hit(UserCounters::new(*followers, *following))
            }
            [_, _, generation] => CounterLookup::Miss {
                generation: generation.unwrap_or(0),
            },
            _ => CounterLookup::Miss { generation: 0 },
        })
    }

    /// Store counters read after a miss; returns `false` when an
    /// invalidation since that miss made them stale.
    pub async fn fill(
        &self,
        user_id: Uuid,
        counters: UserCounters,
        generation: i64,
    ) -> RedisResult<bool> {
        let [followers_key, following_key, generation_key] = Self::keys(user_id);
        let mut conn = self.redis.clone();

        let mut invocation = FILL_SCRIPT.prepare_invoke();
        invocation
            .key(followers_key)
            .key(following_key)
            .key(generation_key)
            .arg(generation)
            .arg(counters.follower_count)
            .arg(counters.following_count)
            .arg(self.ttl_secs);
        let written: i64 =
            run_with_timeout(self.command_timeout, invocation.invoke_async(&mut conn)).await?;
        Ok(written == 1)
    }

    pub async fn invalidate(&self, user_ids: &[Uuid]) -> RedisResult<()> {
        if user_ids.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for user_id in user_ids {
            let [followers_key, following_key, generation_key] = Self::keys(*user_id);
            pipe.del(vec![followers_key, following_key]).ignore();
            pipe.incr(&generation_key, 1).ignore();
            pipe.expire(&generation_key, GENERATION_TTL_SECS).ignore();
        }

        let mut conn = self.redis.clone();
        run_with_timeout(self.command_timeout, pipe.query_async::<_, ()>(&mut conn)).await
    }

    /// Round-trip used by the readiness check
    pub async fn ping(&self) -> RedisResult<()> {
        let mut conn = self.redis.clone();
        run_with_timeout(
            self.command_timeout,
            redis::cmd("PING").query_async::<_, String>(&mut conn),
        )
        .await
        .map(|_| ())
    }
}

/// Bound a Redis command; an elapsed deadline becomes an IO error.
pub async fn run_with_timeout<F, T>(limit: Duration, future: F) -> RedisResult<T>
where
    F: Future<Output = RedisResult<T>>,
{
    match timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(RedisError::from((
            redis::ErrorKind::IoError,
            "redis command timed out",
        ))),
    }
}
