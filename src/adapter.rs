use async_trait::async_trait;
use redis::{aio::ConnectionManager, Script};

use crate::errors::LockError;
use crate::scripts::{ACQUIRE_SCRIPT, EXTEND_SCRIPT, RELEASE_SCRIPT};
use crate::stats::Vote;

/// The three scripted remote operations a quorum member must support.
///
/// Implementations must never let an error escape as anything but a
/// [`Vote::Against`] — the one exception is a genuine programmer error, which is the
/// caller's responsibility to detect (see the Vote Collector's panic handling).
#[async_trait]
pub trait ServerOps: Send + Sync {
    async fn acquire_one(&self, db: i64, value: &str, duration_ms: i64, keys: &[String]) -> Vote;
    async fn extend_one(&self, db: i64, value: &str, duration_ms: i64, keys: &[String]) -> Vote;
    async fn release_one(&self, db: i64, value: &str, keys: &[String]) -> Vote;
}

/// Drives the three remote scripts against one Redis-compatible server.
///
/// Script injection is lazy and idempotent by construction: `redis::Script::invoke_async`
/// tries `EVALSHA` first and transparently falls back to `EVAL` (which primes the
/// server's script cache) on a `NOSCRIPT` reply, so there is no separate "install"
/// step to track here.
pub struct ServerAdapter {
    addr: String,
    connection: ConnectionManager,
    acquire_script: Script,
    extend_script: Script,
    release_script: Script,
}

impl ServerAdapter {
    pub async fn connect(addr: impl Into<String>) -> Result<Self, LockError> {
        let addr = addr.into();
        let client = redis::Client::open(addr.as_str())?;
        let connection = client.get_connection_manager().await?;
        Ok(ServerAdapter {
            addr,
            connection,
            acquire_script: Script::new(ACQUIRE_SCRIPT),
            extend_script: Script::new(EXTEND_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn vote_from_count(result: redis::RedisResult<i64>, requested: usize) -> Vote {
        match result {
            Ok(count) if count as usize == requested => Vote::For {
                count: count as usize,
            },
            Ok(_) => Vote::Against(LockError::ResourceLocked),
            Err(err) => Vote::Against(LockError::from(err)),
        }
    }
}

#[async_trait]
impl ServerOps for ServerAdapter {
    async fn acquire_one(&self, db: i64, value: &str, duration_ms: i64, keys: &[String]) -> Vote {
        let mut conn = self.connection.clone();
        let mut invocation = self.acquire_script.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        invocation.arg(db).arg(value).arg(duration_ms);
        let result: redis::RedisResult<i64> = invocation.invoke_async(&mut conn).await;
        Self::vote_from_count(result, keys.len())
    }

    async fn extend_one(&self, db: i64, value: &str, duration_ms: i64, keys: &[String]) -> Vote {
        let mut conn = self.connection.clone();
        let mut invocation = self.extend_script.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        invocation.arg(db).arg(value).arg(duration_ms);
        let result: redis::RedisResult<i64> = invocation.invoke_async(&mut conn).await;
        Self::vote_from_count(result, keys.len())
    }

    async fn release_one(&self, db: i64, value: &str, keys: &[String]) -> Vote {
        let mut conn = self.connection.clone();
        let mut invocation = self.release_script.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        invocation.arg(db).arg(value);
        // release never fails on a partial count: any value, including 0, is a vote for.
        let result: redis::RedisResult<i64> = invocation.invoke_async(&mut conn).await;
        match result {
            Ok(count) => Vote::For {
                count: count as usize,
            },
            Err(err) => Vote::Against(LockError::from(err)),
        }
    }
}
