use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use deadpool_redis::{Config as RedisConfig, Pool, Runtime};
use redis::AsyncCommands;

/// How long an accusation snapshot lives in the store.
pub const SNAPSHOT_TTL: Duration = Duration::from_secs(10 * 60);

pub fn accusation_key(session_id: &str) -> String {
    format!("game:{}:confmeter", session_id)
}

/// Best-effort key/value sink for session snapshots.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()>;

    async fn ping(&self) -> anyhow::Result<()>;
}

/// Upper bound for one store round trip, pool checkout included.
pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RedisStore {
    pool: Pool,
    io_timeout: Duration,
}

impl RedisStore {
    pub fn new(redis_url: &str) -> anyhow::Result<Self> {
        Self::with_io_timeout(redis_url, IO_TIMEOUT)
    }

    pub fn with_io_timeout(redis_url: &str, io_timeout: Duration) -> anyhow::Result<Self> {
        let cfg = RedisConfig::from_url(redis_url);
        let pool = cfg.create_pool(Some(Runtime::Tokio1))?;

        Ok(Self { pool, io_timeout })
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> anyhow::Result<T>
    where
        F: std::future::Future<Output = anyhow::Result<T>>,
    {
        tokio::time::timeout(self.io_timeout, fut)
            .await
            .map_err(|_| anyhow!("redis {} timed out after {:?}", op, self.io_timeout))?
    }
}

#[async_trait]
impl SnapshotStore for RedisStore {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()> {
        self.bounded("SET", async {
            let mut conn = self.pool.get().await?;
            let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
            Ok(())
        })
        .await
    }

    async fn ping(&self) -> anyhow::Result<()> {
        self.bounded("PING", async {
            let mut conn = self.pool.get().await?;
            let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
            if reply != "PONG" {
                return Err(anyhow!("unexpected PING reply: {}", reply));
            }
            Ok(())
        })
        .await
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub ping_timeout: Duration,
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            ping_timeout: Duration::from_secs(15),
            backoff_step: Duration::from_secs(2),
        }
    }
}

/// Pings `store` until it answers or the policy is exhausted. The wait
/// after attempt `n` is `n * backoff_step`.
pub async fn wait_until_reachable(store: &dyn SnapshotStore, policy: &RetryPolicy) -> anyhow::Result<()> {
    let mut last_err = anyhow!("no attempts made");

    for attempt in 1..=policy.attempts {
        let started = tokio::time::Instant::now();
        match tokio::time::timeout(policy.ping_timeout, store.ping()).await {
            Ok(Ok(())) => {
                tracing::info!(attempt, took_ms = %started.elapsed().as_millis(), "store reachable");
                return Ok(());
            }
            Ok(Err(e)) => last_err = e,
            Err(_) => last_err = anyhow!("ping timed out after {:?}", policy.ping_timeout),
        }

        if attempt < policy.attempts {
            let wait = policy.backoff_step * attempt;
            tracing::warn!(
                attempt,
                attempts = policy.attempts,
                error = %last_err,
                retry_in_ms = %wait.as_millis(),
                "store unreachable, retrying"
            );
            tokio::time::sleep(wait).await;
        }
    }

    Err(last_err).context(format!("store unreachable after {} attempts", policy.attempts))
}
