//! Distributed lock service over the shared Redis store.
//!
//! Locks are leases: `SET lock:{resource} <value> NX PX <lease>` with a
//! compare-value Lua release so an expired-and-reacquired lease is never
//! deleted by the previous holder. While a task holds the lease a background
//! extender renews it shortly before expiry; if renewal fails the task is
//! aborted at its next suspension point.

use rand::Rng;
use redis::aio::ConnectionManager as RedisConnectionManager;
use redis::Script;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::models::generate_id;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lease duration for each acquisition.
    pub lease: Duration,
    /// Renew the lease when this much of it remains.
    pub extend_threshold: Duration,
    /// Acquisition retries after the first attempt.
    pub max_retries: u32,
    /// Base delay between acquisition attempts.
    pub retry_delay: Duration,
    /// Uniform jitter applied to `retry_delay` in both directions.
    pub retry_jitter: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(10),
            extend_threshold: Duration::from_millis(500),
            max_retries: 10,
            retry_delay: Duration::from_millis(200),
            retry_jitter: Duration::from_millis(100),
        }
    }
}

/// Resource-scoped mutual exclusion across all nodes sharing the store.
#[derive(Clone)]
pub struct Locks {
    redis: RedisConnectionManager,
    config: LockConfig,
}

impl Locks {
    #[must_use]
    pub fn new(redis: RedisConnectionManager, config: LockConfig) -> Self {
        Self { redis, config }
    }

    /// Acquire the lease once. Returns the holder value, or `None` when the
    /// lock is held elsewhere.
    pub async fn acquire(&self, resource: &str) -> Result<Option<String>> {
        let lock_key = format!("lock:{resource}");
        let lock_value = generate_id();

        let mut conn = self.redis.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(&lock_key)
            .arg(&lock_value)
            .arg("NX")
            .arg("PX")
            .arg(self.config.lease.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        if result.is_some() {
            tracing::debug!(lock_key = %lock_key, "Lock acquired");
            Ok(Some(lock_value))
        } else {
            tracing::debug!(lock_key = %lock_key, "Lock already held");
            Ok(None)
        }
    }

    /// Release the lease. Only the holder (matching `lock_value`) releases.
    pub async fn release(&self, resource: &str, lock_value: &str) -> Result<bool> {
        let lock_key = format!("lock:{resource}");

        let script = Script::new(
            r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("DEL", KEYS[1])
            else
                return 0
            end
            "#,
        );

        let mut conn = self.redis.clone();
        let result: i32 = script
            .key(&lock_key)
            .arg(lock_value)
            .invoke_async(&mut conn)
            .await?;

        Ok(result == 1)
    }

    /// Extend the lease TTL if still held by `lock_value`.
    pub async fn extend(&self, resource: &str, lock_value: &str) -> Result<bool> {
        let lock_key = format!("lock:{resource}");

        let script = Script::new(
            r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("PEXPIRE", KEYS[1], ARGV[2])
            else
                return 0
            end
            "#,
        );

        let mut conn = self.redis.clone();
        let result: i32 = script
            .key(&lock_key)
            .arg(lock_value)
            .arg(self.config.lease.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        Ok(result == 1)
    }

    /// Run `task` with the lease held, retrying acquisition up to the
    /// configured bound. The lease is renewed in the background; if renewal
    /// fails (store lost, lease stolen) the task fails with `LockAborted` at
    /// its next suspension point. The lease is always released afterwards.
    pub async fn with_lock<F, Fut, T>(&self, resource: &str, task: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut lock_value = None;
        for attempt in 0..=self.config.max_retries {
            if let Some(value) = self.acquire(resource).await? {
                lock_value = Some(value);
                break;
            }
            if attempt < self.config.max_retries {
                tokio::time::sleep(self.jittered_retry_delay()).await;
            }
        }
        let lock_value =
            lock_value.ok_or_else(|| Error::LockBusy(resource.to_string()))?;

        self.run_guarded(resource, lock_value, task).await
    }

    /// Single-attempt variant: `Ok(None)` when the lock is busy.
    pub async fn try_with_lock<F, Fut, T>(&self, resource: &str, task: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Some(lock_value) = self.acquire(resource).await? else {
            return Ok(None);
        };

        self.run_guarded(resource, lock_value, task).await.map(Some)
    }

    async fn run_guarded<F, Fut, T>(&self, resource: &str, lock_value: String, task: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let abort = CancellationToken::new();
        let extender = tokio::spawn(Self::extend_loop(
            self.clone(),
            resource.to_string(),
            lock_value.clone(),
            abort.clone(),
        ));

        let result = tokio::select! {
            r = task() => r,
            () = abort.cancelled() => Err(Error::LockAborted(resource.to_string())),
        };

        // Extension errors past this point are teardown noise, not failures.
        extender.abort();
        if let Err(e) = self.release(resource, &lock_value).await {
            tracing::debug!(resource = %resource, error = %e, "Lock release failed during teardown");
        }

        result
    }

    async fn extend_loop(
        locks: Self,
        resource: String,
        lock_value: String,
        abort: CancellationToken,
    ) {
        let renew_after = locks
            .config
            .lease
            .saturating_sub(locks.config.extend_threshold);

        loop {
            tokio::time::sleep(renew_after).await;
            match locks.extend(&resource, &lock_value).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(resource = %resource, "Lock lease lost, aborting holder task");
                    abort.cancel();
                    return;
                }
                Err(e) => {
                    tracing::warn!(resource = %resource, error = %e, "Lock extension failed, aborting holder task");
                    abort.cancel();
                    return;
                }
            }
        }
    }

    fn jittered_retry_delay(&self) -> Duration {
        let base = self.config.retry_delay.as_millis() as i64;
        let jitter = self.config.retry_jitter.as_millis() as i64;
        let offset = if jitter > 0 {
            rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            0
        };
        Duration::from_millis((base + offset).max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> LockConfig {
        LockConfig {
            lease: Duration::from_secs(2),
            extend_threshold: Duration::from_millis(500),
            max_retries: 2,
            retry_delay: Duration::from_millis(50),
            retry_jitter: Duration::from_millis(20),
        }
    }

    async fn test_locks() -> Locks {
        let client = redis::Client::open("redis://localhost:6379").unwrap();
        let redis = RedisConnectionManager::new(client).await.unwrap();
        Locks::new(redis, test_config())
    }

    #[test]
    fn test_jitter_bounds() {
        let locks_config = LockConfig::default();
        let base = locks_config.retry_delay.as_millis() as u64;
        let jitter = locks_config.retry_jitter.as_millis() as u64;
        // Construction without a live connection is not possible, so check
        // the arithmetic directly: jittered delays stay within base ± jitter.
        for _ in 0..100 {
            let offset = rand::thread_rng().gen_range(-(jitter as i64)..=jitter as i64);
            let delay = (base as i64 + offset).max(0) as u64;
            assert!(delay >= base - jitter && delay <= base + jitter);
        }
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_acquire_release_cycle() {
        let locks = test_locks().await;

        let value = locks.acquire("test:lk1").await.unwrap().unwrap();
        assert!(locks.acquire("test:lk1").await.unwrap().is_none());
        assert!(locks.release("test:lk1", &value).await.unwrap());
        assert!(locks.acquire("test:lk1").await.unwrap().is_some());

        let held = locks.acquire("test:lk1").await.unwrap();
        assert!(held.is_none());
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_with_lock_serializes() {
        let locks = test_locks().await;

        let result = locks
            .with_lock("test:lk2", || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, Error>(7)
            })
            .await
            .unwrap();
        assert_eq!(result, 7);

        // Released: immediate re-acquisition succeeds.
        let value = locks.acquire("test:lk2").await.unwrap();
        assert!(value.is_some());
        locks.release("test:lk2", &value.unwrap()).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_try_with_lock_busy() {
        let locks = test_locks().await;

        let value = locks.acquire("test:lk3").await.unwrap().unwrap();
        let busy = locks
            .try_with_lock("test:lk3", || async { Ok::<_, Error>(1) })
            .await
            .unwrap();
        assert!(busy.is_none());

        locks.release("test:lk3", &value).await.unwrap();
        let free = locks
            .try_with_lock("test:lk3", || async { Ok::<_, Error>(1) })
            .await
            .unwrap();
        assert_eq!(free, Some(1));
    }
}
