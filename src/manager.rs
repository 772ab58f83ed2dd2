use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::adapter::{ServerAdapter, ServerOps};
use crate::collector::ServerCall;
use crate::config::{ServerConfig, Settings};
use crate::errors::{LockError, LockResult};
use crate::events::{EventBus, LockEvent};
use crate::retry::{run_with_retry, run_with_retry_cancellable};
use crate::stats::{ServerId, StatsHandle};
use crate::util::{now_ms, random_lock_value};

/// A tombstoned lock's expiration. Once set, the Lock instance must not be reused
/// to derive a new lock (see `Lock::is_tombstoned`).
const TOMBSTONE: i64 = 0;

/// Owns the quorum of [`ServerAdapter`]s and exposes the public acquire/extend/release
/// surface. Does not track outstanding [`Lock`]s — a `Lock` holds a back-reference to
/// its manager purely for the sugar methods `Lock::extend`/`Lock::release`.
pub struct LockManager {
    servers: Vec<(ServerId, Arc<dyn ServerOps>)>,
    settings: Settings,
    events: Arc<EventBus>,
}

impl LockManager {
    /// Connects to every configured server and builds the manager. Rejects an empty
    /// server list synchronously, before attempting any connection.
    pub async fn new(
        servers: Vec<ServerConfig>,
        settings: Option<Settings>,
    ) -> LockResult<Arc<Self>> {
        if servers.is_empty() {
            return Err(LockError::invalid_argument(
                "LockManager requires at least one server",
            ));
        }

        let mut connected: Vec<(ServerId, Arc<dyn ServerOps>)> = Vec::with_capacity(servers.len());
        for (index, server) in servers.into_iter().enumerate() {
            let addr = server.addr.clone();
            let adapter = ServerAdapter::connect(addr.clone()).await?;
            connected.push((ServerId { index, addr }, Arc::new(adapter) as Arc<dyn ServerOps>));
        }

        Ok(Arc::new(LockManager {
            servers: connected,
            settings: settings.unwrap_or_default(),
            events: Arc::new(EventBus::new()),
        }))
    }

    /// Builds a manager from already-constructed adapters, bypassing any network
    /// connection. Used by tests (with [`crate::adapter::fake::FakeAdapter`]) and by
    /// callers who want to manage their own `redis::Client`/connection lifecycle.
    pub fn from_adapters(
        servers: Vec<(String, Arc<dyn ServerOps>)>,
        settings: Option<Settings>,
    ) -> LockResult<Arc<Self>> {
        if servers.is_empty() {
            return Err(LockError::invalid_argument(
                "LockManager requires at least one server",
            ));
        }

        let servers = servers
            .into_iter()
            .enumerate()
            .map(|(index, (addr, adapter))| (ServerId { index, addr }, adapter))
            .collect();

        Ok(Arc::new(LockManager {
            servers,
            settings: settings.unwrap_or_default(),
            events: Arc::new(EventBus::new()),
        }))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn membership(&self) -> usize {
        self.servers.len()
    }

    /// Subscribes to the adapter-level error event stream. Unread events on an
    /// unheld receiver are simply dropped by the broadcast channel (lagged), never
    /// fatal to the host.
    pub fn subscribe_errors(&self) -> tokio::sync::broadcast::Receiver<LockEvent> {
        self.events.subscribe()
    }

    fn resolved_settings(&self, overrides: Option<&Settings>) -> Settings {
        overrides.cloned().unwrap_or_else(|| self.settings.clone())
    }

    /// Acquires exclusive hold of every named resource for `duration_ms` milliseconds.
    pub async fn acquire(
        self: &Arc<Self>,
        resources: &[String],
        duration_ms: i64,
        overrides: Option<&Settings>,
    ) -> LockResult<Lock> {
        Settings::validate_duration(duration_ms)?;
        let settings = self.resolved_settings(overrides);
        let value = random_lock_value();
        let db = settings.normalized_db();
        let keys: Vec<String> = resources.to_vec();

        let call = acquire_call(db, value.clone(), keys.clone(), duration_ms);

        match run_with_retry(&self.servers, self.events.clone(), &settings, call).await {
            Ok(result) => {
                let drift = (settings.drift_factor * duration_ms as f64).round() as i64 + 2;
                let expiration = result.start + duration_ms - drift;
                Ok(Lock::new(
                    self.clone(),
                    keys,
                    value,
                    expiration,
                    result.attempts,
                    overrides.cloned(),
                ))
            }
            Err(err) => {
                self.best_effort_release(&keys, &value, db).await;
                Err(err)
            }
        }
    }

    /// Extends `lock`'s lease by `duration_ms` milliseconds, returning a fresh `Lock`.
    /// The old `lock` is left valid if this fails.
    pub async fn extend(
        self: &Arc<Self>,
        lock: &Lock,
        duration_ms: i64,
        overrides: Option<&Settings>,
    ) -> LockResult<Lock> {
        Settings::validate_duration(duration_ms)?;
        if lock.expiration() < now_ms() {
            return Err(LockError::execution_failed(
                "cannot extend an already-expired lock",
                Vec::new(),
            ));
        }

        let settings = self.resolved_settings(overrides);
        let db = settings.normalized_db();
        let value = lock.value.clone();
        let keys = lock.resources.clone();

        let call = extend_call(db, value.clone(), keys.clone(), duration_ms);
        let result = run_with_retry(&self.servers, self.events.clone(), &settings, call).await?;

        lock.tombstone();
        let drift = (settings.drift_factor * duration_ms as f64).round() as i64 + 2;
        let expiration = result.start + duration_ms - drift;
        Ok(Lock::new(
            self.clone(),
            keys,
            value,
            expiration,
            result.attempts,
            overrides.cloned(),
        ))
    }

    /// Same contract as [`LockManager::extend`], but the inter-attempt retry sleep
    /// races `cancel` so the Scoped Holder's extension loop can be interrupted the
    /// moment `using()` exits, instead of blocking on a sleep nobody needs anymore.
    pub async fn extend_cancellable(
        self: &Arc<Self>,
        lock: &Lock,
        duration_ms: i64,
        overrides: Option<&Settings>,
        cancel: &tokio::sync::Notify,
    ) -> LockResult<Lock> {
        Settings::validate_duration(duration_ms)?;
        if lock.expiration() < now_ms() {
            return Err(LockError::execution_failed(
                "cannot extend an already-expired lock",
                Vec::new(),
            ));
        }

        let settings = self.resolved_settings(overrides);
        let db = settings.normalized_db();
        let value = lock.value.clone();
        let keys = lock.resources.clone();

        let call = extend_call(db, value.clone(), keys.clone(), duration_ms);
        let result =
            run_with_retry_cancellable(&self.servers, self.events.clone(), &settings, call, cancel)
                .await?;

        lock.tombstone();
        let drift = (settings.drift_factor * duration_ms as f64).round() as i64 + 2;
        let expiration = result.start + duration_ms - drift;
        Ok(Lock::new(
            self.clone(),
            keys,
            value,
            expiration,
            result.attempts,
            overrides.cloned(),
        ))
    }

    /// Releases `lock`. Tombstones it immediately regardless of outcome: the caller
    /// has declared intent to abandon the lease, so if quorum release fails, the
    /// remote TTL is left to expire naturally rather than retried indefinitely.
    pub async fn release(
        self: &Arc<Self>,
        lock: &Lock,
        overrides: Option<&Settings>,
    ) -> LockResult<crate::stats::ExecutionResult> {
        lock.tombstone();
        let settings = self.resolved_settings(overrides);
        let db = settings.normalized_db();
        let call = release_call(db, lock.value.clone(), lock.resources.clone());
        run_with_retry(&self.servers, self.events.clone(), &settings, call).await
    }

    /// Best-effort single-shot release used to reap partial acquisitions after a
    /// failed `acquire`. Never surfaces an error — a failure here just means some
    /// minority server keeps a stale key until its TTL expires.
    async fn best_effort_release(&self, keys: &[String], value: &str, db: i64) {
        let mut cleanup_settings = self.settings.clone();
        cleanup_settings.retry_count = 0;
        let call = release_call(db, value.to_string(), keys.to_vec());
        if let Err(err) = run_with_retry(&self.servers, self.events.clone(), &cleanup_settings, call).await
        {
            warn!(error = %err, "best-effort cleanup release failed after acquire failure");
        }
    }
}

fn acquire_call(db: i64, value: String, keys: Vec<String>, duration_ms: i64) -> ServerCall {
    Arc::new(move |server: Arc<dyn ServerOps>| {
        let value = value.clone();
        let keys = keys.clone();
        Box::pin(async move { server.acquire_one(db, &value, duration_ms, &keys).await })
    })
}

fn extend_call(db: i64, value: String, keys: Vec<String>, duration_ms: i64) -> ServerCall {
    Arc::new(move |server: Arc<dyn ServerOps>| {
        let value = value.clone();
        let keys = keys.clone();
        Box::pin(async move { server.extend_one(db, &value, duration_ms, &keys).await })
    })
}

fn release_call(db: i64, value: String, keys: Vec<String>) -> ServerCall {
    Arc::new(move |server: Arc<dyn ServerOps>| {
        let value = value.clone();
        let keys = keys.clone();
        Box::pin(async move { server.release_one(db, &value, &keys).await })
    })
}

/// A held (or formerly held) lease over one or more resources.
///
/// Identity fields (`resources`, `value`) never change after construction.
/// `expiration` is mutable and monotonically moves toward the tombstone value `0`,
/// set by `release` or by a successful `extend` (which mints a brand new `Lock`
/// instead of mutating this one further).
#[derive(Clone)]
pub struct Lock {
    manager: Arc<LockManager>,
    resources: Vec<String>,
    value: String,
    expiration: Arc<AtomicI64>,
    attempts: Vec<StatsHandle>,
    settings: Option<Settings>,
}

impl Lock {
    fn new(
        manager: Arc<LockManager>,
        resources: Vec<String>,
        value: String,
        expiration: i64,
        attempts: Vec<StatsHandle>,
        settings: Option<Settings>,
    ) -> Self {
        Lock {
            manager,
            resources,
            value,
            expiration: Arc::new(AtomicI64::new(expiration)),
            attempts,
            settings,
        }
    }

    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn attempts(&self) -> &[StatsHandle] {
        &self.attempts
    }

    /// Effective expiration in milliseconds since the process epoch (`util::now_ms`).
    /// `0` means tombstoned.
    pub fn expiration(&self) -> i64 {
        self.expiration.load(Ordering::Acquire)
    }

    pub fn is_tombstoned(&self) -> bool {
        self.expiration() == TOMBSTONE
    }

    fn tombstone(&self) {
        self.expiration.store(TOMBSTONE, Ordering::Release);
    }

    /// Sugar over `LockManager::extend`.
    pub async fn extend(&self, duration_ms: i64) -> LockResult<Lock> {
        self.manager.clone().extend(self, duration_ms, self.settings.as_ref()).await
    }

    /// Sugar over `LockManager::release`.
    pub async fn release(&self) -> LockResult<crate::stats::ExecutionResult> {
        self.manager.clone().release(self, self.settings.as_ref()).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc as StdArc;

    use super::*;
    use crate::adapter::fake::{FakeAdapter, FakeBehavior};

    fn manager_with(behavior: FakeBehavior, n: usize) -> StdArc<LockManager> {
        let servers: Vec<(String, StdArc<dyn ServerOps>)> = (0..n)
            .map(|i| {
                (
                    format!("redis://server-{i}"),
                    StdArc::new(FakeAdapter::new(behavior.clone())) as StdArc<dyn ServerOps>,
                )
            })
            .collect();
        LockManager::from_adapters(servers, None).unwrap()
    }

    #[tokio::test]
    async fn new_rejects_empty_server_list() {
        let result = LockManager::from_adapters(Vec::new(), None);
        assert!(matches!(result, Err(LockError::InvalidArgument { .. })));
    }

    #[tokio::test]
    async fn acquire_rejects_non_positive_duration() {
        let manager = manager_with(FakeBehavior::Stateful, 3);
        let err = manager
            .acquire(&["r".to_string()], 0, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn single_instance_happy_path() {
        let manager = manager_with(FakeBehavior::Stateful, 1);
        let lock = manager
            .acquire(&["resource".to_string()], 1000, None)
            .await
            .unwrap();
        assert_eq!(lock.value().len(), 32);
        assert!(lock.value().chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!lock.is_tombstoned());

        let extended = manager.extend(&lock, 3000, None).await.unwrap();
        assert!(lock.is_tombstoned());
        assert!(!extended.is_tombstoned());
        assert_eq!(extended.value(), lock.value());

        let result = manager.release(&extended, None).await.unwrap();
        assert!(extended.is_tombstoned());
        assert_eq!(result.attempts.len(), 1);
    }

    #[tokio::test]
    async fn overlapping_multi_key_does_not_leak_partial_lock() {
        let manager = manager_with(FakeBehavior::Stateful, 1);
        manager
            .acquire(&["a".to_string(), "b".to_string()], 1000, None)
            .await
            .unwrap();

        let mut settings = manager.settings().clone();
        settings.retry_count = 0;
        let err = manager
            .acquire(&["b".to_string(), "c".to_string()], 1000, Some(&settings))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::ExecutionFailed { .. }));

        // "c" must not remain locked anywhere: a fresh acquire of just "c" succeeds.
        let lock_c = manager.acquire(&["c".to_string()], 1000, None).await;
        assert!(lock_c.is_ok());
    }

    #[tokio::test]
    async fn extend_fails_on_already_expired_lock() {
        let manager = manager_with(FakeBehavior::Stateful, 1);
        let lock = manager
            .acquire(&["r".to_string()], 1000, None)
            .await
            .unwrap();
        lock.expiration.store(1, Ordering::Release); // force into the past
        let err = manager.extend(&lock, 1000, None).await.unwrap_err();
        assert!(matches!(err, LockError::ExecutionFailed { .. }));
    }

    #[tokio::test]
    async fn release_tombstones_even_when_quorum_fails() {
        let manager = manager_with(FakeBehavior::AlwaysAgainstTransport, 3);
        let lock = Lock::new(
            manager.clone(),
            vec!["r".to_string()],
            random_lock_value(),
            now_ms() + 1000,
            Vec::new(),
            None,
        );
        let mut settings = manager.settings().clone();
        settings.retry_count = 0;
        let err = manager.release(&lock, Some(&settings)).await.unwrap_err();
        assert!(matches!(err, LockError::ExecutionFailed { .. }));
        assert!(lock.is_tombstoned());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let manager = manager_with(FakeBehavior::Stateful, 1);
        let lock = manager
            .acquire(&["r".to_string()], 1000, None)
            .await
            .unwrap();
        let first = manager.release(&lock, None).await.unwrap();
        let second = manager.release(&lock, None).await.unwrap();
        assert_eq!(first.attempts[0].snapshot().votes_for.len(), 1);
        assert_eq!(second.attempts[0].snapshot().votes_for.len(), 1);
    }
}
