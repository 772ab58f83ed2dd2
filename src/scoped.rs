use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::config::Settings;
use crate::errors::{LockError, LockResult};
use crate::manager::{Lock, LockManager};
use crate::util::now_ms;

/// Handed to a `using()` routine. Passive by design: the routine (or whatever it
/// hands the signal down to) must poll [`CancellationSignal::aborted`] itself —
/// abortion never forcibly terminates the routine.
#[derive(Clone)]
pub struct CancellationSignal {
    aborted: Arc<AtomicBool>,
    error: Arc<Mutex<Option<LockError>>>,
}

impl CancellationSignal {
    fn new() -> Self {
        CancellationSignal {
            aborted: Arc::new(AtomicBool::new(false)),
            error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// The error that caused abortion, if any. Cleared only by constructing a new
    /// signal (i.e. never, once set, for the lifetime of one `using()` call).
    pub fn error(&self) -> Option<LockError> {
        self.error.lock().clone()
    }

    fn abort(&self, err: LockError) {
        *self.error.lock() = Some(err);
        self.aborted.store(true, Ordering::Release);
    }
}

/// Handed to a `using()` routine alongside the [`CancellationSignal`]: a live view of
/// the lease, refreshed each time the auto-extension loop succeeds.
#[derive(Clone)]
pub struct UsingContext {
    lock: Arc<Mutex<Lock>>,
}

impl UsingContext {
    /// The most recently extended `Lock`. Cloning a `Lock` is cheap (an `Arc` back
    /// to the manager plus small owned fields); reading this repeatedly from inside
    /// a long routine always sees the latest extension.
    pub fn current_lock(&self) -> Lock {
        self.lock.lock().clone()
    }
}

/// Internal stop signal for the extension loop, distinct from [`CancellationSignal`]:
/// this one is set by `using()` on every exit path (success or failure), the other is
/// set only when an extension permanently fails. Using a persisted flag in addition
/// to `Notify` matters here: `Notify::notify_waiters` only wakes futures that already
/// exist, so a stop requested while the loop is mid-extend (not currently awaiting
/// the `Notify`) would otherwise go unseen until the next scheduled wakeup.
struct StopSignal {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    fn new() -> Arc<Self> {
        Arc::new(StopSignal {
            stopped: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Acquires a lock, runs `routine` while keeping the lease alive via a background
/// auto-extension loop, and guarantees release on every exit path.
///
/// `routine` returns `LockResult<T>` rather than a bare `T` so a routine failure and
/// a release failure on exit can both be reported instead of one silently
/// overwriting the other (see [`LockError::UsingFailed`]).
pub async fn using<F, Fut, T>(
    manager: &Arc<LockManager>,
    resources: &[String],
    duration_ms: i64,
    overrides: Option<Settings>,
    routine: F,
) -> LockResult<T>
where
    F: FnOnce(CancellationSignal, UsingContext) -> Fut,
    Fut: Future<Output = LockResult<T>>,
{
    Settings::validate_duration(duration_ms)?;
    let settings = overrides.unwrap_or_else(|| manager.settings().clone());
    settings.validate_extension_threshold(duration_ms)?;

    let lock = manager.acquire(resources, duration_ms, Some(&settings)).await?;
    let shared_lock = Arc::new(Mutex::new(lock));
    let signal = CancellationSignal::new();
    let stop = StopSignal::new();

    let extension_task = spawn_extension_loop(
        manager.clone(),
        shared_lock.clone(),
        settings.clone(),
        duration_ms,
        signal.clone(),
        stop.clone(),
    );

    let context = UsingContext {
        lock: shared_lock.clone(),
    };
    let routine_result = routine(signal, context).await;

    stop.stop();
    let _ = extension_task.await;

    let current = shared_lock.lock().clone();
    let release_result = manager.release(&current, Some(&settings)).await;

    match (routine_result, release_result) {
        (Ok(value), Ok(_)) => Ok(value),
        (Ok(_), Err(release_error)) => {
            warn!(error = %release_error, "using(): release failed on exit");
            Err(LockError::UsingFailed {
                routine_error: None,
                release_error: Box::new(release_error),
            })
        }
        (Err(routine_error), Ok(_)) => Err(routine_error),
        (Err(routine_error), Err(release_error)) => {
            warn!(error = %release_error, "using(): release also failed after routine error");
            Err(LockError::UsingFailed {
                routine_error: Some(Box::new(routine_error)),
                release_error: Box::new(release_error),
            })
        }
    }
}

fn spawn_extension_loop(
    manager: Arc<LockManager>,
    shared_lock: Arc<Mutex<Lock>>,
    settings: Settings,
    duration_ms: i64,
    signal: CancellationSignal,
    stop: Arc<StopSignal>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if stop.is_stopped() {
                return;
            }

            let expiration = shared_lock.lock().expiration();
            if expiration == 0 {
                return;
            }

            let fire_at_ms = expiration - settings.automatic_extension_threshold_ms;
            let delay_ms = (fire_at_ms - now_ms()).max(0) as u64;

            tokio::select! {
                _ = sleep(Duration::from_millis(delay_ms)) => {}
                _ = stop.notify.notified() => return,
            }

            if stop.is_stopped() {
                return;
            }

            loop {
                if stop.is_stopped() {
                    return;
                }

                let current = shared_lock.lock().clone();
                match manager
                    .extend_cancellable(&current, duration_ms, Some(&settings), &stop.notify)
                    .await
                {
                    Ok(new_lock) => {
                        debug!(value = %new_lock.value(), "auto-extended lock");
                        *shared_lock.lock() = new_lock;
                        break;
                    }
                    Err(err) => {
                        if current.expiration() > now_ms() {
                            continue;
                        }
                        warn!(error = %err, "auto-extension failed past expiration, aborting");
                        signal.abort(err);
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc as StdArc;

    use super::*;
    use crate::adapter::fake::{FakeAdapter, FakeBehavior};
    use crate::manager::LockManager;

    fn manager_with(behavior: FakeBehavior, n: usize) -> StdArc<LockManager> {
        let servers: Vec<(String, StdArc<dyn crate::adapter::ServerOps>)> = (0..n)
            .map(|i| {
                (
                    format!("redis://server-{i}"),
                    StdArc::new(FakeAdapter::new(behavior.clone()))
                        as StdArc<dyn crate::adapter::ServerOps>,
                )
            })
            .collect();
        LockManager::from_adapters(servers, None).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn using_rejects_threshold_too_close_to_duration() {
        let manager = manager_with(FakeBehavior::Stateful, 1);
        let mut settings = Settings::default();
        settings.automatic_extension_threshold_ms = 950;
        let result = using(
            &manager,
            &["x".to_string()],
            1000,
            Some(settings),
            |_signal, _ctx| async { Ok::<_, LockError>(()) },
        )
        .await;
        assert!(matches!(result, Err(LockError::InvalidArgument { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn using_releases_on_normal_exit() {
        let manager = manager_with(FakeBehavior::Stateful, 1);
        let mut settings = Settings::default();
        settings.automatic_extension_threshold_ms = 200;

        let output = using(
            &manager,
            &["x".to_string()],
            500,
            Some(settings),
            |signal, _ctx| async move {
                assert!(!signal.aborted());
                Ok::<_, LockError>(42)
            },
        )
        .await
        .unwrap();
        assert_eq!(output, 42);

        // Released: a fresh acquire of the same resource must succeed immediately.
        let relock = manager.acquire(&["x".to_string()], 500, None).await;
        assert!(relock.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn using_auto_extends_across_a_long_routine() {
        let manager = manager_with(FakeBehavior::Stateful, 1);
        let mut settings = Settings::default();
        settings.automatic_extension_threshold_ms = 200;
        let expirations = StdArc::new(Mutex::new((0i64, 0i64)));
        let expirations_clone = expirations.clone();

        let output = using(
            &manager,
            &["x".to_string()],
            500,
            Some(settings),
            move |signal, ctx| async move {
                let initial_value = ctx.current_lock().value().to_string();
                expirations_clone.lock().0 = ctx.current_lock().expiration();
                tokio::time::sleep(Duration::from_millis(700)).await;
                assert!(!signal.aborted());
                let final_lock = ctx.current_lock();
                // The lock value never changes across an extend, only its expiration.
                assert_eq!(final_lock.value(), initial_value);
                expirations_clone.lock().1 = final_lock.expiration();
                Ok::<_, LockError>(())
            },
        )
        .await;

        assert!(output.is_ok());
        let (before, after) = *expirations.lock();
        assert!(after > before, "expected at least one extension to have pushed the expiration forward");
    }
}
