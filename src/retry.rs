use std::sync::Arc;

use rand::Rng;
use tokio::time::{sleep, Duration};
use tracing::{debug, error};

use crate::collector::{run_attempt, ServerCall};
use crate::config::Settings;
use crate::errors::{LockError, LockResult};
use crate::events::EventBus;
use crate::adapter::ServerOps;
use crate::stats::{Decision, ExecutionResult, ServerId, StatsHandle};
use crate::util::now_ms;

/// Drives the Vote Collector across attempts until a quorum succeeds or the retry
/// budget named by `settings.retry_count` is exhausted.
pub async fn run_with_retry(
    servers: &[(ServerId, Arc<dyn ServerOps>)],
    events: Arc<EventBus>,
    settings: &Settings,
    call: ServerCall,
) -> LockResult<ExecutionResult> {
    let max_attempts = settings.max_attempts();
    let mut attempts: Vec<StatsHandle> = Vec::new();
    let mut attempt_number: u64 = 0;

    loop {
        attempt_number += 1;
        let start = now_ms();
        // A panicking adapter task is fatal (§4.2): propagate it immediately instead
        // of folding it into the retry-eligible for/against tally.
        let (decision, stats) = run_attempt(servers, events.clone(), call.clone()).await?;
        attempts.push(stats);

        if decision == Decision::For {
            debug!(attempt = attempt_number, "quorum reached");
            return Ok(ExecutionResult { attempts, start });
        }

        let budget_exhausted = match max_attempts {
            Some(max) => attempt_number >= max,
            None => false,
        };

        if budget_exhausted {
            error!(
                attempts = attempt_number,
                "exhausted retry budget without reaching quorum"
            );
            return Err(LockError::execution_failed(
                format!("failed to reach quorum after {attempt_number} attempt(s)"),
                attempts,
            ));
        }

        sleep(retry_delay(settings)).await;
    }
}

/// Same protocol, but the inter-attempt sleep races a cancellation signal so the
/// Scoped Holder's extension loop can be interrupted by `using()` exiting early.
pub async fn run_with_retry_cancellable(
    servers: &[(ServerId, Arc<dyn ServerOps>)],
    events: Arc<EventBus>,
    settings: &Settings,
    call: ServerCall,
    cancel: &tokio::sync::Notify,
) -> LockResult<ExecutionResult> {
    let max_attempts = settings.max_attempts();
    let mut attempts: Vec<StatsHandle> = Vec::new();
    let mut attempt_number: u64 = 0;

    loop {
        attempt_number += 1;
        let start = now_ms();
        let (decision, stats) = run_attempt(servers, events.clone(), call.clone()).await?;
        attempts.push(stats);

        if decision == Decision::For {
            return Ok(ExecutionResult { attempts, start });
        }

        let budget_exhausted = match max_attempts {
            Some(max) => attempt_number >= max,
            None => false,
        };

        if budget_exhausted {
            return Err(LockError::execution_failed(
                format!("failed to reach quorum after {attempt_number} attempt(s)"),
                attempts,
            ));
        }

        tokio::select! {
            _ = sleep(retry_delay(settings)) => {}
            _ = cancel.notified() => {
                return Err(LockError::execution_failed(
                    "retry loop cancelled before reaching quorum",
                    attempts,
                ));
            }
        }
    }
}

fn retry_delay(settings: &Settings) -> Duration {
    let jitter = if settings.retry_jitter_ms <= 0 {
        0
    } else {
        rand::thread_rng().gen_range(-settings.retry_jitter_ms..=settings.retry_jitter_ms)
    };
    let delay_ms = (settings.retry_delay_ms + jitter).max(0);
    Duration::from_millis(delay_ms as u64)
}
