use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::adapter::ServerOps;
use crate::errors::{LockError, LockResult};
use crate::events::{EventBus, LockEvent};
use crate::stats::{Decision, ServerId, StatsHandle, Vote};

/// One fan-out operation against a single server, abstracted so the collector can
/// drive acquire, extend, and release with the same tallying logic. Takes the owned
/// adapter handle because each invocation runs inside its own `'static` spawned task.
pub type ServerCall =
    Arc<dyn Fn(Arc<dyn ServerOps>) -> BoxFuture<'static, Vote> + Send + Sync>;

fn quorum_for(membership: usize) -> usize {
    membership / 2 + 1
}

/// Fans out one attempt to every configured server and resolves as soon as a quorum
/// is decided either way, while the remaining RPCs keep running in the background
/// until the stats handle's tally completes.
///
/// Per §4.2, an adapter task that panics instead of voting is a contract violation,
/// not a retry-eligible outcome: it aborts the whole operation with
/// [`LockError::Internal`] rather than being folded into the for/against tally.
pub async fn run_attempt(
    servers: &[(ServerId, Arc<dyn ServerOps>)],
    events: Arc<EventBus>,
    call: ServerCall,
) -> LockResult<(Decision, StatsHandle)> {
    let membership = servers.len();
    let quorum = quorum_for(membership);
    let stats = StatsHandle::new(membership, quorum);
    let (decision_tx, decision_rx) = oneshot::channel::<Decision>();
    let decision_tx = Arc::new(Mutex::new(Some(decision_tx)));

    let mut tasks = FuturesUnordered::new();

    for (server_id, server) in servers.iter().cloned() {
        let stats = stats.clone();
        let decision_tx = decision_tx.clone();
        let call = call.clone();
        let events = events.clone();

        tasks.push(tokio::spawn(async move {
            let vote = call(server).await;
            match vote {
                Vote::For { .. } => {
                    if stats.record_for(server_id) {
                        if let Some(tx) = decision_tx.lock().take() {
                            let _ = tx.send(Decision::For);
                        }
                    }
                }
                Vote::Against(err) => {
                    events.publish(LockEvent {
                        server: server_id.clone(),
                        error: err.clone(),
                    });
                    if stats.record_against(server_id, err) {
                        if let Some(tx) = decision_tx.lock().take() {
                            let _ = tx.send(Decision::Against);
                        }
                    }
                }
            }
        }));
    }

    tokio::pin!(decision_rx);
    loop {
        tokio::select! {
            decision = &mut decision_rx => {
                let decision = match decision {
                    Ok(decision) => decision,
                    // The sender was dropped without ever sending, which only happens if
                    // every task finished (cleanly) without either side reaching quorum.
                    Err(_) => {
                        debug!("vote collector attempt resolved without a quorum decision");
                        Decision::Against
                    }
                };
                // The remaining spawned tasks (if any) keep running in the background;
                // dropping `tasks` here does not abort them, only stops us observing them.
                return Ok((decision, stats));
            }
            joined = tasks.next(), if !tasks.is_empty() => {
                if let Some(Err(join_err)) = joined {
                    return Err(LockError::Internal {
                        message: format!("adapter task did not vote: {join_err}"),
                    });
                }
            }
        }
    }
}
