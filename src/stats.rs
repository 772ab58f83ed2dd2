use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::errors::LockError;

/// Identifies one configured server for diagnostic purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerId {
    pub index: usize,
    pub addr: String,
}

/// One server's response to one attempt.
#[derive(Debug, Clone)]
pub enum Vote {
    For { count: usize },
    Against(LockError),
}

/// The tally for a single fan-out attempt, shared between the Vote Collector task
/// that owns it and any observer holding a [`StatsHandle`].
#[derive(Debug)]
struct Inner {
    membership: usize,
    quorum: usize,
    votes_for: Vec<ServerId>,
    votes_against: HashMap<ServerId, LockError>,
    complete: bool,
}

impl Inner {
    fn new(membership: usize, quorum: usize) -> Self {
        Inner {
            membership,
            quorum,
            votes_for: Vec::with_capacity(membership),
            votes_against: HashMap::with_capacity(membership),
            complete: false,
        }
    }

    fn settled(&self) -> usize {
        self.votes_for.len() + self.votes_against.len()
    }
}

/// A point-in-time copy of a [`StatsHandle`]'s tally, safe to inspect without
/// touching the underlying lock.
#[derive(Debug, Clone)]
pub struct ExecutionStats {
    pub membership: usize,
    pub quorum: usize,
    pub votes_for: Vec<ServerId>,
    pub votes_against: HashMap<ServerId, LockError>,
}

/// A cheaply-clonable observer handle onto one attempt's in-flight (or settled) tally.
///
/// Cloning shares the same underlying tally; it does not snapshot it. Use
/// [`StatsHandle::snapshot`] for a point-in-time copy.
#[derive(Debug, Clone)]
pub struct StatsHandle {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl StatsHandle {
    pub(crate) fn new(membership: usize, quorum: usize) -> Self {
        StatsHandle {
            inner: Arc::new(Mutex::new(Inner::new(membership, quorum))),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Records a for-vote. Returns `true` exactly once: for the single call whose
    /// insertion makes `votes_for.len()` reach `quorum`. Computing this under the
    /// same critical section as the insertion is what makes "first past the post"
    /// well-defined under concurrent callers — reading the count back separately
    /// after unlocking would race when several votes land in a tight window.
    pub(crate) fn record_for(&self, server: ServerId) -> bool {
        let mut inner = self.inner.lock();
        inner.votes_for.push(server);
        let reached_quorum = inner.votes_for.len() == inner.quorum;
        if inner.settled() == inner.membership {
            inner.complete = true;
            drop(inner);
            self.notify.notify_waiters();
        }
        reached_quorum
    }

    /// Same contract as [`StatsHandle::record_for`], for against-votes.
    pub(crate) fn record_against(&self, server: ServerId, err: LockError) -> bool {
        let mut inner = self.inner.lock();
        inner.votes_against.insert(server, err);
        let reached_quorum = inner.votes_against.len() == inner.quorum;
        if inner.settled() == inner.membership {
            inner.complete = true;
            drop(inner);
            self.notify.notify_waiters();
        }
        reached_quorum
    }

    pub fn quorum(&self) -> usize {
        self.inner.lock().quorum
    }

    pub fn membership(&self) -> usize {
        self.inner.lock().membership
    }

    /// Returns `true` once all `N` votes for this attempt have landed.
    pub fn is_complete(&self) -> bool {
        self.inner.lock().complete
    }

    /// Awaits full settlement of this attempt: all `N` RPCs have terminated.
    /// Resolves immediately if the tally is already complete.
    pub async fn completed(&self) -> ExecutionStats {
        loop {
            let notified = self.notify.notified();
            if self.is_complete() {
                return self.snapshot();
            }
            notified.await;
        }
    }

    /// A point-in-time copy of the current tally.
    pub fn snapshot(&self) -> ExecutionStats {
        let inner = self.inner.lock();
        ExecutionStats {
            membership: inner.membership,
            quorum: inner.quorum,
            votes_for: inner.votes_for.clone(),
            votes_against: inner.votes_against.clone(),
        }
    }
}

/// The outcome of one attempt: which way the quorum broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    For,
    Against,
}

/// Bundle returned from a successful multi-attempt operation.
///
/// `start` is the decisive attempt's start time, in milliseconds since the process
/// epoch (see `util::now_ms`) — the same clock `Lock::expiration` is expressed in,
/// so the Lock Manager can compute the drift-adjusted expiration directly from it.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub attempts: Vec<StatsHandle>,
    pub start: i64,
}
