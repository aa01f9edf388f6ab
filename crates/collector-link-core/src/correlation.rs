//! Correlation table pairing in-flight requests with their results.
//!
//! Every registered id resolves exactly once: on completion, cancellation, or
//! deadline expiry (from the background sweep or the waiter itself). Entries
//! are removed the moment their result is delivered.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{sync::oneshot, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::LinkError;

/// Unique token pairing a request to its result.
pub type CorrelationId = Uuid;

struct Pending<T> {
    deadline: Instant,
    timeout: Duration,
    tx: oneshot::Sender<Result<T, LinkError>>,
}

/// Table of outstanding requests.
pub struct CorrelationTable<T> {
    entries: Mutex<HashMap<CorrelationId, Pending<T>>>,
}

impl<T> Default for CorrelationTable<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Send + 'static> CorrelationTable<T> {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationId, Pending<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an id that must resolve within `timeout`.
    ///
    /// # Errors
    /// Returns `LinkError::Configuration` if the id is already outstanding.
    pub fn register(
        self: &Arc<Self>,
        id: CorrelationId,
        timeout: Duration,
    ) -> Result<PendingResult<T>, LinkError> {
        let deadline = Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();

        let mut entries = self.lock();
        if entries.contains_key(&id) {
            return Err(LinkError::Configuration(format!(
                "correlation id {id} is already in flight"
            )));
        }
        entries.insert(
            id,
            Pending {
                deadline,
                timeout,
                tx,
            },
        );
        drop(entries);

        Ok(PendingResult {
            id,
            deadline,
            timeout,
            rx,
            table: Arc::clone(self),
        })
    }

    /// Deliver a result. Returns `false` if the id was already resolved.
    pub fn complete(&self, id: CorrelationId, result: Result<T, LinkError>) -> bool {
        let Some(pending) = self.lock().remove(&id) else {
            return false;
        };
        // The waiter may be gone; the entry is removed either way.
        let _ = pending.tx.send(result);
        true
    }

    /// Resolve an outstanding id with `Cancelled`.
    pub fn cancel(&self, id: CorrelationId) -> bool {
        self.complete(id, Err(LinkError::Cancelled))
    }

    /// Resolve an outstanding id with `Timeout` if it is still pending.
    pub fn expire(&self, id: CorrelationId) -> bool {
        let Some(pending) = self.lock().remove(&id) else {
            return false;
        };
        let _ = pending.tx.send(Err(LinkError::Timeout(pending.timeout)));
        true
    }

    /// Resolve every entry whose deadline is at or before `now`.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<Pending<T>> = {
            let mut entries = self.lock();
            let ids: Vec<CorrelationId> = entries
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };

        let count = expired.len();
        for pending in expired {
            let _ = pending.tx.send(Err(LinkError::Timeout(pending.timeout)));
        }
        if count > 0 {
            tracing::debug!(count, "Expired pending requests");
        }
        count
    }

    /// Run `sweep_expired` every `period` until `shutdown` is cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        table.sweep_expired(Instant::now());
                    }
                }
            }
        })
    }

    /// Drop an entry without delivering anything.
    fn discard(&self, id: CorrelationId) {
        self.lock().remove(&id);
    }

    /// Number of outstanding ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Caller side of a registered id.
///
/// Dropping it without waiting removes the entry.
pub struct PendingResult<T: Send + 'static> {
    id: CorrelationId,
    deadline: Instant,
    timeout: Duration,
    rx: oneshot::Receiver<Result<T, LinkError>>,
    table: Arc<CorrelationTable<T>>,
}

impl<T: Send + 'static> PendingResult<T> {
    /// The correlation id.
    #[must_use]
    pub const fn id(&self) -> CorrelationId {
        self.id
    }

    /// Absolute deadline.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the result; resolves with `Timeout` once the deadline passes.
    pub async fn wait(mut self) -> Result<T, LinkError> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LinkError::Cancelled),
            Err(_) => {
                // Lazy expiry; a concurrent completion may have won the race.
                self.table.expire(self.id);
                self.rx
                    .try_recv()
                    .unwrap_or(Err(LinkError::Timeout(self.timeout)))
            }
        }
    }
}

impl<T: Send + 'static> Drop for PendingResult<T> {
    fn drop(&mut self) {
        self.table.discard(self.id);
    }
}
