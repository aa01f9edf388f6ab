//! Subscription registry: topic to ordered handler list.
//!
//! The registry outlives channel connections. Handlers are called outside the
//! lock; a failing or panicking handler is logged and skipped.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::event::Event;

/// Error returned by a handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives events for one subscription.
pub trait EventHandler: Send + Sync {
    /// Handle one event.
    ///
    /// # Errors
    /// Errors are logged by the dispatcher and do not affect other handlers.
    fn on_event(&self, event: &Event) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync,
{
    fn on_event(&self, event: &Event) -> Result<(), HandlerError> {
        (self.0)(event)
    }
}

/// The receiving half of a queue subscription was dropped.
#[derive(Debug, thiserror::Error)]
#[error("subscription queue receiver dropped")]
struct ReceiverGone;

/// Forwards events into a bounded queue for callers that poll.
///
/// The channel holds one slot more than the caller asked for. Updates never
/// take that last slot, so a connection-lost notice always fits.
struct QueueHandler {
    tx: mpsc::Sender<Event>,
    /// Serializes the capacity check with the send.
    gate: Mutex<()>,
}

impl EventHandler for QueueHandler {
    fn on_event(&self, event: &Event) -> Result<(), HandlerError> {
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if self.tx.is_closed() {
            return Err(Box::new(ReceiverGone));
        }
        if !event.is_connection_lost() && self.tx.capacity() <= 1 {
            return Err("subscription queue is full".into());
        }
        match self.tx.try_send(event.clone()) {
            Ok(()) => Ok(()),
            // Only a notice can take the reserved slot, so one is still unread.
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(topic = %event.topic, "Connection lost notice already queued");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Box::new(ReceiverGone)),
        }
    }
}

/// Subscription identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Public view of a registered subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub topic: String,
    /// Monotonic registration order.
    pub order: u64,
}

/// Outcome of `subscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registered {
    pub id: SubscriptionId,
    /// True if no other live subscription had this topic.
    pub first_for_topic: bool,
}

/// Outcome of `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removed {
    pub topic: String,
    /// True if this was the topic's last subscription.
    pub last_for_topic: bool,
}

/// Counts from one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
    /// Queue subscriptions dropped because their receiver was gone.
    pub removed: usize,
}

struct Entry {
    info: SubscriptionInfo,
    handler: Arc<dyn EventHandler>,
}

#[derive(Default)]
struct Inner {
    next_order: u64,
    entries: Vec<Entry>,
}

/// Thread-safe subscription registry.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<Inner>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler for a topic.
    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Registered {
        let topic = topic.into();
        let mut inner = self.lock();
        let first_for_topic = !inner.entries.iter().any(|e| e.info.topic == topic);
        let order = inner.next_order;
        inner.next_order += 1;

        let id = SubscriptionId(Uuid::new_v4());
        tracing::debug!(%id, topic = %topic, order, "Subscription registered");
        inner.entries.push(Entry {
            info: SubscriptionInfo { id, topic, order },
            handler,
        });
        Registered {
            id,
            first_for_topic,
        }
    }

    /// Register a closure handler.
    pub fn subscribe_fn<F>(&self, topic: impl Into<String>, handler: F) -> Registered
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe(topic, Arc::new(FnHandler(handler)))
    }

    /// Register a bounded queue.
    ///
    /// Updates that do not fit in `capacity` are logged and dropped. A
    /// connection-lost notice is always delivered. Dropping the receiver
    /// removes the subscription on the next delivery attempt.
    pub fn subscribe_queue(
        &self,
        topic: impl Into<String>,
        capacity: usize,
    ) -> (Registered, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1) + 1);
        let handler = QueueHandler {
            tx,
            gate: Mutex::new(()),
        };
        (self.subscribe(topic, Arc::new(handler)), rx)
    }

    /// Remove a subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Option<Removed> {
        let mut inner = self.lock();
        let index = inner.entries.iter().position(|e| e.info.id == id)?;
        let entry = inner.entries.remove(index);
        let topic = entry.info.topic;
        let last_for_topic = !inner.entries.iter().any(|e| e.info.topic == topic);
        tracing::debug!(%id, topic = %topic, "Subscription removed");
        Some(Removed {
            topic,
            last_for_topic,
        })
    }

    /// Distinct topics ordered by their earliest live registration.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let inner = self.lock();
        let mut topics: Vec<String> = Vec::new();
        for entry in &inner.entries {
            if !topics.contains(&entry.info.topic) {
                topics.push(entry.info.topic.clone());
            }
        }
        topics
    }

    /// Snapshot of all live subscriptions in registration order.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.lock().entries.iter().map(|e| e.info.clone()).collect()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether no subscription is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Deliver an event to every handler of its topic, in registration order.
    pub fn dispatch(&self, event: &Event) -> DispatchReport {
        let handlers: Vec<(SubscriptionId, Arc<dyn EventHandler>)> = self
            .lock()
            .entries
            .iter()
            .filter(|e| e.info.topic == event.topic)
            .map(|e| (e.info.id, Arc::clone(&e.handler)))
            .collect();

        let mut report = DispatchReport::default();
        let mut gone = Vec::new();
        for (id, handler) in handlers {
            report.record(id, invoke(id, handler.as_ref(), event), &mut gone);
        }
        report.removed = self.prune(&gone);
        report
    }

    /// Tell every live subscription that the channel is gone for good.
    pub fn notify_connection_lost(&self, attempts: u32, reason: &str) -> DispatchReport {
        let targets: Vec<(SubscriptionInfo, Arc<dyn EventHandler>)> = self
            .lock()
            .entries
            .iter()
            .map(|e| (e.info.clone(), Arc::clone(&e.handler)))
            .collect();

        let mut report = DispatchReport::default();
        let mut gone = Vec::new();
        for (info, handler) in targets {
            let event = Event::connection_lost(info.topic, attempts, reason);
            report.record(info.id, invoke(info.id, handler.as_ref(), &event), &mut gone);
        }
        report.removed = self.prune(&gone);
        report
    }

    fn prune(&self, ids: &[SubscriptionId]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|e| !ids.contains(&e.info.id));
        let removed = before - inner.entries.len();
        drop(inner);
        tracing::debug!(removed, "Removed subscriptions with dropped receivers");
        removed
    }
}

enum Outcome {
    Delivered,
    Failed,
    Gone,
}

impl DispatchReport {
    fn record(&mut self, id: SubscriptionId, outcome: Outcome, gone: &mut Vec<SubscriptionId>) {
        match outcome {
            Outcome::Delivered => self.delivered += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Gone => gone.push(id),
        }
    }
}

fn invoke(id: SubscriptionId, handler: &dyn EventHandler, event: &Event) -> Outcome {
    match catch_unwind(AssertUnwindSafe(|| handler.on_event(event))) {
        Ok(Ok(())) => Outcome::Delivered,
        Ok(Err(e)) if e.is::<ReceiverGone>() => Outcome::Gone,
        Ok(Err(e)) => {
            tracing::warn!(
                subscription = %id,
                topic = %event.topic,
                error = %e,
                "Event handler failed"
            );
            Outcome::Failed
        }
        Err(_) => {
            tracing::error!(subscription = %id, topic = %event.topic, "Event handler panicked");
            Outcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::event::EventKind;

    #[test]
    fn test_topics_follow_registration_order() {
        let registry = SubscriptionRegistry::new();
        let a = registry.subscribe_fn("topicA", |_| Ok(()));
        let b = registry.subscribe_fn("topicB", |_| Ok(()));
        let a2 = registry.subscribe_fn("topicA", |_| Ok(()));

        assert!(a.first_for_topic);
        assert!(b.first_for_topic);
        assert!(!a2.first_for_topic);
        assert_eq!(registry.topics(), vec!["topicA", "topicB"]);

        let orders: Vec<u64> = registry.subscriptions().iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![0, 1, 2]);
    }

    #[test]
    fn test_unsubscribe_reports_last_for_topic() {
        let registry = SubscriptionRegistry::new();
        let a = registry.subscribe_fn("hunts", |_| Ok(()));
        let b = registry.subscribe_fn("hunts", |_| Ok(()));

        let removed = registry.unsubscribe(a.id).unwrap();
        assert!(!removed.last_for_topic);
        let removed = registry.unsubscribe(b.id).unwrap();
        assert!(removed.last_for_topic);
        assert!(registry.unsubscribe(b.id).is_none());
        assert!(registry.topics().is_empty());
    }

    #[test]
    fn test_dispatch_only_matching_topic() {
        let registry = SubscriptionRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        registry.subscribe_fn("flows", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        registry.dispatch(&Event::update("hunts", json!({})));
        let report = registry.dispatch(&Event::update("flows", json!({"id": 1})));
        assert_eq!(report.delivered, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_handlers_do_not_block_others() {
        let registry = SubscriptionRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        registry.subscribe_fn("clients", |_| Err("boom".into()));
        registry.subscribe_fn("clients", |_| panic!("handler bug"));
        let h = Arc::clone(&hits);
        registry.subscribe_fn("clients", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let report = registry.dispatch(&Event::update("clients", json!(null)));
        assert_eq!(
            report,
            DispatchReport {
                delivered: 1,
                failed: 2,
                removed: 0,
            }
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queue_subscription_preserves_order() {
        let registry = SubscriptionRegistry::new();
        let (_, mut rx) = registry.subscribe_queue("hunts", 8);
        for i in 0..3 {
            registry.dispatch(&Event::update("hunts", json!(i)));
        }
        for i in 0..3 {
            assert_eq!(rx.recv().await.unwrap().payload, json!(i));
        }
    }

    #[test]
    fn test_full_queue_counts_as_failure() {
        let registry = SubscriptionRegistry::new();
        let (_, _rx) = registry.subscribe_queue("hunts", 1);
        assert_eq!(registry.dispatch(&Event::update("hunts", json!(1))).delivered, 1);
        assert_eq!(registry.dispatch(&Event::update("hunts", json!(2))).failed, 1);
    }

    #[test]
    fn test_connection_lost_reaches_every_subscription() {
        let registry = SubscriptionRegistry::new();
        let (_, mut a) = registry.subscribe_queue("topicA", 4);
        let (_, mut b) = registry.subscribe_queue("topicB", 4);

        let report = registry.notify_connection_lost(5, "exhausted");
        assert_eq!(report.delivered, 2);

        let event = a.try_recv().unwrap();
        assert_eq!(event.topic, "topicA");
        assert!(event.is_connection_lost());
        assert!(b.try_recv().unwrap().is_connection_lost());
    }

    #[test]
    fn test_connection_lost_fits_in_full_queue() {
        let registry = SubscriptionRegistry::new();
        let (_, mut rx) = registry.subscribe_queue("topicA", 1);
        assert_eq!(registry.dispatch(&Event::update("topicA", json!(1))).delivered, 1);
        assert_eq!(registry.dispatch(&Event::update("topicA", json!(2))).failed, 1);

        let report = registry.notify_connection_lost(3, "exhausted");
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 0);

        assert_eq!(rx.try_recv().unwrap().payload, json!(1));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::ConnectionLost { attempts: 3 });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unread_connection_lost_is_not_duplicated() {
        let registry = SubscriptionRegistry::new();
        let (_, mut rx) = registry.subscribe_queue("topicA", 1);
        registry.dispatch(&Event::update("topicA", json!(1)));

        assert_eq!(registry.notify_connection_lost(1, "rejected").delivered, 1);
        assert_eq!(registry.notify_connection_lost(2, "rejected").delivered, 1);

        assert!(!rx.try_recv().unwrap().is_connection_lost());
        assert!(rx.try_recv().unwrap().is_connection_lost());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_receiver_removes_subscription() {
        let registry = SubscriptionRegistry::new();
        let (_, rx) = registry.subscribe_queue("hunts", 4);
        let (_, _kept) = registry.subscribe_queue("flows", 4);
        drop(rx);

        let report = registry.dispatch(&Event::update("hunts", json!(1)));
        assert_eq!(report.removed, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(registry.topics(), vec!["flows"]);

        let report = registry.notify_connection_lost(1, "exhausted");
        assert_eq!(report.delivered, 1);
        assert_eq!(report.removed, 0);
    }
}
