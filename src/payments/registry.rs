//! In-process publish/subscribe ledger keyed by order id.
//!
//! Lets a waiter in the same process learn an outcome as soon as the redirect
//! is classified, without a round trip to the durable store. Each coordinator
//! owns its own registry, so independent instances never see each other's
//! subscribers.

use crate::payments::types::PaymentOutcome;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::debug;

pub type OutcomeCallback = Arc<dyn Fn(&PaymentOutcome) + Send + Sync>;

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<String, Vec<(u64, OutcomeCallback)>>>,
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<(u64, OutcomeCallback)>>> {
        // Callbacks run outside the lock, so a poisoned map is still consistent.
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, order_id: &str, id: u64) -> bool {
        let mut subscribers = self.lock();
        let Some(list) = subscribers.get_mut(order_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sub_id, _)| *sub_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(order_id);
        }
        removed
    }
}

#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for `order_id`. Dropping the returned token, or
    /// calling [`Subscription::unsubscribe`], removes exactly this callback.
    pub fn subscribe(&self, order_id: &str, callback: OutcomeCallback) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock()
            .entry(order_id.to_string())
            .or_default()
            .push((id, callback));
        debug!(order_id = %order_id, subscription_id = id, "local subscriber registered");

        Subscription {
            registry: Arc::downgrade(&self.inner),
            order_id: order_id.to_string(),
            id,
            active: true,
        }
    }

    /// Invokes every callback currently registered for the outcome's order.
    /// A terminal outcome also clears the order's list. Returns the number of
    /// callbacks invoked.
    pub fn publish(&self, outcome: &PaymentOutcome) -> usize {
        let callbacks: Vec<OutcomeCallback> = {
            let mut subscribers = self.inner.lock();
            if outcome.is_terminal() {
                subscribers
                    .remove(&outcome.order_id)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(_, cb)| cb)
                    .collect()
            } else {
                subscribers
                    .get(&outcome.order_id)
                    .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
                    .unwrap_or_default()
            }
        };

        for callback in &callbacks {
            callback(outcome);
        }
        debug!(
            order_id = %outcome.order_id,
            status = %outcome.status,
            notified = callbacks.len(),
            "local subscribers notified"
        );
        callbacks.len()
    }

    pub fn subscriber_count(&self, order_id: &str) -> usize {
        self.inner.lock().get(order_id).map(Vec::len).unwrap_or(0)
    }

    pub fn total_subscribers(&self) -> usize {
        self.inner.lock().values().map(Vec::len).sum()
    }
}

/// Unsubscribe token returned by [`SubscriptionRegistry::subscribe`].
pub struct Subscription {
    registry: Weak<RegistryInner>,
    order_id: String,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn order_id(&self) -> &str {
        &self.order_id
    }

    /// Returns `false` when the callback was already gone, e.g. because a
    /// terminal publish cleared it.
    pub fn unsubscribe(mut self) -> bool {
        self.release()
    }

    fn release(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        match self.registry.upgrade() {
            Some(inner) => inner.remove(&self.order_id, self.id),
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::PaymentStatus;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, OutcomeCallback) {
        let hits = Arc::new(AtomicUsize::new(0));
        let cb_hits = hits.clone();
        let callback: OutcomeCallback = Arc::new(move |_outcome: &PaymentOutcome| {
            cb_hits.fetch_add(1, Ordering::SeqCst);
        });
        (hits, callback)
    }

    #[test]
    fn publish_reaches_only_matching_order() {
        let registry = SubscriptionRegistry::new();
        let (a_hits, a_cb) = counter();
        let (b_hits, b_cb) = counter();
        let _a = registry.subscribe("A", a_cb);
        let _b = registry.subscribe("B", b_cb);

        registry.publish(&PaymentOutcome::new("A", PaymentStatus::Success));
        assert_eq!(a_hits.load(Ordering::SeqCst), 1);
        assert_eq!(b_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn terminal_publish_clears_list() {
        let registry = SubscriptionRegistry::new();
        let (hits, cb) = counter();
        let _sub = registry.subscribe("A", cb);

        registry.publish(&PaymentOutcome::pending("A"));
        assert_eq!(registry.subscriber_count("A"), 1);

        registry.publish(&PaymentOutcome::new("A", PaymentStatus::Failed));
        assert_eq!(registry.subscriber_count("A"), 0);

        registry.publish(&PaymentOutcome::new("A", PaymentStatus::Success));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_removes_exactly_one_callback() {
        let registry = SubscriptionRegistry::new();
        let (first_hits, first_cb) = counter();
        let (second_hits, second_cb) = counter();
        let first = registry.subscribe("A", first_cb);
        let _second = registry.subscribe("A", second_cb);

        assert!(first.unsubscribe());
        assert_eq!(registry.subscriber_count("A"), 1);

        registry.publish(&PaymentOutcome::new("A", PaymentStatus::Success));
        assert_eq!(first_hits.load(Ordering::SeqCst), 0);
        assert_eq!(second_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_token_unsubscribes() {
        let registry = SubscriptionRegistry::new();
        let (_hits, cb) = counter();
        {
            let _sub = registry.subscribe("A", cb);
            assert_eq!(registry.total_subscribers(), 1);
        }
        assert_eq!(registry.total_subscribers(), 0);
    }

    #[test]
    fn unsubscribe_after_terminal_publish_reports_gone() {
        let registry = SubscriptionRegistry::new();
        let (_hits, cb) = counter();
        let sub = registry.subscribe("A", cb);
        registry.publish(&PaymentOutcome::new("A", PaymentStatus::Cancelled));
        assert!(!sub.unsubscribe());
    }

    #[test]
    fn independent_registries_do_not_interfere() {
        let first = SubscriptionRegistry::new();
        let second = SubscriptionRegistry::new();
        let (hits, cb) = counter();
        let _sub = first.subscribe("A", cb);

        assert_eq!(second.publish(&PaymentOutcome::new("A", PaymentStatus::Success)), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn callback_may_resubscribe_without_deadlock() {
        let registry = SubscriptionRegistry::new();
        let inner = registry.clone();
        let held = Arc::new(Mutex::new(Vec::new()));
        let held_cb = held.clone();
        let _sub = registry.subscribe(
            "A",
            Arc::new(move |_outcome: &PaymentOutcome| {
                let (_h, cb) = counter();
                held_cb.lock().unwrap().push(inner.subscribe("B", cb));
            }),
        );
        registry.publish(&PaymentOutcome::new("A", PaymentStatus::Success));
        assert_eq!(registry.subscriber_count("B"), 1);
    }
}
