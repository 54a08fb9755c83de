//! The single update path for order status.
//!
//! Every writer (launcher, redirect ingress, reconciliation) settles an order
//! through [`StatusTracker::update`]: durable store first, then the in-process
//! cache, then local subscribers. Both the store and the cache apply the same
//! monotone merge, so replays and out-of-order writes are no-ops.

use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::registry::SubscriptionRegistry;
use crate::payments::store::{merge_records, MergeDecision, PersistResult, StatusStoreBridge};
use crate::payments::types::{PaymentOutcome, PaymentOutcomeRecord, ResolutionSource};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct CacheEntry {
    record: PaymentOutcomeRecord,
    /// False while the status only exists here because the durable write
    /// failed. A durable terminal value replaces an unconfirmed one.
    confirmed: bool,
}

type Entries = HashMap<String, CacheEntry>;

/// In-process mirror of the records this process has touched.
#[derive(Clone, Default)]
pub struct StatusCache {
    records: Arc<RwLock<Entries>>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.records.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.records.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, order_id: &str) -> Option<PaymentOutcomeRecord> {
        self.read().get(order_id).map(|entry| entry.record.clone())
    }

    /// A terminal status the durable store has agreed with.
    pub fn get_settled(&self, order_id: &str) -> Option<PaymentOutcomeRecord> {
        self.read()
            .get(order_id)
            .filter(|entry| entry.confirmed && entry.record.status.is_terminal())
            .map(|entry| entry.record.clone())
    }

    pub fn is_confirmed(&self, order_id: &str) -> bool {
        self.read().get(order_id).is_some_and(|entry| entry.confirmed)
    }

    /// Returns `false` when the order is already known.
    pub fn insert_pending(&self, record: &PaymentOutcomeRecord) -> bool {
        let mut records = self.write();
        if records.contains_key(&record.order_id) {
            return false;
        }
        records.insert(
            record.order_id.clone(),
            CacheEntry {
                record: record.clone(),
                confirmed: true,
            },
        );
        true
    }

    /// Folds in a record read from the durable store.
    pub fn merge(&self, incoming: &PaymentOutcomeRecord) -> PersistResult {
        let mut records = self.write();
        let existing = records.get(&incoming.order_id);

        let result = match existing {
            Some(entry)
                if !entry.confirmed
                    && entry.record.status.is_terminal()
                    && incoming.status.is_terminal() =>
            {
                let decision = if entry.record.status == incoming.status {
                    MergeDecision::Unchanged
                } else {
                    MergeDecision::Overwrite
                };
                let mut record = entry.record.clone();
                record.apply(incoming);
                PersistResult { decision, record }
            }
            _ => merge_records(existing.map(|entry| entry.record.clone()), incoming),
        };

        // The durable side now agrees with what is cached.
        if result.record.status == incoming.status {
            records.insert(
                incoming.order_id.clone(),
                CacheEntry {
                    record: result.record.clone(),
                    confirmed: true,
                },
            );
        }
        result
    }

    /// Settles an order in this process only, pending a durable write.
    pub fn settle_local(&self, incoming: &PaymentOutcomeRecord) -> PersistResult {
        let mut records = self.write();
        let result = merge_records(
            records.get(&incoming.order_id).map(|entry| entry.record.clone()),
            incoming,
        );
        if result.decision.writes() {
            records.insert(
                incoming.order_id.clone(),
                CacheEntry {
                    record: result.record.clone(),
                    confirmed: false,
                },
            );
        }
        result
    }

    /// Terminal statuses still waiting for their durable write.
    pub fn unconfirmed(&self) -> Vec<PaymentOutcomeRecord> {
        self.read()
            .values()
            .filter(|entry| !entry.confirmed && entry.record.status.is_terminal())
            .map(|entry| entry.record.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
pub struct StatusTracker {
    cache: StatusCache,
    store: StatusStoreBridge,
    registry: SubscriptionRegistry,
}

impl StatusTracker {
    pub fn new(store: StatusStoreBridge, registry: SubscriptionRegistry) -> Self {
        Self {
            cache: StatusCache::new(),
            store,
            registry,
        }
    }

    pub fn cache(&self) -> &StatusCache {
        &self.cache
    }

    pub fn store(&self) -> &StatusStoreBridge {
        &self.store
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Write-through registration of a new order: cache, then durable store.
    /// A known order id is a collision and fails with `DuplicateOrder`.
    pub async fn register_pending(&self, record: &PaymentOutcomeRecord) -> PaymentResult<()> {
        if !self.cache.insert_pending(record) {
            return Err(PaymentError::DuplicateOrder {
                order_id: record.order_id.clone(),
            });
        }
        self.store.register_pending(record).await
    }

    /// Settles `outcome` everywhere and returns the status the order holds
    /// afterwards, which differs from `outcome` when the order was already
    /// settled.
    pub async fn update(&self, outcome: &PaymentOutcome) -> PaymentOutcome {
        match self.store.persist(&outcome.order_id, outcome).await {
            Ok(result) => self.absorb(&result.record),
            Err(e) => {
                // In-process waiters still resolve; `retry_unconfirmed` makes
                // the durable write later and yields to any durable value.
                warn!(
                    order_id = %outcome.order_id,
                    status = %outcome.status,
                    error = %e,
                    "durable store unavailable, settling locally only"
                );
                let record = PaymentOutcomeRecord::from_outcome(outcome, Utc::now());
                let local = self.cache.settle_local(&record);
                self.publish_if_written(&local)
            }
        }
    }

    /// Folds a record observed elsewhere (durable store) into the local
    /// cache and notifies local subscribers when it changed anything.
    pub fn absorb(&self, record: &PaymentOutcomeRecord) -> PaymentOutcome {
        let local = self.cache.merge(record);
        self.publish_if_written(&local)
    }

    fn publish_if_written(&self, local: &PersistResult) -> PaymentOutcome {
        let settled = local.record.to_outcome();
        if local.decision.writes() {
            self.registry.publish(&settled);
        } else {
            debug!(
                order_id = %settled.order_id,
                status = %settled.status,
                "local status unchanged"
            );
        }
        settled
    }

    /// Replays locally settled outcomes into the durable store. Where the
    /// store already holds a different terminal value, that value replaces
    /// the local one. Returns how many orders were confirmed.
    pub async fn retry_unconfirmed(&self) -> usize {
        let mut confirmed = 0;
        for record in self.cache.unconfirmed() {
            let outcome = record.to_outcome();
            match self.store.persist(&record.order_id, &outcome).await {
                Ok(result) => {
                    let settled = self.absorb(&result.record);
                    info!(
                        order_id = %record.order_id,
                        local = %record.status,
                        durable = %settled.status,
                        "locally settled outcome written to durable store"
                    );
                    confirmed += 1;
                }
                Err(e) => {
                    debug!(order_id = %record.order_id, error = %e, "durable store still unavailable");
                    break;
                }
            }
        }
        confirmed
    }

    /// Best known status: a confirmed terminal cache entry, else the durable
    /// record, else whatever the cache holds.
    pub async fn current(&self, order_id: &str) -> Option<PaymentOutcome> {
        self.current_with_source(order_id)
            .await
            .map(|(outcome, _)| outcome)
    }

    /// Like [`current`](Self::current), also naming where the answer came
    /// from: `DurableStore` when the store's terminal value is the answer,
    /// `LocalCallback` when it was settled in this process.
    pub async fn current_with_source(
        &self,
        order_id: &str,
    ) -> Option<(PaymentOutcome, ResolutionSource)> {
        if let Some(record) = self.cache.get_settled(order_id) {
            return Some((record.to_outcome(), ResolutionSource::LocalCallback));
        }

        let cached = self
            .cache
            .get(order_id)
            .map(|r| (r.to_outcome(), ResolutionSource::LocalCallback));
        match self.store.get(order_id).await {
            Ok(Some(record)) => {
                let outcome = self.absorb(&record);
                let source = if record.status.is_terminal() && outcome.status == record.status {
                    ResolutionSource::DurableStore
                } else {
                    ResolutionSource::LocalCallback
                };
                Some((outcome, source))
            }
            Ok(None) => cached,
            Err(e) => {
                warn!(order_id = %order_id, error = %e, "durable status read failed");
                cached
            }
        }
    }
}
