//! Durable outcome records and the monotone merge that guards them.
//!
//! A record moves `pending -> success | failed | cancelled` and never back.
//! Every writer goes through [`merge_decision`]; there is no other lock.

use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::types::{PaymentOutcome, PaymentOutcomeRecord, PaymentStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Live feed of writes to one order's record. Dropping it unsubscribes.
pub type OutcomeStream = BoxStream<'static, PaymentOutcomeRecord>;

const WATCH_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// No record existed; the incoming one is stored.
    Insert,
    /// The stored record was pending and takes the incoming outcome.
    Overwrite,
    /// Nothing new: a replay of the stored terminal value, or pending onto
    /// pending.
    Unchanged,
    /// The stored record is terminal with a different value; the write is
    /// dropped.
    Conflict,
}

impl MergeDecision {
    pub fn writes(&self) -> bool {
        matches!(self, MergeDecision::Insert | MergeDecision::Overwrite)
    }
}

pub fn merge_decision(
    existing: Option<&PaymentOutcomeRecord>,
    incoming: &PaymentOutcomeRecord,
) -> MergeDecision {
    match existing {
        None => MergeDecision::Insert,
        Some(current) if current.status.is_terminal() => {
            if current.status == incoming.status {
                MergeDecision::Unchanged
            } else {
                MergeDecision::Conflict
            }
        }
        Some(_) if incoming.status == PaymentStatus::Pending => MergeDecision::Unchanged,
        Some(_) => MergeDecision::Overwrite,
    }
}

/// Applies the merge to `existing`, returning the decision and the record
/// that is stored afterwards.
pub fn merge_records(
    existing: Option<PaymentOutcomeRecord>,
    incoming: &PaymentOutcomeRecord,
) -> PersistResult {
    let decision = merge_decision(existing.as_ref(), incoming);
    let record = match (decision, existing) {
        (MergeDecision::Overwrite, Some(mut current)) => {
            current.apply(incoming);
            current
        }
        (MergeDecision::Insert, _) => incoming.clone(),
        (_, Some(current)) => current,
        (_, None) => incoming.clone(),
    };
    PersistResult { decision, record }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistResult {
    pub decision: MergeDecision,
    /// The record as stored after the merge. On conflict this is the settled
    /// value, not the rejected one.
    pub record: PaymentOutcomeRecord,
}

#[async_trait]
pub trait OutcomeStore: Send + Sync {
    async fn get(&self, order_id: &str) -> PaymentResult<Option<PaymentOutcomeRecord>>;

    /// Stores a pending record. Returns `false` without writing when any
    /// record already exists for the order.
    async fn create_pending(&self, record: &PaymentOutcomeRecord) -> PaymentResult<bool>;

    /// Read-merge-write under [`merge_decision`], atomically per order.
    async fn merge(&self, incoming: &PaymentOutcomeRecord) -> PaymentResult<PersistResult>;

    async fn watch(&self, order_id: &str) -> PaymentResult<OutcomeStream>;

    /// Pending records created before `created_before`, oldest first.
    async fn list_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> PaymentResult<Vec<PaymentOutcomeRecord>>;
}

/// Process-local store, used under test and when running without Redis.
/// Clones share the same records, so two coordinators built on clones behave
/// like two devices on one backend.
#[derive(Clone)]
pub struct InMemoryOutcomeStore {
    records: Arc<RwLock<HashMap<String, PaymentOutcomeRecord>>>,
    events: broadcast::Sender<PaymentOutcomeRecord>,
}

impl Default for InMemoryOutcomeStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER_SIZE);
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }
}

impl InMemoryOutcomeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live `watch` streams across all orders.
    pub fn watcher_count(&self) -> usize {
        self.events.receiver_count()
    }
}

#[async_trait]
impl OutcomeStore for InMemoryOutcomeStore {
    async fn get(&self, order_id: &str) -> PaymentResult<Option<PaymentOutcomeRecord>> {
        Ok(self.records.read().await.get(order_id).cloned())
    }

    async fn create_pending(&self, record: &PaymentOutcomeRecord) -> PaymentResult<bool> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.order_id) {
            return Ok(false);
        }
        records.insert(record.order_id.clone(), record.clone());
        let _ = self.events.send(record.clone());
        Ok(true)
    }

    async fn merge(&self, incoming: &PaymentOutcomeRecord) -> PaymentResult<PersistResult> {
        let mut records = self.records.write().await;
        let existing = records.get(&incoming.order_id).cloned();
        let result = merge_records(existing, incoming);
        if result.decision.writes() {
            records.insert(result.record.order_id.clone(), result.record.clone());
            // Sent under the write lock so watchers see writes in order.
            let _ = self.events.send(result.record.clone());
        }
        Ok(result)
    }

    async fn watch(&self, order_id: &str) -> PaymentResult<OutcomeStream> {
        let rx = self.events.subscribe();
        let order_id = order_id.to_string();
        let stream = futures::stream::unfold((rx, order_id), |(mut rx, order_id)| async move {
            loop {
                match rx.recv().await {
                    Ok(record) if record.order_id == order_id => {
                        return Some((record, (rx, order_id)));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(order_id = %order_id, skipped, "outcome watcher lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn list_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> PaymentResult<Vec<PaymentOutcomeRecord>> {
        let records = self.records.read().await;
        let mut pending: Vec<PaymentOutcomeRecord> = records
            .values()
            .filter(|r| r.status == PaymentStatus::Pending && r.created_at < created_before)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending.truncate(limit);
        Ok(pending)
    }
}

/// Mirrors classified outcomes into the shared store.
#[derive(Clone)]
pub struct StatusStoreBridge {
    store: Arc<dyn OutcomeStore>,
}

impl StatusStoreBridge {
    pub fn new(store: Arc<dyn OutcomeStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, order_id: &str) -> PaymentResult<Option<PaymentOutcomeRecord>> {
        self.store.get(order_id).await
    }

    /// Creates the pending record for a new order. An existing record of any
    /// status means the order id collided.
    pub async fn register_pending(&self, record: &PaymentOutcomeRecord) -> PaymentResult<()> {
        if !self.store.create_pending(record).await? {
            return Err(PaymentError::DuplicateOrder {
                order_id: record.order_id.clone(),
            });
        }
        debug!(order_id = %record.order_id, "pending record created");
        Ok(())
    }

    pub async fn persist(
        &self,
        order_id: &str,
        outcome: &PaymentOutcome,
    ) -> PaymentResult<PersistResult> {
        let mut incoming = PaymentOutcomeRecord::from_outcome(outcome, Utc::now());
        incoming.order_id = order_id.to_string();
        let result = self.store.merge(&incoming).await?;

        match result.decision {
            MergeDecision::Insert | MergeDecision::Overwrite => info!(
                order_id = %order_id,
                status = %result.record.status,
                result_code = ?result.record.result_code,
                "payment outcome persisted"
            ),
            MergeDecision::Unchanged => debug!(
                order_id = %order_id,
                status = %result.record.status,
                "payment outcome already recorded"
            ),
            MergeDecision::Conflict => warn!(
                order_id = %order_id,
                settled = %result.record.status,
                rejected = %outcome.status,
                "ignoring write that contradicts a settled payment"
            ),
        }
        Ok(result)
    }

    /// Terminal outcomes written to the order's record from now on.
    pub async fn observe(&self, order_id: &str) -> PaymentResult<BoxStream<'static, PaymentOutcome>> {
        let stream = self.store.watch(order_id).await?;
        Ok(stream.map(|record| record.to_outcome()).boxed())
    }

    pub async fn list_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> PaymentResult<Vec<PaymentOutcomeRecord>> {
        self.store.list_pending(created_before, limit).await
    }
}
