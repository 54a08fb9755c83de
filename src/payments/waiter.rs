//! Waits for an order to reach a terminal status.
//!
//! A wait races the local registry, the durable store's live feed and a
//! timer. The first terminal report wins; the registry token and the store
//! stream are dropped on every exit path, including the caller dropping the
//! future.

use crate::payments::status::StatusTracker;
use crate::payments::types::{
    PaymentOutcome, PaymentOutcomeRecord, PaymentStatus, ResolutionSource, WaitOutcome,
};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const TIMED_OUT_MESSAGE: &str = "timed out";

#[derive(Clone)]
pub struct ResultWaiter {
    tracker: StatusTracker,
}

impl ResultWaiter {
    pub fn new(tracker: StatusTracker) -> Self {
        Self { tracker }
    }

    pub async fn await_result(&self, order_id: &str, timeout: Duration) -> WaitOutcome {
        if let Some((outcome, _)) = self.settled(order_id).await {
            debug!(order_id = %order_id, status = %outcome.status, "order already settled");
            return WaitOutcome {
                outcome,
                source: ResolutionSource::AlreadySettled,
            };
        }

        let (local_tx, mut local_rx) = mpsc::unbounded_channel();
        let _local = self.tracker.registry().subscribe(
            order_id,
            Arc::new(move |outcome: &PaymentOutcome| {
                if outcome.is_terminal() {
                    let _ = local_tx.send(outcome.clone());
                }
            }),
        );

        let remote = match self.tracker.store().observe(order_id).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(
                    order_id = %order_id,
                    error = %e,
                    "durable store feed unavailable, waiting on local notifications only"
                );
                stream::pending().boxed()
            }
        };
        let mut remote = remote
            .filter(|outcome| futures::future::ready(outcome.is_terminal()))
            .boxed();

        // A settlement between the first read and the subscriptions above
        // would otherwise go unnoticed.
        if let Some((outcome, source)) = self.settled(order_id).await {
            return WaitOutcome { outcome, source };
        }

        let resolved = tokio::select! {
            Some(outcome) = local_rx.recv() => WaitOutcome {
                outcome,
                source: ResolutionSource::LocalCallback,
            },
            Some(outcome) = remote.next() => {
                let record = PaymentOutcomeRecord::from_outcome(&outcome, Utc::now());
                WaitOutcome {
                    outcome: self.tracker.absorb(&record),
                    source: ResolutionSource::DurableStore,
                }
            },
            _ = tokio::time::sleep(timeout) => {
                info!(
                    order_id = %order_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "no terminal outcome before timeout"
                );
                WaitOutcome {
                    outcome: PaymentOutcome::new(order_id, PaymentStatus::Cancelled)
                        .with_message(TIMED_OUT_MESSAGE),
                    source: ResolutionSource::TimedOut,
                }
            }
        };

        debug!(
            order_id = %order_id,
            status = %resolved.outcome.status,
            source = ?resolved.source,
            "wait resolved"
        );
        resolved
    }

    async fn settled(&self, order_id: &str) -> Option<(PaymentOutcome, ResolutionSource)> {
        self.tracker
            .current_with_source(order_id)
            .await
            .filter(|(outcome, _)| outcome.is_terminal())
    }
}
