//! Settles orders that never received a redirect.
//!
//! Every cycle first replays outcomes that were settled in this process while
//! the durable store was unreachable. It then lists durable `pending` records older than `min_age`, asks the
//! provider for their status and persists terminal answers through the usual
//! merge. Records still pending past `pending_expiry` are settled as
//! `cancelled` with reason [`EXPIRED_MESSAGE`].

use crate::payments::callback::classify_query_code;
use crate::payments::error::PaymentError;
use crate::payments::provider::WalletProvider;
use crate::payments::status::StatusTracker;
use crate::payments::types::{PaymentOutcome, PaymentOutcomeRecord, PaymentStatus};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const EXPIRED_MESSAGE: &str = "expired";

#[derive(Debug, thiserror::Error)]
pub enum ReconciliationError {
    #[error("could not list pending orders: {0}")]
    Listing(#[from] PaymentError),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    /// How often the worker wakes up.
    pub interval: Duration,
    /// Orders younger than this are left alone; the redirect may still come.
    pub min_age: Duration,
    /// Orders older than this are expired when the provider has no answer.
    pub pending_expiry: Duration,
    /// Maximum number of pending records handled per cycle.
    pub batch_size: usize,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            min_age: Duration::from_secs(120),
            pending_expiry: Duration::from_secs(1800),
            batch_size: 100,
        }
    }
}

impl ReconciliationConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.interval = Duration::from_secs(
            std::env::var("RECONCILE_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.interval.as_secs()),
        );
        cfg.min_age = Duration::from_secs(
            std::env::var("RECONCILE_MIN_AGE_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.min_age.as_secs()),
        );
        cfg.pending_expiry = Duration::from_secs(
            std::env::var("PENDING_EXPIRY_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.pending_expiry.as_secs()),
        );
        cfg.batch_size = std::env::var("RECONCILE_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(cfg.batch_size);
        cfg
    }

    pub fn validate(&self) -> Result<(), crate::config::ConfigError> {
        use crate::config::ConfigError;

        if self.interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "RECONCILE_INTERVAL_SECS".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue("RECONCILE_BATCH_SIZE".to_string()));
        }
        if self.pending_expiry < self.min_age {
            return Err(ConfigError::InvalidValue(
                "PENDING_EXPIRY_SECS must be >= RECONCILE_MIN_AGE_SECS".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Per-cycle counters, mostly for logs and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    /// Locally settled outcomes written to the durable store this cycle.
    pub replayed: usize,
    pub examined: usize,
    pub settled: usize,
    pub expired: usize,
    pub still_pending: usize,
    pub query_failures: usize,
}

pub struct ReconciliationWorker {
    provider: Arc<dyn WalletProvider>,
    tracker: StatusTracker,
    config: ReconciliationConfig,
}

impl ReconciliationWorker {
    pub fn new(
        provider: Arc<dyn WalletProvider>,
        tracker: StatusTracker,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            provider,
            tracker,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            min_age_secs = self.config.min_age.as_secs(),
            pending_expiry_secs = self.config.pending_expiry.as_secs(),
            batch_size = self.config.batch_size,
            "payment reconciliation worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("payment reconciliation worker stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    match self.run_cycle(Utc::now()).await {
                        Ok(stats) if stats.examined > 0 || stats.replayed > 0 => info!(
                            replayed = stats.replayed,
                            examined = stats.examined,
                            settled = stats.settled,
                            expired = stats.expired,
                            still_pending = stats.still_pending,
                            query_failures = stats.query_failures,
                            "reconciliation cycle finished"
                        ),
                        Ok(_) => debug!("no stale pending orders"),
                        Err(e) => warn!(error = %e, "reconciliation cycle failed"),
                    }
                }
            }
        }

        info!("payment reconciliation worker stopped");
    }

    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleStats, ReconciliationError> {
        let mut stats = CycleStats {
            replayed: self.tracker.retry_unconfirmed().await,
            ..Default::default()
        };

        let cutoff = now - to_chrono(self.config.min_age);
        let stale = self
            .tracker
            .store()
            .list_pending(cutoff, self.config.batch_size)
            .await?;

        for record in stale {
            stats.examined += 1;
            self.reconcile(&record, now, &mut stats).await;
        }
        Ok(stats)
    }

    async fn reconcile(
        &self,
        record: &PaymentOutcomeRecord,
        now: DateTime<Utc>,
        stats: &mut CycleStats,
    ) {
        let order_id = record.order_id.as_str();

        match self.provider.query_status(order_id).await {
            Ok(status) => match classify_query_code(status.result_code) {
                Some(classification) => {
                    let mut outcome = PaymentOutcome::new(order_id, classification.status)
                        .with_message(status.message);
                    outcome.result_code = Some(status.result_code);
                    outcome.transaction_id = status.transaction_id;
                    outcome.unrecognized_code = !classification.recognized;
                    if let Some(error) = outcome.unrecognized() {
                        warn!(order_id = %order_id, error = %error, "provider status query failing closed");
                    }

                    let settled = self.tracker.update(&outcome).await;
                    info!(
                        order_id = %order_id,
                        status = %settled.status,
                        result_code = status.result_code,
                        "pending order reconciled with provider"
                    );
                    stats.settled += 1;
                    return;
                }
                None => debug!(
                    order_id = %order_id,
                    result_code = status.result_code,
                    "provider reports payment still in progress"
                ),
            },
            Err(e) => {
                warn!(order_id = %order_id, error = %e, "provider status query failed");
                stats.query_failures += 1;
            }
        }

        if now - record.created_at >= to_chrono(self.config.pending_expiry) {
            let outcome = PaymentOutcome::new(order_id, PaymentStatus::Cancelled)
                .with_message(EXPIRED_MESSAGE);
            let settled = self.tracker.update(&outcome).await;
            info!(
                order_id = %order_id,
                status = %settled.status,
                age_secs = (now - record.created_at).num_seconds(),
                "pending order expired"
            );
            stats.expired += 1;
        } else {
            stats.still_pending += 1;
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
