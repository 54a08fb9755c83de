//! Payment coordination service.
//!
//! Owns one instance of every moving part (registry, status cache, store
//! bridge, launcher, ingress, waiter), so independent coordinators never
//! share in-process state. Only the durable store may be shared.

use crate::payments::callback::{CallbackIngress, IngressDecision};
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::launcher::{RedirectLauncher, UriOpener};
use crate::payments::provider::WalletProvider;
use crate::payments::registry::SubscriptionRegistry;
use crate::payments::status::StatusTracker;
use crate::payments::store::{OutcomeStore, StatusStoreBridge};
use crate::payments::types::{PaymentLaunchResult, PaymentOutcome, WaitOutcome};
use crate::payments::waiter::ResultWaiter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Return URI registered with the provider. Inbound URIs are matched
    /// against it, ignoring the query string.
    pub redirect_target: String,
    /// Default budget for [`PaymentCoordinator::await_default`].
    pub wait_timeout: Duration,
    pub verify_callback_signature: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            redirect_target: "storefront://payment-result".to_string(),
            wait_timeout: Duration::from_secs(300),
            verify_callback_signature: false,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redirect_target: std::env::var("MOMO_REDIRECT_URL")
                .unwrap_or(defaults.redirect_target),
            wait_timeout: std::env::var("PAYMENT_WAIT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.wait_timeout),
            verify_callback_signature: std::env::var("MOMO_VERIFY_CALLBACK_SIGNATURE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.verify_callback_signature),
        }
    }

    pub fn validate(&self) -> PaymentResult<()> {
        if self.redirect_target.trim().is_empty() {
            return Err(PaymentError::ConfigurationError {
                message: "redirect target must not be empty".to_string(),
                field: Some("MOMO_REDIRECT_URL".to_string()),
            });
        }
        if self.wait_timeout.is_zero() {
            return Err(PaymentError::ConfigurationError {
                message: "wait timeout must be greater than zero".to_string(),
                field: Some("PAYMENT_WAIT_TIMEOUT_SECS".to_string()),
            });
        }
        Ok(())
    }
}

pub struct PaymentCoordinator {
    config: CoordinatorConfig,
    provider: Arc<dyn WalletProvider>,
    tracker: StatusTracker,
    launcher: RedirectLauncher,
    ingress: CallbackIngress,
    waiter: ResultWaiter,
}

impl PaymentCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        provider: Arc<dyn WalletProvider>,
        opener: Arc<dyn UriOpener>,
        store: Arc<dyn OutcomeStore>,
    ) -> Self {
        let tracker = StatusTracker::new(StatusStoreBridge::new(store), SubscriptionRegistry::new());
        let launcher = RedirectLauncher::new(
            provider.clone(),
            opener,
            tracker.clone(),
            config.redirect_target.clone(),
        );
        let ingress = CallbackIngress::new(
            &config.redirect_target,
            config.verify_callback_signature,
            provider.clone(),
        );
        let waiter = ResultWaiter::new(tracker.clone());

        Self {
            config,
            provider,
            tracker,
            launcher,
            ingress,
            waiter,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn provider(&self) -> Arc<dyn WalletProvider> {
        self.provider.clone()
    }

    pub fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        self.tracker.registry()
    }

    pub async fn initiate(
        &self,
        amount: u64,
        order_info: &str,
    ) -> PaymentResult<PaymentLaunchResult> {
        self.launcher.initiate(amount, order_info).await
    }

    /// Routes one URI delivered by the host. Returns the status the order
    /// holds afterwards, or `None` when the URI was not a usable payment
    /// redirect.
    pub async fn handle_redirect(&self, uri: &str) -> Option<PaymentOutcome> {
        match self.ingress.interpret(uri) {
            IngressDecision::Ignored => None,
            IngressDecision::Rejected { reason } => {
                warn!(reason = %reason, "payment redirect rejected");
                None
            }
            IngressDecision::Classified(outcome) => {
                info!(
                    order_id = %outcome.order_id,
                    status = %outcome.status,
                    result_code = ?outcome.result_code,
                    "payment redirect received"
                );
                Some(self.update_outcome(&outcome).await)
            }
        }
    }

    pub async fn update_outcome(&self, outcome: &PaymentOutcome) -> PaymentOutcome {
        self.tracker.update(outcome).await
    }

    pub async fn await_result(&self, order_id: &str, timeout: Duration) -> WaitOutcome {
        self.waiter.await_result(order_id, timeout).await
    }

    pub async fn await_default(&self, order_id: &str) -> WaitOutcome {
        self.await_result(order_id, self.config.wait_timeout).await
    }

    pub async fn status(&self, order_id: &str) -> Option<PaymentOutcome> {
        self.tracker.current(order_id).await
    }

    /// Drains host-delivered URIs until the channel closes or shutdown is
    /// signalled. Redirects are handled one at a time in arrival order.
    pub async fn run_ingress(
        self: Arc<Self>,
        mut uris: mpsc::Receiver<String>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!(redirect_target = %self.config.redirect_target, "redirect ingress started");

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("redirect ingress stopping");
                        break;
                    }
                }
                next = uris.recv() => {
                    let Some(uri) = next else {
                        debug!("redirect channel closed");
                        break;
                    };
                    self.handle_redirect(uri.trim()).await;
                }
            }
        }

        info!("redirect ingress stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation() {
        assert!(CoordinatorConfig::default().validate().is_ok());

        let empty_target = CoordinatorConfig {
            redirect_target: " ".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            empty_target.validate(),
            Err(PaymentError::ConfigurationError { .. })
        ));

        let zero_wait = CoordinatorConfig {
            wait_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(zero_wait.validate().is_err());
    }
}
