//! Redirect launcher: registers an order, asks the provider for an
//! authorization URL and hands control to the wallet.

use crate::payments::callback::SUCCESS_CODES;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::WalletProvider;
use crate::payments::status::StatusTracker;
use crate::payments::types::{
    PaymentLaunchResult, PaymentOutcome, PaymentOutcomeRecord, PaymentRequest, PaymentStatus,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

/// Host capability for handing a URI to whatever can render it.
pub trait UriOpener: Send + Sync {
    fn can_open(&self, uri: &str) -> bool;

    fn open(&self, uri: &str) -> PaymentResult<()>;
}

/// Opener for headless hosts: accepts a fixed set of schemes and prints the
/// URI for an operator or a wrapping shell to follow.
#[derive(Debug, Clone)]
pub struct ConsoleUriOpener {
    allowed_schemes: Vec<String>,
}

impl Default for ConsoleUriOpener {
    fn default() -> Self {
        Self::new(["https", "http", "momo"])
    }
}

impl ConsoleUriOpener {
    pub fn new<I, S>(schemes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_schemes: schemes
                .into_iter()
                .map(|s| s.into().to_ascii_lowercase())
                .collect(),
        }
    }
}

impl UriOpener for ConsoleUriOpener {
    fn can_open(&self, uri: &str) -> bool {
        Url::parse(uri)
            .map(|url| self.allowed_schemes.iter().any(|s| s == url.scheme()))
            .unwrap_or(false)
    }

    fn open(&self, uri: &str) -> PaymentResult<()> {
        if !self.can_open(uri) {
            return Err(PaymentError::CannotOpenProviderUi {
                uri: uri.to_string(),
            });
        }
        println!("{}", uri);
        Ok(())
    }
}

pub struct RedirectLauncher {
    provider: Arc<dyn WalletProvider>,
    opener: Arc<dyn UriOpener>,
    tracker: StatusTracker,
    redirect_target: String,
}

impl RedirectLauncher {
    pub fn new(
        provider: Arc<dyn WalletProvider>,
        opener: Arc<dyn UriOpener>,
        tracker: StatusTracker,
        redirect_target: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            opener,
            tracker,
            redirect_target: redirect_target.into(),
        }
    }

    /// Partner code followed by the launch time in microseconds.
    fn next_order_id(&self) -> String {
        format!("{}{}", self.provider.partner_code(), Utc::now().timestamp_micros())
    }

    /// Starts a payment. Validation, configuration and order-id collisions
    /// are returned as `Err` before anything leaves the process; every later
    /// failure is reported as [`PaymentLaunchResult::Failed`].
    pub async fn initiate(
        &self,
        amount: u64,
        order_info: &str,
    ) -> PaymentResult<PaymentLaunchResult> {
        if self.provider.partner_code().trim().is_empty() {
            return Err(PaymentError::ConfigurationError {
                message: "partner code is not configured".to_string(),
                field: Some("MOMO_PARTNER_CODE".to_string()),
            });
        }

        let order_id = self.next_order_id();
        let request = PaymentRequest {
            order_id: order_id.clone(),
            request_id: order_id.clone(),
            amount,
            order_info: order_info.to_string(),
            redirect_target: self.redirect_target.clone(),
            created_at: Utc::now(),
        };
        request.validate()?;

        match self
            .tracker
            .register_pending(&PaymentOutcomeRecord::pending_for(&request))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_precondition() => return Err(e),
            Err(e) => {
                // Without a durable pending record nobody could reconcile
                // this order, so it is not submitted.
                warn!(order_id = %order_id, error = %e, "could not register pending order");
                return Ok(self.fail(&order_id, e).await);
            }
        }

        let response = match self.provider.create_payment(&request).await {
            Ok(response) => response,
            Err(e) if e.is_precondition() => return Err(e),
            Err(e @ PaymentError::TransportError { .. }) => {
                warn!(
                    order_id = %order_id,
                    provider = self.provider.name(),
                    error = %e,
                    "payment request did not reach the provider, order left pending"
                );
                return Ok(PaymentLaunchResult::Failed {
                    order_id: Some(order_id),
                    message: e.user_message(),
                    error: e,
                });
            }
            Err(e) => return Ok(self.fail(&order_id, e).await),
        };

        if !SUCCESS_CODES.contains(&response.result_code) {
            let error = PaymentError::ProviderRejection {
                message: response.message.clone(),
                provider_code: Some(response.result_code),
            };
            return Ok(self.fail(&order_id, error).await);
        }

        let candidates = response.launch_candidates();
        let Some(first) = candidates.first() else {
            let error = PaymentError::ProviderRejection {
                message: "provider returned no authorization URL".to_string(),
                provider_code: Some(response.result_code),
            };
            return Ok(self.fail(&order_id, error).await);
        };

        let Some(uri) = candidates.iter().find(|uri| self.opener.can_open(uri)) else {
            let error = PaymentError::CannotOpenProviderUi {
                uri: first.to_string(),
            };
            return Ok(self.fail(&order_id, error).await);
        };

        if let Err(e) = self.opener.open(uri) {
            return Ok(self.fail(&order_id, e).await);
        }

        info!(
            order_id = %order_id,
            provider = self.provider.name(),
            amount,
            "payment handed off to provider"
        );
        Ok(PaymentLaunchResult::Pending {
            order_id,
            launched_uri: uri.to_string(),
        })
    }

    /// Settles the order as `failed` so it is not left pending forever.
    async fn fail(&self, order_id: &str, error: PaymentError) -> PaymentLaunchResult {
        warn!(order_id = %order_id, error = %error, "payment launch failed");
        let mut outcome =
            PaymentOutcome::new(order_id, PaymentStatus::Failed).with_message(error.to_string());
        if let PaymentError::ProviderRejection {
            provider_code: Some(code),
            ..
        } = &error
        {
            outcome.result_code = Some(*code);
        }
        self.tracker.update(&outcome).await;

        PaymentLaunchResult::Failed {
            order_id: Some(order_id.to_string()),
            message: error.user_message(),
            error,
        }
    }
}
