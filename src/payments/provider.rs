use crate::payments::error::PaymentResult;
use crate::payments::types::PaymentRequest;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What the provider answered to a create-payment call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreatePaymentResponse {
    pub result_code: i64,
    pub message: String,
    /// Provider-hosted authorization page.
    pub pay_url: Option<String>,
    /// App-to-app link into the wallet, when the provider offers one.
    pub deeplink: Option<String>,
}

impl CreatePaymentResponse {
    /// Candidate URIs to hand control to, most specific first.
    pub fn launch_candidates(&self) -> Vec<&str> {
        [self.deeplink.as_deref(), self.pay_url.as_deref()]
            .into_iter()
            .flatten()
            .filter(|uri| !uri.trim().is_empty())
            .collect()
    }
}

/// What the provider answered to a status query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderStatus {
    pub order_id: String,
    pub result_code: i64,
    pub message: String,
    pub transaction_id: Option<String>,
}

#[async_trait]
pub trait WalletProvider: Send + Sync {
    /// Signs and submits the request. Transport failures come back as
    /// `TransportError`; any provider reply is returned as-is.
    async fn create_payment(&self, request: &PaymentRequest)
        -> PaymentResult<CreatePaymentResponse>;

    async fn query_status(&self, order_id: &str) -> PaymentResult<ProviderStatus>;

    fn name(&self) -> &'static str;

    /// Prefix of generated order ids.
    fn partner_code(&self) -> &str;

    /// Checks the signature carried on a redirect back into the app.
    /// Providers that do not sign redirects accept everything.
    fn verify_redirect(&self, _params: &HashMap<String, String>) -> bool {
        true
    }
}
