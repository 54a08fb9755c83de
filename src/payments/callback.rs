//! Inbound redirect handling.
//!
//! The host hands over an opaque URI each time the app regains control. Only
//! URIs under the configured redirect target are interpreted; everything else
//! is ignored without error.

use crate::payments::provider::WalletProvider;
use crate::payments::types::{PaymentOutcome, PaymentStatus};
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result codes that settle an order as paid.
pub const SUCCESS_CODES: &[i64] = &[0, 9000];

/// Result codes for a payment the user (or the provider on their behalf)
/// cancelled.
pub const CANCEL_CODES: &[i64] = &[1003, 1006];

/// Result codes the provider documents as failures. Anything outside the
/// success, cancel and failure tables is still `failed` but flagged for audit.
pub const KNOWN_FAILURE_CODES: &[i64] = &[
    10, 11, 12, 13, 20, 21, 22, 40, 41, 42, 43, 45, 47, 98, 99, 1001, 1002, 1004, 1005, 1007,
    1026, 1080, 1081, 1088, 2019, 4001, 4100,
];

/// Codes a status query may return while the order is still open. Never
/// consulted for redirects.
pub const IN_PROGRESS_CODES: &[i64] = &[1000, 7000, 7002];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub status: PaymentStatus,
    pub recognized: bool,
}

/// Maps a provider result code to a terminal status. Unknown codes fail
/// closed.
pub fn classify_result_code(code: i64) -> Classification {
    if SUCCESS_CODES.contains(&code) {
        return Classification {
            status: PaymentStatus::Success,
            recognized: true,
        };
    }
    if CANCEL_CODES.contains(&code) {
        return Classification {
            status: PaymentStatus::Cancelled,
            recognized: true,
        };
    }
    Classification {
        status: PaymentStatus::Failed,
        recognized: KNOWN_FAILURE_CODES.contains(&code),
    }
}

/// Same table as [`classify_result_code`], except in-progress codes yield
/// `None`.
pub fn classify_query_code(code: i64) -> Option<Classification> {
    if IN_PROGRESS_CODES.contains(&code) {
        return None;
    }
    Some(classify_result_code(code))
}

/// Splits the part after the first `?` into percent-decoded pairs. A pair
/// without `=` gets an empty value; the first occurrence of a key wins.
pub fn parse_query(uri: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let Some((_, query)) = uri.split_once('?') else {
        return params;
    };

    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = percent_decode_str(key).decode_utf8_lossy().into_owned();
        let value = percent_decode_str(value).decode_utf8_lossy().into_owned();
        params.entry(key).or_insert(value);
    }
    params
}

/// The parameters a redirect is expected to carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackParams {
    pub order_id: String,
    pub result_code: Option<i64>,
    pub raw_result_code: Option<String>,
    pub transaction_id: Option<String>,
    pub message: Option<String>,
    pub raw: HashMap<String, String>,
}

impl CallbackParams {
    pub fn from_query(raw: HashMap<String, String>) -> Option<Self> {
        let order_id = raw
            .get("orderId")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())?;
        let raw_result_code = raw.get("resultCode").or_else(|| raw.get("errorCode")).cloned();
        let result_code = raw_result_code
            .as_deref()
            .and_then(|v| v.trim().parse::<i64>().ok());
        let transaction_id = raw
            .get("transId")
            .or_else(|| raw.get("transactionId"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty() && v != "0");
        let message = raw.get("message").cloned().filter(|v| !v.is_empty());

        Some(Self {
            order_id,
            result_code,
            raw_result_code,
            transaction_id,
            message,
            raw,
        })
    }

    pub fn classify(&self) -> PaymentOutcome {
        let classification = match self.result_code {
            Some(code) => classify_result_code(code),
            None => Classification {
                status: PaymentStatus::Failed,
                recognized: false,
            },
        };

        let mut outcome = PaymentOutcome::new(self.order_id.clone(), classification.status);
        outcome.transaction_id = self.transaction_id.clone();
        outcome.result_code = self.result_code;
        outcome.unrecognized_code = !classification.recognized;
        outcome.message = match (&self.message, classification.recognized) {
            (Some(message), _) => Some(message.clone()),
            (None, false) => Some(format!(
                "unrecognized result code: {}",
                self.raw_result_code.as_deref().unwrap_or("<missing>")
            )),
            (None, true) => None,
        };
        outcome
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressDecision {
    /// Not a payment redirect.
    Ignored,
    /// A payment redirect that cannot be trusted or routed.
    Rejected { reason: String },
    Classified(PaymentOutcome),
}

pub struct CallbackIngress {
    redirect_base: String,
    verify_signature: bool,
    provider: Arc<dyn WalletProvider>,
}

impl CallbackIngress {
    pub fn new(
        redirect_target: &str,
        verify_signature: bool,
        provider: Arc<dyn WalletProvider>,
    ) -> Self {
        Self {
            redirect_base: redirect_base(redirect_target).to_string(),
            verify_signature,
            provider,
        }
    }

    pub fn matches(&self, uri: &str) -> bool {
        !self.redirect_base.is_empty() && redirect_base(uri) == self.redirect_base
    }

    pub fn interpret(&self, uri: &str) -> IngressDecision {
        if !self.matches(uri) {
            debug!("ignoring non-payment redirect");
            return IngressDecision::Ignored;
        }

        let raw = parse_query(uri);
        if self.verify_signature && !self.provider.verify_redirect(&raw) {
            warn!(
                order_id = raw.get("orderId").map(String::as_str).unwrap_or(""),
                "payment redirect failed signature verification"
            );
            return IngressDecision::Rejected {
                reason: "signature mismatch".to_string(),
            };
        }

        let Some(params) = CallbackParams::from_query(raw) else {
            warn!("payment redirect carries no orderId");
            return IngressDecision::Rejected {
                reason: "missing orderId".to_string(),
            };
        };

        let outcome = params.classify();
        if outcome.unrecognized_code {
            let error = outcome
                .unrecognized()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "missing result code".to_string());
            warn!(
                order_id = %outcome.order_id,
                raw_result_code = params.raw_result_code.as_deref().unwrap_or(""),
                error = %error,
                "unrecognized provider result code, failing closed"
            );
        }
        IngressDecision::Classified(outcome)
    }
}

/// Scheme, host and path with the query, fragment and trailing `/` removed.
fn redirect_base(uri: &str) -> &str {
    let end = uri.find(['?', '#']).unwrap_or(uri.len());
    uri[..end].trim().trim_end_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::error::PaymentResult;
    use crate::payments::provider::{CreatePaymentResponse, ProviderStatus};
    use crate::payments::types::PaymentRequest;
    use async_trait::async_trait;

    struct StubProvider {
        accept_signatures: bool,
    }

    #[async_trait]
    impl WalletProvider for StubProvider {
        async fn create_payment(
            &self,
            _request: &PaymentRequest,
        ) -> PaymentResult<CreatePaymentResponse> {
            unreachable!("not used by ingress")
        }

        async fn query_status(&self, _order_id: &str) -> PaymentResult<ProviderStatus> {
            unreachable!("not used by ingress")
        }

        fn name(&self) -> &'static str {
            "stub"
        }

        fn partner_code(&self) -> &str {
            "STUB"
        }

        fn verify_redirect(&self, _params: &HashMap<String, String>) -> bool {
            self.accept_signatures
        }
    }

    fn ingress(verify: bool, accept: bool) -> CallbackIngress {
        CallbackIngress::new(
            "storefront://payment-result",
            verify,
            Arc::new(StubProvider {
                accept_signatures: accept,
            }),
        )
    }

    #[test]
    fn success_codes_map_to_success() {
        assert_eq!(classify_result_code(0).status, PaymentStatus::Success);
        assert_eq!(classify_result_code(9000).status, PaymentStatus::Success);
    }

    #[test]
    fn cancel_codes_map_to_cancelled() {
        assert_eq!(classify_result_code(1006).status, PaymentStatus::Cancelled);
        assert_eq!(classify_result_code(1003).status, PaymentStatus::Cancelled);
    }

    #[test]
    fn everything_else_fails_closed() {
        for code in [-1, 1, 42, 1000, 1001, 7000, 8999, 9001, 99999, i64::MIN, i64::MAX] {
            let classification = classify_result_code(code);
            assert_eq!(classification.status, PaymentStatus::Failed, "code {}", code);
        }
        assert!(classify_result_code(1001).recognized);
        assert!(!classify_result_code(424242).recognized);
    }

    #[test]
    fn query_path_keeps_in_progress_codes_open() {
        assert!(classify_query_code(1000).is_none());
        assert!(classify_query_code(7000).is_none());
        assert_eq!(
            classify_query_code(0).map(|c| c.status),
            Some(PaymentStatus::Success)
        );
    }

    #[test]
    fn parse_query_decodes_and_tolerates_missing_values() {
        let params =
            parse_query("storefront://payment-result?orderId=MOMO%201&flag&message=Th%C3%A0nh=c%C3%B4ng&&");
        assert_eq!(params.get("orderId").map(String::as_str), Some("MOMO 1"));
        assert_eq!(params.get("flag").map(String::as_str), Some(""));
        assert_eq!(params.get("message").map(String::as_str), Some("Thành=công"));
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn parse_query_without_question_mark_is_empty() {
        assert!(parse_query("storefront://payment-result").is_empty());
    }

    #[test]
    fn unrelated_uris_are_ignored() {
        let ingress = ingress(false, true);
        assert_eq!(
            ingress.interpret("storefront://product/42?orderId=X&resultCode=0"),
            IngressDecision::Ignored
        );
        assert_eq!(
            ingress.interpret("https://example.com/?orderId=X"),
            IngressDecision::Ignored
        );
    }

    #[test]
    fn redirect_is_classified_with_transaction_id() {
        let ingress = ingress(false, true);
        let decision = ingress.interpret(
            "storefront://payment-result/?orderId=MOMO1&resultCode=0&transId=2900000001&extra=1",
        );
        match decision {
            IngressDecision::Classified(outcome) => {
                assert_eq!(outcome.order_id, "MOMO1");
                assert_eq!(outcome.status, PaymentStatus::Success);
                assert_eq!(outcome.transaction_id.as_deref(), Some("2900000001"));
                assert_eq!(outcome.result_code, Some(0));
                assert!(!outcome.unrecognized_code);
            }
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn unrecognized_code_keeps_raw_value_for_audit() {
        let ingress = ingress(false, true);
        let IngressDecision::Classified(outcome) =
            ingress.interpret("storefront://payment-result?orderId=MOMO1&resultCode=31337")
        else {
            panic!("expected classification");
        };
        assert_eq!(outcome.status, PaymentStatus::Failed);
        assert!(outcome.unrecognized_code);
        assert_eq!(outcome.result_code, Some(31337));
    }

    #[test]
    fn non_numeric_code_fails_closed() {
        let ingress = ingress(false, true);
        let IngressDecision::Classified(outcome) =
            ingress.interpret("storefront://payment-result?orderId=MOMO1&resultCode=ok")
        else {
            panic!("expected classification");
        };
        assert_eq!(outcome.status, PaymentStatus::Failed);
        assert!(outcome.unrecognized_code);
        assert_eq!(
            outcome.message.as_deref(),
            Some("unrecognized result code: ok")
        );
    }

    #[test]
    fn missing_order_id_is_rejected() {
        let ingress = ingress(false, true);
        assert!(matches!(
            ingress.interpret("storefront://payment-result?resultCode=0"),
            IngressDecision::Rejected { .. }
        ));
    }

    #[test]
    fn bad_signature_is_rejected_when_verification_enabled() {
        let strict = ingress(true, false);
        assert!(matches!(
            strict.interpret("storefront://payment-result?orderId=MOMO1&resultCode=0"),
            IngressDecision::Rejected { .. }
        ));

        let lenient = ingress(false, false);
        assert!(matches!(
            lenient.interpret("storefront://payment-result?orderId=MOMO1&resultCode=0"),
            IngressDecision::Classified(_)
        ));
    }
}
