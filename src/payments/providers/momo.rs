use crate::logging::mask_secret;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::{CreatePaymentResponse, ProviderStatus, WalletProvider};
use crate::payments::signature::{CreatePaymentParams, SignatureEngine};
use crate::payments::types::PaymentRequest;
use crate::payments::utils::{PaymentHttpClient, RetryPolicy};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct MomoConfig {
    pub partner_code: String,
    pub access_key: String,
    pub secret_key: String,
    pub endpoint: String,
    pub redirect_url: String,
    pub ipn_url: String,
    pub request_type: String,
    pub lang: String,
    pub extra_data: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl std::fmt::Debug for MomoConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MomoConfig")
            .field("partner_code", &self.partner_code)
            .field("access_key", &mask_secret(&self.access_key))
            .field("secret_key", &mask_secret(&self.secret_key))
            .field("endpoint", &self.endpoint)
            .field("redirect_url", &self.redirect_url)
            .field("ipn_url", &self.ipn_url)
            .field("request_type", &self.request_type)
            .field("lang", &self.lang)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl Default for MomoConfig {
    fn default() -> Self {
        Self {
            partner_code: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
            endpoint: "https://test-payment.momo.vn".to_string(),
            redirect_url: "storefront://payment-result".to_string(),
            ipn_url: String::new(),
            request_type: "captureWallet".to_string(),
            lang: "vi".to_string(),
            extra_data: String::new(),
            timeout_secs: 30,
            max_retries: 2,
        }
    }
}

impl MomoConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let defaults = Self::default();
        let config = Self {
            partner_code: std::env::var("MOMO_PARTNER_CODE").unwrap_or_default(),
            access_key: std::env::var("MOMO_ACCESS_KEY").unwrap_or_default(),
            secret_key: std::env::var("MOMO_SECRET_KEY").unwrap_or_default(),
            endpoint: std::env::var("MOMO_ENDPOINT").unwrap_or_default(),
            redirect_url: std::env::var("MOMO_REDIRECT_URL").unwrap_or(defaults.redirect_url),
            ipn_url: std::env::var("MOMO_IPN_URL").unwrap_or(defaults.ipn_url),
            request_type: std::env::var("MOMO_REQUEST_TYPE").unwrap_or(defaults.request_type),
            lang: std::env::var("MOMO_LANG").unwrap_or(defaults.lang),
            extra_data: std::env::var("MOMO_EXTRA_DATA").unwrap_or(defaults.extra_data),
            timeout_secs: std::env::var("MOMO_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(defaults.timeout_secs),
            max_retries: std::env::var("MOMO_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(defaults.max_retries),
        };
        config.validate()?;
        Ok(config)
    }

    /// Fails with a configuration error naming every missing credential.
    pub fn validate(&self) -> PaymentResult<()> {
        let missing: Vec<&str> = [
            ("MOMO_PARTNER_CODE", &self.partner_code),
            ("MOMO_ACCESS_KEY", &self.access_key),
            ("MOMO_SECRET_KEY", &self.secret_key),
            ("MOMO_ENDPOINT", &self.endpoint),
            ("MOMO_REDIRECT_URL", &self.redirect_url),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect();

        if !missing.is_empty() {
            return Err(PaymentError::ConfigurationError {
                message: format!("{} required", missing.join(", ")),
                field: missing.first().map(|name| name.to_string()),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MomoCreateBody<'a> {
    partner_code: &'a str,
    access_key: &'a str,
    request_id: &'a str,
    amount: u64,
    order_id: &'a str,
    order_info: &'a str,
    redirect_url: &'a str,
    ipn_url: &'a str,
    extra_data: &'a str,
    request_type: &'a str,
    signature: String,
    lang: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MomoCreateReply {
    result_code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    pay_url: Option<String>,
    #[serde(default)]
    deeplink: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MomoQueryBody<'a> {
    partner_code: &'a str,
    access_key: &'a str,
    request_id: &'a str,
    order_id: &'a str,
    signature: String,
    lang: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MomoQueryReply {
    #[serde(default)]
    order_id: Option<String>,
    result_code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    trans_id: Option<serde_json::Value>,
}

pub struct MomoProvider {
    config: MomoConfig,
    signer: SignatureEngine,
    http: PaymentHttpClient,
}

impl MomoProvider {
    pub fn new(config: MomoConfig) -> PaymentResult<Self> {
        config.validate()?;
        let signer = SignatureEngine::new(config.secret_key.clone())?;
        let http =
            PaymentHttpClient::new(Duration::from_secs(config.timeout_secs), config.max_retries)?;
        Ok(Self {
            config,
            signer,
            http,
        })
    }

    pub fn from_env() -> PaymentResult<Self> {
        Self::new(MomoConfig::from_env()?)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    pub fn signing_params(&self, request: &PaymentRequest) -> CreatePaymentParams {
        CreatePaymentParams {
            partner_code: self.config.partner_code.clone(),
            access_key: self.config.access_key.clone(),
            amount: request.amount,
            extra_data: self.config.extra_data.clone(),
            ipn_url: self.config.ipn_url.clone(),
            order_id: request.order_id.clone(),
            order_info: request.order_info.clone(),
            redirect_url: request.redirect_target.clone(),
            request_id: request.request_id.clone(),
            request_type: self.config.request_type.clone(),
        }
    }
}

#[async_trait]
impl WalletProvider for MomoProvider {
    async fn create_payment(
        &self,
        request: &PaymentRequest,
    ) -> PaymentResult<CreatePaymentResponse> {
        request.validate()?;
        let params = self.signing_params(request);
        let signature = self.signer.sign_create_payment(&params)?;

        let body = MomoCreateBody {
            partner_code: &params.partner_code,
            access_key: &params.access_key,
            request_id: &params.request_id,
            amount: params.amount,
            order_id: &params.order_id,
            order_info: &params.order_info,
            redirect_url: &params.redirect_url,
            ipn_url: &params.ipn_url,
            extra_data: &params.extra_data,
            request_type: &params.request_type,
            signature,
            lang: &self.config.lang,
        };

        let reply: MomoCreateReply = self
            .http
            .post_json(
                &self.endpoint("/v2/gateway/api/create"),
                &body,
                RetryPolicy::ConnectOnly,
            )
            .await?;

        info!(
            order_id = %request.order_id,
            result_code = reply.result_code,
            has_pay_url = reply.pay_url.is_some(),
            "momo payment created"
        );

        Ok(CreatePaymentResponse {
            result_code: reply.result_code,
            message: reply.message,
            pay_url: reply.pay_url,
            deeplink: reply.deeplink,
        })
    }

    async fn query_status(&self, order_id: &str) -> PaymentResult<ProviderStatus> {
        let request_id = Uuid::new_v4().to_string();
        let signature = self.signer.sign_query(
            &self.config.access_key,
            order_id,
            &self.config.partner_code,
            &request_id,
        )?;
        let body = MomoQueryBody {
            partner_code: &self.config.partner_code,
            access_key: &self.config.access_key,
            request_id: &request_id,
            order_id,
            signature,
            lang: &self.config.lang,
        };

        let reply: MomoQueryReply = self
            .http
            .post_json(
                &self.endpoint("/v2/gateway/api/query"),
                &body,
                RetryPolicy::Idempotent,
            )
            .await?;

        if let Some(reported) = reply.order_id.as_deref() {
            if reported != order_id {
                warn!(order_id = %order_id, reported = %reported, "momo query answered for another order");
                return Err(PaymentError::ProviderRejection {
                    message: format!("query reply carries order id {}", reported),
                    provider_code: Some(reply.result_code),
                });
            }
        }

        // transId is numeric on query replies and a string on redirects.
        let transaction_id = match reply.trans_id {
            Some(serde_json::Value::Number(n)) if n.as_i64() != Some(0) => Some(n.to_string()),
            Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s),
            _ => None,
        };

        Ok(ProviderStatus {
            order_id: order_id.to_string(),
            result_code: reply.result_code,
            message: reply.message,
            transaction_id,
        })
    }

    fn name(&self) -> &'static str {
        "momo"
    }

    fn partner_code(&self) -> &str {
        &self.config.partner_code
    }

    fn verify_redirect(&self, params: &HashMap<String, String>) -> bool {
        let Some(signature) = params.get("signature") else {
            warn!("redirect carries no signature");
            return false;
        };
        self.signer.verify_redirect(
            &self.config.access_key,
            |field| params.get(field).cloned(),
            signature,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn config() -> MomoConfig {
        MomoConfig {
            partner_code: "MOMO".to_string(),
            access_key: "F8BBA842ECF85".to_string(),
            secret_key: "K951B6PE1waDMi640xX08PD3vg6EkVlz".to_string(),
            endpoint: "http://127.0.0.1:9".to_string(),
            ipn_url: "https://shop.example.com/ipn".to_string(),
            timeout_secs: 1,
            max_retries: 0,
            ..Default::default()
        }
    }

    fn request() -> PaymentRequest {
        PaymentRequest {
            order_id: "MOMO1700000000000".to_string(),
            request_id: "MOMO1700000000000".to_string(),
            amount: 50_000,
            order_info: "order #1".to_string(),
            redirect_target: "storefront://payment-result".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn missing_credentials_fail_fast() {
        let err = MomoProvider::new(MomoConfig::default())
            .err()
            .expect("empty config must be rejected");
        match err {
            PaymentError::ConfigurationError { message, field } => {
                assert!(message.contains("MOMO_PARTNER_CODE"));
                assert!(message.contains("MOMO_SECRET_KEY"));
                assert_eq!(field.as_deref(), Some("MOMO_PARTNER_CODE"));
            }
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn signing_params_use_configured_values() {
        let provider = MomoProvider::new(config()).unwrap();
        let params = provider.signing_params(&request());
        assert_eq!(params.partner_code, "MOMO");
        assert_eq!(params.request_type, "captureWallet");
        assert_eq!(params.redirect_url, "storefront://payment-result");
    }

    #[test]
    fn create_body_carries_wire_field_names() {
        let body = MomoCreateBody {
            partner_code: "MOMO",
            access_key: "AK",
            request_id: "R1",
            amount: 1000,
            order_id: "O1",
            order_info: "info",
            redirect_url: "storefront://payment-result",
            ipn_url: "https://shop.example.com/ipn",
            extra_data: "",
            request_type: "captureWallet",
            signature: "abc".to_string(),
            lang: "vi",
        };
        let json = serde_json::to_value(&body).unwrap();
        for key in [
            "partnerCode",
            "accessKey",
            "requestId",
            "amount",
            "orderId",
            "orderInfo",
            "redirectUrl",
            "ipnUrl",
            "extraData",
            "requestType",
            "signature",
            "lang",
        ] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
    }

    #[test]
    fn create_reply_without_pay_url_deserializes() {
        let reply: MomoCreateReply =
            serde_json::from_str(r#"{"resultCode":0,"message":"Successful."}"#).unwrap();
        assert_eq!(reply.result_code, 0);
        assert!(reply.pay_url.is_none());
    }

    #[tokio::test]
    async fn unreachable_endpoint_surfaces_transport_error() {
        let provider = MomoProvider::new(config()).unwrap();
        let result = provider.create_payment(&request()).await;
        assert!(matches!(result, Err(PaymentError::TransportError { .. })));
    }

    #[test]
    fn unsigned_redirect_is_rejected() {
        let provider = MomoProvider::new(config()).unwrap();
        let mut params = HashMap::new();
        params.insert("orderId".to_string(), "O1".to_string());
        assert!(!provider.verify_redirect(&params));
    }
}
