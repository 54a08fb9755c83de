//! Request signing for the wallet provider.
//!
//! The provider recomputes the signature over the same `key=value` pairs in
//! the same order, so the field orders below are part of the wire contract.

use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::utils::secure_eq;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Field order of the create-payment signature.
pub const CREATE_PAYMENT_FIELDS: [&str; 10] = [
    "accessKey",
    "amount",
    "extraData",
    "ipnUrl",
    "orderId",
    "orderInfo",
    "partnerCode",
    "redirectUrl",
    "requestId",
    "requestType",
];

/// Field order of the status-query signature.
pub const QUERY_STATUS_FIELDS: [&str; 4] = ["accessKey", "orderId", "partnerCode", "requestId"];

/// Field order of the signature carried on the redirect back into the app.
pub const REDIRECT_RESULT_FIELDS: [&str; 13] = [
    "accessKey",
    "amount",
    "extraData",
    "message",
    "orderId",
    "orderInfo",
    "orderType",
    "partnerCode",
    "payType",
    "requestId",
    "responseTime",
    "resultCode",
    "transId",
];

/// Values signed on a create-payment request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePaymentParams {
    pub partner_code: String,
    pub access_key: String,
    pub amount: u64,
    pub extra_data: String,
    pub ipn_url: String,
    pub order_id: String,
    pub order_info: String,
    pub redirect_url: String,
    pub request_id: String,
    pub request_type: String,
}

impl CreatePaymentParams {
    /// `accessKey=..&amount=..&...&requestType=..` in contract order.
    pub fn canonical_string(&self) -> String {
        let amount = self.amount.to_string();
        let values: [&str; 10] = [
            &self.access_key,
            &amount,
            &self.extra_data,
            &self.ipn_url,
            &self.order_id,
            &self.order_info,
            &self.partner_code,
            &self.redirect_url,
            &self.request_id,
            &self.request_type,
        ];
        join_pairs(&CREATE_PAYMENT_FIELDS, &values)
    }
}

/// Keyed-hash signer holding the shared secret.
#[derive(Clone)]
pub struct SignatureEngine {
    secret_key: String,
}

impl std::fmt::Debug for SignatureEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureEngine")
            .field("secret_key", &crate::logging::mask_secret(&self.secret_key))
            .finish()
    }
}

impl SignatureEngine {
    pub fn new(secret_key: impl Into<String>) -> PaymentResult<Self> {
        let secret_key = secret_key.into();
        if secret_key.trim().is_empty() {
            return Err(PaymentError::ConfigurationError {
                message: "secret key is required for request signing".to_string(),
                field: Some("MOMO_SECRET_KEY".to_string()),
            });
        }
        Ok(Self { secret_key })
    }

    /// HMAC-SHA256 over `raw`, lowercase hex.
    pub fn sign(&self, raw: &str) -> PaymentResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes()).map_err(|e| {
            PaymentError::ConfigurationError {
                message: format!("invalid signing key: {}", e),
                field: Some("MOMO_SECRET_KEY".to_string()),
            }
        })?;
        mac.update(raw.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    pub fn sign_create_payment(&self, params: &CreatePaymentParams) -> PaymentResult<String> {
        self.sign(&params.canonical_string())
    }

    pub fn sign_query(
        &self,
        access_key: &str,
        order_id: &str,
        partner_code: &str,
        request_id: &str,
    ) -> PaymentResult<String> {
        let raw = join_pairs(
            &QUERY_STATUS_FIELDS,
            &[access_key, order_id, partner_code, request_id],
        );
        self.sign(&raw)
    }

    /// Checks the signature the provider attaches to a redirect. Missing
    /// fields are signed as empty strings.
    pub fn verify_redirect(
        &self,
        access_key: &str,
        lookup: impl Fn(&str) -> Option<String>,
        signature: &str,
    ) -> bool {
        let values: Vec<String> = REDIRECT_RESULT_FIELDS
            .iter()
            .map(|field| {
                if *field == "accessKey" {
                    access_key.to_string()
                } else {
                    lookup(field).unwrap_or_default()
                }
            })
            .collect();
        let refs: Vec<&str> = values.iter().map(String::as_str).collect();
        match self.sign(&join_pairs(&REDIRECT_RESULT_FIELDS, &refs)) {
            Ok(computed) => secure_eq(computed.as_bytes(), signature.trim().as_bytes()),
            Err(_) => false,
        }
    }
}

fn join_pairs(fields: &[&str], values: &[&str]) -> String {
    fields
        .iter()
        .zip(values.iter())
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> CreatePaymentParams {
        CreatePaymentParams {
            partner_code: "MOMO".to_string(),
            access_key: "F8BBA842ECF85".to_string(),
            amount: 50_000,
            extra_data: String::new(),
            ipn_url: "https://shop.example.com/ipn".to_string(),
            order_id: "MOMO1700000000000".to_string(),
            order_info: "order #1".to_string(),
            redirect_url: "storefront://payment-result".to_string(),
            request_id: "MOMO1700000000000".to_string(),
            request_type: "captureWallet".to_string(),
        }
    }

    #[test]
    fn canonical_string_follows_contract_order() {
        assert_eq!(
            params().canonical_string(),
            "accessKey=F8BBA842ECF85&amount=50000&extraData=&ipnUrl=https://shop.example.com/ipn\
             &orderId=MOMO1700000000000&orderInfo=order #1&partnerCode=MOMO\
             &redirectUrl=storefront://payment-result&requestId=MOMO1700000000000\
             &requestType=captureWallet"
        );
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let engine = SignatureEngine::new("K951B6PE1waDMi640xX08PD3vg6EkVlz").unwrap();
        let first = engine.sign_create_payment(&params()).unwrap();
        let second = engine.sign_create_payment(&params()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn known_hmac_vector() {
        // RFC 4231 test case 2.
        let engine = SignatureEngine::new("Jefe").unwrap();
        assert_eq!(
            engine.sign("what do ya want for nothing?").unwrap(),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn changing_any_field_changes_signature() {
        let engine = SignatureEngine::new("secret").unwrap();
        let base = engine.sign_create_payment(&params()).unwrap();

        let mutations: Vec<Box<dyn Fn(&mut CreatePaymentParams)>> = vec![
            Box::new(|p| p.access_key.push('x')),
            Box::new(|p| p.amount += 1),
            Box::new(|p| p.extra_data.push('x')),
            Box::new(|p| p.ipn_url.push('x')),
            Box::new(|p| p.order_id.push('x')),
            Box::new(|p| p.order_info.push('x')),
            Box::new(|p| p.partner_code.push('x')),
            Box::new(|p| p.redirect_url.push('x')),
            Box::new(|p| p.request_id.push('x')),
            Box::new(|p| p.request_type.push('x')),
        ];
        for mutate in mutations {
            let mut changed = params();
            mutate(&mut changed);
            assert_ne!(engine.sign_create_payment(&changed).unwrap(), base);
        }
    }

    #[test]
    fn reordered_fields_do_not_verify() {
        let engine = SignatureEngine::new("secret").unwrap();
        let p = params();
        let reordered = format!(
            "amount={}&accessKey={}&extraData=&ipnUrl={}&orderId={}&orderInfo={}&partnerCode={}\
             &redirectUrl={}&requestId={}&requestType={}",
            p.amount,
            p.access_key,
            p.ipn_url,
            p.order_id,
            p.order_info,
            p.partner_code,
            p.redirect_url,
            p.request_id,
            p.request_type
        );
        assert_ne!(
            engine.sign(&reordered).unwrap(),
            engine.sign_create_payment(&p).unwrap()
        );
    }

    #[test]
    fn empty_secret_is_a_configuration_error() {
        assert!(matches!(
            SignatureEngine::new("  "),
            Err(PaymentError::ConfigurationError { .. })
        ));
    }

    #[test]
    fn redirect_signature_round_trip() {
        let engine = SignatureEngine::new("secret").unwrap();
        let fields = |name: &str| match name {
            "orderId" => Some("MOMO1".to_string()),
            "resultCode" => Some("0".to_string()),
            "transId" => Some("T1".to_string()),
            _ => None,
        };
        let raw = "accessKey=AK&amount=&extraData=&message=&orderId=MOMO1&orderInfo=&orderType=\
                   &partnerCode=&payType=&requestId=&responseTime=&resultCode=0&transId=T1";
        let signature = engine.sign(raw).unwrap();
        assert!(engine.verify_redirect("AK", fields, &signature));
        assert!(!engine.verify_redirect("AK", fields, "deadbeef"));
    }
}
