use crate::payments::error::{PaymentError, PaymentResult};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

const MAX_BACKOFF: Duration = Duration::from_secs(8);

/// Error body the provider sends alongside non-2xx replies.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderErrorBody {
    result_code: Option<i64>,
    message: Option<String>,
}

/// Which failures a call may be repeated after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Repeating has no effect on the provider: connection failures, timeouts,
    /// 429 and 5xx replies are retried.
    Idempotent,
    /// The request may already have taken effect (same order id on retry), so
    /// only failures where it never reached the provider are retried:
    /// connect errors and 429.
    ConnectOnly,
}

impl RetryPolicy {
    fn retries_status(self, status: StatusCode) -> bool {
        match self {
            RetryPolicy::Idempotent => is_retryable_status(status),
            RetryPolicy::ConnectOnly => status == StatusCode::TOO_MANY_REQUESTS,
        }
    }

    fn retries_send_error(self, err: &reqwest::Error) -> bool {
        match self {
            RetryPolicy::Idempotent => true,
            RetryPolicy::ConnectOnly => err.is_connect(),
        }
    }
}

#[derive(Clone)]
pub struct PaymentHttpClient {
    client: Client,
    timeout: Duration,
    max_retries: u32,
}

impl PaymentHttpClient {
    pub fn new(timeout: Duration, max_retries: u32) -> PaymentResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PaymentError::TransportError {
                message: format!("failed to initialize HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            timeout,
            max_retries,
        })
    }

    /// POSTs `body` as JSON and decodes the JSON reply. Failures `policy`
    /// allows are retried with capped exponential backoff; other 429 and 5xx
    /// replies are transport errors, and anything else non-2xx is a rejection
    /// carrying the provider's code.
    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
        policy: RetryPolicy,
    ) -> PaymentResult<T> {
        let mut attempt = 0;
        loop {
            let sent = self
                .client
                .post(url)
                .timeout(self.timeout)
                .json(body)
                .send()
                .await;

            let (error, retry) = match sent {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    if status.is_success() {
                        return serde_json::from_str::<T>(&text).map_err(|e| {
                            PaymentError::ProviderRejection {
                                message: format!("invalid provider JSON response: {}", e),
                                provider_code: None,
                            }
                        });
                    }
                    if !is_retryable_status(status) {
                        return Err(rejection(status, &text));
                    }
                    (
                        PaymentError::TransportError {
                            message: format!("HTTP {}: {}", status, text),
                        },
                        policy.retries_status(status),
                    )
                }
                Err(e) => (
                    PaymentError::TransportError {
                        message: format!("provider request failed: {}", e),
                    },
                    policy.retries_send_error(&e),
                ),
            };

            if !retry || attempt >= self.max_retries {
                return Err(error);
            }
            warn!(
                attempt = attempt + 1,
                max_retries = self.max_retries,
                error = %error,
                "provider call failed, retrying"
            );
            tokio::time::sleep(backoff(attempt)).await;
            attempt += 1;
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(3)).min(MAX_BACKOFF)
}

fn rejection(status: StatusCode, text: &str) -> PaymentError {
    match serde_json::from_str::<ProviderErrorBody>(text) {
        Ok(body) => PaymentError::ProviderRejection {
            message: body
                .message
                .unwrap_or_else(|| format!("HTTP {}", status)),
            provider_code: body.result_code,
        },
        Err(_) => PaymentError::ProviderRejection {
            message: format!("HTTP {}: {}", status, text),
            provider_code: None,
        },
    }
}

pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
