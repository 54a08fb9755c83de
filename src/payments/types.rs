use crate::payments::error::{PaymentError, PaymentResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
        }
    }

    /// `pending` is the only status that may still change.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "pending" => Ok(PaymentStatus::Pending),
            "success" => Ok(PaymentStatus::Success),
            "failed" => Ok(PaymentStatus::Failed),
            "cancelled" | "canceled" => Ok(PaymentStatus::Cancelled),
            _ => Err(PaymentError::ValidationError {
                message: format!("unknown payment status: {}", value),
                field: Some("status".to_string()),
            }),
        }
    }
}

/// One payment attempt. Immutable once built by the launcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub order_id: String,
    pub request_id: String,
    pub amount: u64,
    pub order_info: String,
    pub redirect_target: String,
    pub created_at: DateTime<Utc>,
}

impl PaymentRequest {
    pub fn validate(&self) -> PaymentResult<()> {
        if self.amount == 0 {
            return Err(PaymentError::ValidationError {
                message: "amount must be greater than zero".to_string(),
                field: Some("amount".to_string()),
            });
        }
        if self.order_id.trim().is_empty() {
            return Err(PaymentError::ValidationError {
                message: "order id is required".to_string(),
                field: Some("orderId".to_string()),
            });
        }
        Ok(())
    }
}

/// A classified status for one order, as carried between components.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOutcome {
    pub order_id: String,
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
    pub result_code: Option<i64>,
    pub message: Option<String>,
    #[serde(default)]
    pub unrecognized_code: bool,
}

impl PaymentOutcome {
    pub fn pending(order_id: impl Into<String>) -> Self {
        Self::new(order_id, PaymentStatus::Pending)
    }

    pub fn new(order_id: impl Into<String>, status: PaymentStatus) -> Self {
        Self {
            order_id: order_id.into(),
            status,
            transaction_id: None,
            result_code: None,
            message: None,
            unrecognized_code: false,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The audit error behind a fail-closed classification. `None` for
    /// recognized codes and for redirects with no numeric code at all.
    pub fn unrecognized(&self) -> Option<PaymentError> {
        if !self.unrecognized_code {
            return None;
        }
        self.result_code
            .map(|code| PaymentError::UnrecognizedOutcome { code })
    }
}

/// The durable mirror of an order's status, as stored in the outcome store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOutcomeRecord {
    pub order_id: String,
    pub status: PaymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub unrecognized_code: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_info: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentOutcomeRecord {
    pub fn pending_for(request: &PaymentRequest) -> Self {
        Self {
            order_id: request.order_id.clone(),
            status: PaymentStatus::Pending,
            transaction_id: None,
            result_code: None,
            message: None,
            unrecognized_code: false,
            amount: Some(request.amount),
            order_info: Some(request.order_info.clone()),
            created_at: request.created_at,
            updated_at: request.created_at,
        }
    }

    pub fn from_outcome(outcome: &PaymentOutcome, now: DateTime<Utc>) -> Self {
        Self {
            order_id: outcome.order_id.clone(),
            status: outcome.status,
            transaction_id: outcome.transaction_id.clone(),
            result_code: outcome.result_code,
            message: outcome.message.clone(),
            unrecognized_code: outcome.unrecognized_code,
            amount: None,
            order_info: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Copies the outcome fields of `incoming` onto this record, keeping the
    /// launch audit fields already stored.
    pub fn apply(&mut self, incoming: &PaymentOutcomeRecord) {
        self.status = incoming.status;
        self.transaction_id = incoming.transaction_id.clone();
        self.result_code = incoming.result_code;
        self.message = incoming.message.clone();
        self.unrecognized_code = incoming.unrecognized_code;
        if self.amount.is_none() {
            self.amount = incoming.amount;
        }
        if self.order_info.is_none() {
            self.order_info = incoming.order_info.clone();
        }
        self.updated_at = incoming.updated_at;
    }

    pub fn to_outcome(&self) -> PaymentOutcome {
        PaymentOutcome {
            order_id: self.order_id.clone(),
            status: self.status,
            transaction_id: self.transaction_id.clone(),
            result_code: self.result_code,
            message: self.message.clone(),
            unrecognized_code: self.unrecognized_code,
        }
    }
}

/// Result of `initiate`. Only precondition failures are returned as `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentLaunchResult {
    Pending {
        order_id: String,
        launched_uri: String,
    },
    Failed {
        order_id: Option<String>,
        message: String,
        error: PaymentError,
    },
}

impl PaymentLaunchResult {
    pub fn status(&self) -> PaymentStatus {
        match self {
            PaymentLaunchResult::Pending { .. } => PaymentStatus::Pending,
            PaymentLaunchResult::Failed { .. } => PaymentStatus::Failed,
        }
    }

    pub fn order_id(&self) -> Option<&str> {
        match self {
            PaymentLaunchResult::Pending { order_id, .. } => Some(order_id),
            PaymentLaunchResult::Failed { order_id, .. } => order_id.as_deref(),
        }
    }
}

/// Which source settled an `await_result` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    AlreadySettled,
    LocalCallback,
    DurableStore,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitOutcome {
    pub outcome: PaymentOutcome,
    pub source: ResolutionSource,
}

impl WaitOutcome {
    pub fn timed_out(&self) -> bool {
        self.source == ResolutionSource::TimedOut
    }

    /// The settled outcome, or `TimeoutExceeded` when `waited` ran out first.
    pub fn into_result(self, waited: Duration) -> PaymentResult<PaymentOutcome> {
        if self.timed_out() {
            return Err(PaymentError::TimeoutExceeded {
                order_id: self.outcome.order_id,
                waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
            });
        }
        Ok(self.outcome)
    }
}
