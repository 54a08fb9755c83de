use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PaymentError {
    #[error("Configuration error: {message}")]
    ConfigurationError {
        message: String,
        field: Option<String>,
    },

    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    #[error("Transport error: {message}")]
    TransportError { message: String },

    #[error("Provider rejected request: {message}")]
    ProviderRejection {
        message: String,
        provider_code: Option<i64>,
    },

    #[error("Unrecognized provider result code: {code}")]
    UnrecognizedOutcome { code: i64 },

    #[error("Cannot open provider UI: {uri}")]
    CannotOpenProviderUi { uri: String },

    #[error("Duplicate order id: {order_id}")]
    DuplicateOrder { order_id: String },

    #[error("Timed out after {waited_ms}ms waiting for order {order_id}")]
    TimeoutExceeded { order_id: String, waited_ms: u64 },
}

impl PaymentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::ConfigurationError { .. } => false,
            PaymentError::ValidationError { .. } => false,
            PaymentError::TransportError { .. } => true,
            PaymentError::ProviderRejection { .. } => false,
            PaymentError::UnrecognizedOutcome { .. } => false,
            PaymentError::CannotOpenProviderUi { .. } => false,
            PaymentError::DuplicateOrder { .. } => false,
            PaymentError::TimeoutExceeded { .. } => true,
        }
    }

    /// Errors that are raised before any external call is made.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            PaymentError::ConfigurationError { .. }
                | PaymentError::ValidationError { .. }
                | PaymentError::DuplicateOrder { .. }
        )
    }

    pub fn user_message(&self) -> String {
        match self {
            PaymentError::ConfigurationError { .. } => {
                "Payments are not configured on this device".to_string()
            }
            PaymentError::ValidationError { message, .. } => message.clone(),
            PaymentError::TransportError { .. } => {
                "Payment provider is temporarily unavailable".to_string()
            }
            PaymentError::ProviderRejection { .. } => {
                "Payment provider could not start the payment".to_string()
            }
            PaymentError::UnrecognizedOutcome { .. } => "Payment was not completed".to_string(),
            PaymentError::CannotOpenProviderUi { .. } => {
                "The wallet app could not be opened on this device".to_string()
            }
            PaymentError::DuplicateOrder { .. } => {
                "A payment with this order already exists".to_string()
            }
            PaymentError::TimeoutExceeded { .. } => {
                "Payment confirmation is taking longer than expected".to_string()
            }
        }
    }
}

impl From<reqwest::Error> for PaymentError {
    fn from(err: reqwest::Error) -> Self {
        PaymentError::TransportError {
            message: err.to_string(),
        }
    }
}
