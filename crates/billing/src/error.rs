//! Billing error types

use larder_shared::SubscriptionTier;
use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: SubscriptionTier,
        to: SubscriptionTier,
        reason: String,
    },

    #[error("Payment method required for this operation")]
    PaymentMethodRequired,

    /// Network failure, timeout or rejected call at the payment provider.
    #[error("Payment provider error: {message}")]
    ExternalProviderFailure { message: String, retryable: bool },

    /// The provider's state contradicts what we recorded locally.
    #[error("Payment provider state drift: {0}")]
    ExternalStateDrift(String),

    #[error("No external subscription to apply reward to for user {0}")]
    RewardTargetMissing(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Concurrent modification detected: {0}")]
    ConcurrentModification(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    pub fn invalid_transition(
        from: SubscriptionTier,
        to: SubscriptionTier,
        reason: impl Into<String>,
    ) -> Self {
        BillingError::InvalidTransition {
            from,
            to,
            reason: reason.into(),
        }
    }

    /// Provider failure that the caller may retry (network, timeout, 5xx)
    pub fn provider(message: impl Into<String>) -> Self {
        BillingError::ExternalProviderFailure {
            message: message.into(),
            retryable: true,
        }
    }

    /// Provider rejected the request outright (card declined, invalid params)
    pub fn provider_rejected(message: impl Into<String>) -> Self {
        BillingError::ExternalProviderFailure {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether the caller may retry the whole operation
    pub fn is_retryable(&self) -> bool {
        match self {
            BillingError::ExternalProviderFailure { retryable, .. } => *retryable,
            BillingError::ConcurrentModification(_) | BillingError::Database(_) => true,
            // A re-read of the provider may resolve drift
            BillingError::ExternalStateDrift(_) => true,
            _ => false,
        }
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        match &err {
            // 4xx responses other than rate limiting: the request itself was refused
            stripe::StripeError::Stripe(request_error)
                if request_error.http_status < 500 && request_error.http_status != 429 =>
            {
                BillingError::provider_rejected(err.to_string())
            }
            _ => BillingError::provider(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<larder_shared::LarderError> for BillingError {
    fn from(err: larder_shared::LarderError) -> Self {
        match err {
            larder_shared::LarderError::NotFound(msg) => BillingError::NotFound(msg),
            larder_shared::LarderError::InvalidTier(msg)
            | larder_shared::LarderError::Validation(msg) => BillingError::InvalidInput(msg),
            other => BillingError::Internal(other.to_string()),
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
