//! Error types for Larder

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LarderError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid subscription tier: {0}")]
    InvalidTier(String),

    #[error("Billing error: {0}")]
    Billing(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
