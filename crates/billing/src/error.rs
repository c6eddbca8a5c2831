//! Billing error taxonomy

use std::borrow::Cow;

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// A required secret or setting is missing. Fatal for the request.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Store error: {0}")]
    Store(String),

    /// Conditional write lost against a concurrent update.
    #[error("Record was modified concurrently: {0}")]
    WriteConflict(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Never surfaced to callers; logged and swallowed by the email service.
    #[error("Notification error: {0}")]
    Notification(String),
}

impl BillingError {
    /// HTTP status class for this error when it ends a webhook request.
    pub fn status_code(&self) -> u16 {
        match self {
            BillingError::Validation(_) => 400,
            BillingError::UserNotFound(_) => 404,
            BillingError::Configuration(_)
            | BillingError::Store(_)
            | BillingError::WriteConflict(_)
            | BillingError::Timeout(_)
            | BillingError::Notification(_) => 500,
        }
    }

    /// Message safe to return to the payment provider.
    ///
    /// Validation messages describe the caller's own payload and are passed
    /// through; everything else is replaced by a fixed text.
    pub fn public_message(&self) -> Cow<'_, str> {
        match self {
            BillingError::Validation(msg) => Cow::Borrowed(msg.as_str()),
            BillingError::Configuration(_) => Cow::Borrowed("Server configuration error"),
            BillingError::UserNotFound(_) => Cow::Borrowed("User not found"),
            BillingError::Store(_) | BillingError::Timeout(_) => Cow::Borrowed("Database error"),
            BillingError::WriteConflict(_) => Cow::Borrowed("Concurrent update, please retry"),
            BillingError::Notification(_) => Cow::Borrowed("Processing error"),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Store(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::Notification(err.to_string())
    }
}
