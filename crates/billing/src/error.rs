//! Billing error types
//!
//! Every failure carries an [`ErrorKind`] so the webhook boundary can decide,
//! without inspecting messages, whether to reject, acknowledge or ask the
//! provider to retry.

use crate::entitlement::CapacityError;

pub type BillingResult<T> = Result<T, BillingError>;

/// Coarse classification of billing failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Forged or stale webhook; nothing is persisted.
    SignatureInvalid,
    /// The event was already recorded; acknowledged without reprocessing.
    /// Reported through [`WebhookOutcome::kind`](crate::WebhookOutcome::kind).
    DuplicateEvent,
    /// Catalog or metadata problem that a retry cannot fix.
    Configuration,
    /// Nothing to act on: no linked license, or the license is canceled.
    /// Reported through [`WebhookOutcome::kind`](crate::WebhookOutcome::kind).
    LinkageNotFound,
    /// Outbound email failed; never affects event status.
    DownstreamNotification,
    /// Anything else; the provider should re-deliver.
    Unhandled,
}

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Webhook timestamp outside tolerance ({age_seconds}s)")]
    WebhookTimestampExpired { age_seconds: i64 },

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("No license tier configured for price {price_id}")]
    UnknownPrice { price_id: String },

    #[error("Missing required metadata: {0}")]
    MissingMetadata(String),

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Billing is not configured: {0}")]
    NotConfigured(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::WebhookSignatureInvalid | BillingError::WebhookTimestampExpired { .. } => {
                ErrorKind::SignatureInvalid
            }
            BillingError::UnknownPrice { .. }
            | BillingError::MissingMetadata(_)
            | BillingError::NotConfigured(_) => ErrorKind::Configuration,
            BillingError::Notification(_) => ErrorKind::DownstreamNotification,
            BillingError::MalformedPayload(_)
            | BillingError::InvalidInput(_)
            | BillingError::NotFound(_)
            | BillingError::Capacity(_)
            | BillingError::StripeApi(_)
            | BillingError::Database(_)
            | BillingError::Internal(_) => ErrorKind::Unhandled,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::MalformedPayload(err.to_string())
    }
}
