//! Billing error types

use rust_decimal::Decimal;
use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Insufficient credits: balance {available}, requested {requested}")]
    InsufficientCredits {
        available: Decimal,
        requested: Decimal,
    },

    #[error("Reference already processed: {0}")]
    DuplicateReference(String),

    #[error("Subscription already processed: {0}")]
    AlreadyProcessed(String),

    #[error("Card fingerprint already used for a trial")]
    TrialCardReused,

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("No active plans configured")]
    NoPlansConfigured,

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Subscription does not belong to user")]
    NotOwner,

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Upgrade requires a higher-priced plan")]
    NotAnUpgrade,

    #[error("Stripe API error: {0}")]
    ProviderApi(String),

    #[error("Subscription verification failed: {0}")]
    ProviderVerification(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::ProviderApi(err.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

/// True when the underlying database error is a unique-constraint violation.
/// Used by the trial gate to turn a lost insert race into a domain conflict.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// True when the underlying database error is a foreign-key violation.
/// The ledger uses this to turn an account insert for a nonexistent user
/// into `UserNotFound`.
pub fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_foreign_key_violation())
}

pub type BillingResult<T> = Result<T, BillingError>;
