//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ledgerd_billing::BillingError;
use serde_json::json;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Validation errors
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Resource not found: {0}")]
    NotFound(String),
    #[error("Resource already exists: {0}")]
    Conflict(String),
    #[error("Insufficient permissions")]
    Forbidden,

    // Billing errors
    #[error("Payment required: {0}")]
    PaymentRequired(String),

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", self.to_string()),

            ApiError::PaymentRequired(msg) => {
                (StatusCode::PAYMENT_REQUIRED, "PAYMENT_REQUIRED", msg.clone())
            }

            // Internal details stay out of responses
            ApiError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "Database error".to_string(),
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                self.to_string(),
            ),
            ApiError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                self.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InsufficientCredits { .. } => ApiError::PaymentRequired(err.to_string()),
            BillingError::ProviderVerification(_) => ApiError::PaymentRequired(err.to_string()),

            BillingError::DuplicateReference(_)
            | BillingError::AlreadyProcessed(_)
            | BillingError::TrialCardReused => ApiError::Conflict(err.to_string()),

            BillingError::PlanNotFound(_)
            | BillingError::SubscriptionNotFound(_)
            | BillingError::UserNotFound(_) => ApiError::NotFound(err.to_string()),

            BillingError::NotOwner => ApiError::Forbidden,

            BillingError::InvalidAmount(_)
            | BillingError::NotAnUpgrade
            | BillingError::WebhookSignatureInvalid => ApiError::BadRequest(err.to_string()),

            BillingError::ProviderApi(_) => {
                tracing::error!(error = %err, "Provider API error");
                ApiError::ServiceUnavailable
            }

            BillingError::Database(msg) => ApiError::Database(msg),

            BillingError::NoPlansConfigured
            | BillingError::Config(_)
            | BillingError::Internal(_) => {
                tracing::error!(error = %err, "Internal billing error");
                ApiError::Internal
            }
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn test_billing_error_status_mapping() {
        let cases = [
            (
                ApiError::from(BillingError::InsufficientCredits {
                    available: Decimal::ZERO,
                    requested: Decimal::ONE,
                }),
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                ApiError::from(BillingError::TrialCardReused),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::from(BillingError::DuplicateReference("ch_1".into())),
                StatusCode::CONFLICT,
            ),
            (ApiError::from(BillingError::NotOwner), StatusCode::FORBIDDEN),
            (
                ApiError::from(BillingError::PlanNotFound("p".into())),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(BillingError::NotAnUpgrade),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(BillingError::Database("boom".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            let response = error.into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
