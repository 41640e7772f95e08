//! API error type and its JSON rendering

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use dealerhub_billing::{BillingError, CapacityError};
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    PaymentRequired(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("Upstream error: {0}")]
    BadGateway(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::PaymentRequired(_) => StatusCode::PAYMENT_REQUIRED,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "Internal server error");
                "Internal server error".to_string()
            }
            ApiError::BadGateway(detail) => {
                tracing::error!(error = %detail, "Upstream provider error");
                "Payment provider error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::WebhookSignatureInvalid
            | BillingError::WebhookTimestampExpired { .. }
            | BillingError::MalformedPayload(_) => ApiError::BadRequest(err.to_string()),
            BillingError::InvalidInput(msg) => ApiError::Validation(msg),
            BillingError::NotFound(what) => ApiError::NotFound(what),
            BillingError::Capacity(capacity) => capacity.into(),
            BillingError::NotConfigured(what) => {
                tracing::warn!(missing = %what, "Billing feature not configured");
                ApiError::ServiceUnavailable("Billing is not configured".to_string())
            }
            BillingError::StripeApi(msg) => ApiError::BadGateway(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<CapacityError> for ApiError {
    fn from(err: CapacityError) -> Self {
        match err {
            CapacityError::PastDue | CapacityError::SubscriptionNotActive { .. } => {
                ApiError::PaymentRequired(err.to_string())
            }
            CapacityError::NoLicense
            | CapacityError::Inactive
            | CapacityError::LimitReached { .. } => ApiError::Forbidden(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealerhub_billing::SubscriptionStatus;

    #[test]
    fn test_capacity_errors_map_to_403_or_402() {
        let limit: ApiError = BillingError::Capacity(CapacityError::LimitReached {
            current: 25,
            limit: 25,
        })
        .into();
        assert_eq!(limit.status(), StatusCode::FORBIDDEN);
        assert_eq!(limit.to_string(), "Car limit reached (25/25)");

        let past_due: ApiError = BillingError::Capacity(CapacityError::PastDue).into();
        assert_eq!(past_due.status(), StatusCode::PAYMENT_REQUIRED);

        let unpaid: ApiError = CapacityError::SubscriptionNotActive {
            status: SubscriptionStatus::Unpaid,
        }
        .into();
        assert_eq!(unpaid.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn test_billing_error_mapping() {
        let sig: ApiError = BillingError::WebhookSignatureInvalid.into();
        assert_eq!(sig.status(), StatusCode::BAD_REQUEST);

        let missing: ApiError = BillingError::NotConfigured("STRIPE_SECRET_KEY".to_string()).into();
        assert_eq!(missing.status(), StatusCode::SERVICE_UNAVAILABLE);

        let db: ApiError = BillingError::Database("connection reset".to_string()).into();
        assert_eq!(db.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
