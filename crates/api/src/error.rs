//! API error type and HTTP mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use shopfront_billing::{BillingError, DenyReason};
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited")]
    RateLimited,

    /// Entitlement denial; 403 for a tier gap, 402 for a payment problem
    #[error("access denied")]
    Denied(DenyReason),

    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Denied(DenyReason::UpgradeRequired { .. }) => StatusCode::FORBIDDEN,
            ApiError::Denied(DenyReason::PaymentRequired { .. }) => StatusCode::PAYMENT_REQUIRED,
            ApiError::Billing(err) => match err {
                BillingError::WebhookSignatureInvalid
                | BillingError::WebhookPayloadInvalid(_)
                | BillingError::InvalidTier(_) => StatusCode::BAD_REQUEST,
                BillingError::AccountNotFound(_) | BillingError::SubscriptionNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                BillingError::EventAlreadyProcessed(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = match &self {
            ApiError::Denied(reason) => json!({ "error": self.to_string(), "reason": reason }),
            // Internals are logged, not leaked.
            ApiError::Internal(_) => json!({ "error": "internal error" }),
            ApiError::Billing(_) if status.is_server_error() => {
                json!({ "error": "internal error" })
            }
            other => json!({ "error": other.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}
