//! Error responses of the facilitator API.

use std::time::Duration;

use agent402::error::PaymentError;
use agent402::proto::ErrorReason;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// A failed facilitator request, rendered as `{"error": reason, "message": details}`.
#[derive(Debug, thiserror::Error)]
pub enum FacilitatorError {
    /// The operation failed.
    #[error(transparent)]
    Payment(#[from] PaymentError),

    /// The operation did not finish in time. Its outcome is unknown.
    #[error("{operation} did not complete within {}s", .after.as_secs())]
    Timeout {
        /// `verify`, `settle` or `register`.
        operation: &'static str,
        /// The deadline that passed.
        after: Duration,
    },
}

impl FacilitatorError {
    /// The wire `error` string.
    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::Payment(err) => err.reason(),
            Self::Timeout { .. } => ErrorReason::UnexpectedError.as_str(),
        }
    }

    /// The HTTP status to answer with.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        let Self::Payment(err) = self else {
            return StatusCode::GATEWAY_TIMEOUT;
        };
        match err {
            PaymentError::UnsupportedNetwork { .. } | PaymentError::UnsupportedScheme(_) => {
                StatusCode::NOT_FOUND
            }
            PaymentError::InvalidPaymentPayload(_)
            | PaymentError::NoMatchingRequirements
            | PaymentError::PolicyExhausted { .. }
            | PaymentError::AuthorizationAddressMismatch { .. } => StatusCode::BAD_REQUEST,
            PaymentError::PolicyViolation(_) | PaymentError::Aborted { .. } => {
                StatusCode::FORBIDDEN
            }
            PaymentError::VerificationFailed(_) | PaymentError::SettlementFailed(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for FacilitatorError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = %status, reason = self.reason(), "request failed: {self}");
        }
        let body = serde_json::json!({
            "error": self.reason(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use agent402::error::SettleError;

    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                FacilitatorError::from(PaymentError::UnsupportedNetwork {
                    network: "eip155:1".into(),
                }),
                StatusCode::NOT_FOUND,
                "unsupported_network",
            ),
            (
                PaymentError::AuthorizationAddressMismatch {
                    expected: "0x1".into(),
                    actual: "0x2".into(),
                }
                .into(),
                StatusCode::BAD_REQUEST,
                "authorization_address_mismatch",
            ),
            (
                PaymentError::settlement_unexpected("rpc down").into(),
                StatusCode::BAD_GATEWAY,
                "unexpected_error",
            ),
            (
                FacilitatorError::Timeout {
                    operation: "settle",
                    after: Duration::from_secs(60),
                },
                StatusCode::GATEWAY_TIMEOUT,
                "unexpected_error",
            ),
        ];
        for (err, status, reason) in cases {
            assert_eq!(err.status(), status);
            assert_eq!(err.reason(), reason);
        }
    }

    #[tokio::test]
    async fn test_body_shape() {
        let err: FacilitatorError =
            PaymentError::SettlementFailed(SettleError::new("transaction_reverted")).into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "transaction_reverted");
        assert!(body["message"].as_str().unwrap().contains("transaction_reverted"));
    }
}
