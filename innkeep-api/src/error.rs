use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use innkeep_core::CoreError;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug)]
pub enum AppError {
    AuthenticationError(String),
    AuthorizationError(String),
    ValidationError(String),
    NotFoundError(String),
    ConflictError(String),
    PaymentRequired(String),
    UpstreamError(String),
    TimeoutError(String),
    InternalServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, correlation_id) = match self {
            AppError::AuthenticationError(msg) => (StatusCode::UNAUTHORIZED, msg, None),
            AppError::AuthorizationError(msg) => (StatusCode::FORBIDDEN, msg, None),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg, None),
            AppError::NotFoundError(msg) => (StatusCode::NOT_FOUND, msg, None),
            AppError::ConflictError(msg) => (StatusCode::CONFLICT, msg, None),
            AppError::PaymentRequired(msg) => (StatusCode::PAYMENT_REQUIRED, msg, None),
            AppError::UpstreamError(msg) => {
                let id = Uuid::new_v4();
                tracing::error!(correlation_id = %id, "Upstream failure: {}", msg);
                (StatusCode::BAD_GATEWAY, "Payment provider unavailable".to_string(), Some(id))
            }
            AppError::TimeoutError(msg) => {
                let id = Uuid::new_v4();
                tracing::error!(correlation_id = %id, "Request timed out: {}", msg);
                (StatusCode::GATEWAY_TIMEOUT, "Request timed out".to_string(), Some(id))
            }
            AppError::InternalServerError(msg) => {
                let id = Uuid::new_v4();
                tracing::error!(correlation_id = %id, "Internal Server Error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string(), Some(id))
            }
        };

        let body = match correlation_id {
            Some(id) => Json(json!({ "error": error_message, "correlation_id": id })),
            None => Json(json!({ "error": error_message })),
        };

        (status, body).into_response()
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ValidationError(msg) => AppError::ValidationError(msg),
            CoreError::NotFound(msg) => AppError::NotFoundError(format!("{} not found", msg)),
            CoreError::AdmissionError(_) => {
                AppError::ConflictError("Payment already in progress".to_string())
            }
            CoreError::RoomUnavailable(_) => AppError::ConflictError("Room unavailable".to_string()),
            CoreError::NoActivePayment(_) => {
                AppError::ValidationError("No active payment, initiate a booking first".to_string())
            }
            CoreError::PaymentPending(_) => {
                AppError::PaymentRequired("Payment not completed yet".to_string())
            }
            CoreError::PaymentFailed(_, status) => {
                AppError::PaymentRequired(format!("Payment failed ({})", status))
            }
            CoreError::GatewayError(msg) => AppError::UpstreamError(msg),
            CoreError::DeadlineExceeded(ms) => AppError::TimeoutError(format!("after {}ms", ms)),
            other @ (CoreError::StoreError(_)
            | CoreError::PublishError(_)
            | CoreError::SerializationError(_)) => AppError::InternalServerError(other.to_string()),
        }
    }
}
