pub mod booking;
pub mod events;
pub mod hold;
pub mod memory;
pub mod payment;
pub mod repository;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    ValidationError(String),
    #[error("Payment already in progress: {0}")]
    AdmissionError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("No active payment for user {0}")]
    NoActivePayment(i64),
    #[error("Payment {0} has not completed yet")]
    PaymentPending(String),
    #[error("Payment {0} failed with status {1}")]
    PaymentFailed(String, String),
    #[error("Payment gateway error: {0}")]
    GatewayError(String),
    #[error("Room {0} is not available")]
    RoomUnavailable(i64),
    #[error("Store error: {0}")]
    StoreError(String),
    #[error("Publish error: {0}")]
    PublishError(String),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Deadline exceeded after {0}ms")]
    DeadlineExceeded(u64),
}

pub type CoreResult<T> = Result<T, CoreError>;
