use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::CoreResult;

/// Converts a major-unit amount to the integer minor units the gateway bills in.
pub fn to_minor_units(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRequest {
    pub order_id: Uuid,
    pub user_id: i64,
    pub room_id: i64,
    /// Per-day price in minor units
    pub unit_amount: i64,
    /// Number of days
    pub quantity: i32,
    pub currency: String,
    pub description: String,
}

impl SessionRequest {
    /// Metadata attached to the session so the gateway dashboard can be
    /// traced back to the order.
    pub fn metadata(&self) -> Vec<(&'static str, String)> {
        vec![
            ("order_id", self.order_id.to_string()),
            ("user_id", self.user_id.to_string()),
            ("room_id", self.room_id.to_string()),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentSession {
    pub id: String, // Provider's ID (e.g., cs_test_123)
    pub client_secret: Option<String>,
    pub url: Option<String>,
    pub status: String,
    pub capture_method: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Succeeded,
    Pending,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub id: String,
    pub status: String,
    pub payment_status: Option<String>,
    pub raw: serde_json::Value,
}

impl SessionStatus {
    pub fn outcome(&self) -> PaymentOutcome {
        match (self.status.as_str(), self.payment_status.as_deref()) {
            ("succeeded", _) => PaymentOutcome::Succeeded,
            ("complete", Some("paid")) | ("complete", Some("no_payment_required")) => {
                PaymentOutcome::Succeeded
            }
            ("expired", _) | ("canceled", _) | ("failed", _) => PaymentOutcome::Failed,
            _ => PaymentOutcome::Pending,
        }
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Open a checkout session for the given order
    async fn create_session(&self, request: &SessionRequest) -> CoreResult<PaymentSession>;

    /// Retrieve the current state of a session
    async fn get_status(&self, session_id: &str) -> CoreResult<SessionStatus>;

    /// Expire a session so it can no longer be paid
    async fn expire_session(&self, session_id: &str) -> CoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(status: &str, payment_status: Option<&str>) -> SessionStatus {
        SessionStatus {
            id: "SESS1".to_string(),
            status: status.to_string(),
            payment_status: payment_status.map(str::to_string),
            raw: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_minor_units_rounding() {
        assert_eq!(to_minor_units(100.0), 10000);
        assert_eq!(to_minor_units(19.99), 1999);
        assert_eq!(to_minor_units(0.1 + 0.2), 30);
    }

    #[test]
    fn test_outcome_classification() {
        assert_eq!(status("succeeded", None).outcome(), PaymentOutcome::Succeeded);
        assert_eq!(status("complete", Some("paid")).outcome(), PaymentOutcome::Succeeded);
        assert_eq!(status("complete", Some("unpaid")).outcome(), PaymentOutcome::Pending);
        assert_eq!(status("open", Some("unpaid")).outcome(), PaymentOutcome::Pending);
        assert_eq!(status("processing", None).outcome(), PaymentOutcome::Pending);
        assert_eq!(status("expired", Some("unpaid")).outcome(), PaymentOutcome::Failed);
        assert_eq!(status("canceled", None).outcome(), PaymentOutcome::Failed);
    }
}
