use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::payment::PaymentSession;

pub const HOLD_STATUS_INITIAL: &str = "initial";
pub const HOLD_STATUS_FAILED: &str = "failed";

/// A user's in-flight payment attempt. At most one exists per user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentHold {
    pub order_id: Uuid,
    pub user_id: i64,
    pub payment_id: String,
    pub amount: f64,
    pub client_secret: Option<String>,
    pub transaction_id: String,
    pub customer_id: i64,
    pub room_id: i64,
    pub booking_id: Option<i64>,
    pub status: String,
    pub response: Option<String>,
    pub payment_url: Option<String>,
    pub capture_method: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentHold {
    pub fn open(order_id: Uuid, user_id: i64, room_id: i64, amount: f64, session: &PaymentSession) -> Self {
        let now = Utc::now();
        Self {
            order_id,
            user_id,
            payment_id: session.id.clone(),
            amount,
            client_secret: session.client_secret.clone(),
            transaction_id: session.id.clone(),
            customer_id: user_id,
            room_id,
            booking_id: None,
            status: HOLD_STATUS_INITIAL.to_string(),
            response: Some(session.status.clone()),
            payment_url: session.url.clone(),
            capture_method: session.capture_method.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Only holds in the initial state admit a confirmation.
    pub fn is_active(&self) -> bool {
        self.status == HOLD_STATUS_INITIAL
    }

    /// True when this hold was taken out for the given booking.
    pub fn covers(&self, booking_id: i64, room_id: i64) -> bool {
        self.room_id == room_id && self.booking_id.map_or(true, |id| id == booking_id)
    }
}

/// Short-lived per-user mutual exclusion token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub user_id: i64,
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> PaymentSession {
        PaymentSession {
            id: "SESS1".to_string(),
            client_secret: Some("secret_1".to_string()),
            url: Some("https://pay.example/SESS1".to_string()),
            status: "open".to_string(),
            capture_method: None,
            description: Some("booking_12".to_string()),
        }
    }

    #[test]
    fn test_open_hold_starts_initial() {
        let hold = PaymentHold::open(Uuid::new_v4(), 7, 12, 100.0, &session());
        assert!(hold.is_active());
        assert_eq!(hold.payment_id, "SESS1");
        assert_eq!(hold.customer_id, 7);
        assert_eq!(hold.client_secret.as_deref(), Some("secret_1"));
        assert_eq!(hold.booking_id, None);
    }

    #[test]
    fn test_covers_checks_room_and_booking() {
        let mut hold = PaymentHold::open(Uuid::new_v4(), 7, 12, 100.0, &session());
        assert!(hold.covers(3, 12));
        assert!(!hold.covers(3, 13));

        hold.booking_id = Some(4);
        assert!(hold.covers(4, 12));
        assert!(!hold.covers(3, 12));
    }
}
