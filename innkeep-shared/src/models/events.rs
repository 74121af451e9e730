use uuid::Uuid;

/// Payload published on the booking-created and payment-settled topics.
///
/// Consumed by the notification and settlement workers, so field names are
/// part of the wire contract.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct BookingEvent {
    pub room_id: i64,
    pub user_id: i64,
    pub order_id: Uuid,
    pub reference: String,
    pub transaction_id: String,
    pub status: i16,
    pub amount: f64,
}

impl BookingEvent {
    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
