use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::booking::{Booking, BookingUpdate, Reservation, Room};
use crate::events::OutboxEntry;
use crate::hold::{Lease, PaymentHold};
use crate::CoreResult;

/// Transactional store for rooms and bookings
#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Flip the room to BOOKED and insert a pending booking atomically
    async fn reserve(&self, reservation: &Reservation) -> CoreResult<i64>;

    async fn get_booking(&self, booking_id: i64, user_id: i64) -> CoreResult<Option<Booking>>;

    /// Most recent booking a user holds on a room
    async fn find_latest_booking(&self, user_id: i64, room_id: i64) -> CoreResult<Option<Booking>>;

    /// Move an owned booking forward. Returns false when it is already at or
    /// past the requested status.
    async fn update_status(&self, update: &BookingUpdate) -> CoreResult<bool>;

    /// Release the room and drop the booking atomically
    async fn delete(&self, booking_id: i64, vendor_id: i64, room_id: i64) -> CoreResult<()>;

    async fn list_pending_before(&self, cutoff: DateTime<Utc>) -> CoreResult<Vec<Booking>>;

    async fn get_room(&self, room_id: i64) -> CoreResult<Option<Room>>;
}

/// Durable queue of events awaiting publication
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn claim_pending(&self, limit: i64) -> CoreResult<Vec<OutboxEntry>>;

    async fn mark_published(&self, id: i64) -> CoreResult<()>;

    async fn mark_failed(&self, id: i64, error: &str) -> CoreResult<()>;
}

/// Keyed store of in-flight payment attempts, one per user
#[async_trait]
pub trait PaymentHoldStore: Send + Sync {
    /// Unconditional upsert
    async fn hold(&self, user_id: i64, hold: &PaymentHold) -> CoreResult<()>;

    /// Write only when the user has no initial hold. Returns whether it was written.
    async fn hold_if_absent(&self, user_id: i64, hold: &PaymentHold) -> CoreResult<bool>;

    async fn get_active(&self, user_id: i64) -> CoreResult<Option<PaymentHold>>;

    /// Compare-and-set on the hold status
    async fn update_status(&self, user_id: i64, expected: &str, status: &str) -> CoreResult<bool>;

    /// Record the booking id on the hold if it still belongs to `order_id`
    async fn attach_booking(&self, user_id: i64, order_id: Uuid, booking_id: i64) -> CoreResult<bool>;

    /// Idempotent delete
    async fn remove(&self, user_id: i64) -> CoreResult<()>;

    /// Delete only if the hold still belongs to `order_id`
    async fn remove_if_order(&self, user_id: i64, order_id: Uuid) -> CoreResult<bool>;

    async fn list_holds(&self) -> CoreResult<Vec<PaymentHold>>;

    async fn acquire_lease(&self, user_id: i64, ttl: Duration) -> CoreResult<Option<Lease>>;

    async fn release_lease(&self, lease: &Lease) -> CoreResult<()>;
}
