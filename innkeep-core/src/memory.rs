//! In-memory collaborators for tests and local runs without infrastructure.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::booking::{Booking, BookingStatus, BookingUpdate, Reservation, Room, RoomStatus};
use crate::events::{EventPublisher, OutboxEntry, OutboxMessage};
use crate::hold::{Lease, PaymentHold, HOLD_STATUS_INITIAL};
use crate::payment::{PaymentGateway, PaymentSession, SessionRequest, SessionStatus};
use crate::repository::{BookingStore, OutboxStore, PaymentHoldStore};
use crate::{CoreError, CoreResult};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Bookings + outbox
// ============================================================================

#[derive(Debug, Clone)]
struct OutboxRow {
    entry: OutboxEntry,
    claimed: bool,
    published: bool,
    last_error: Option<String>,
}

#[derive(Debug, Default)]
struct BookingState {
    rooms: BTreeMap<i64, Room>,
    bookings: BTreeMap<i64, Booking>,
    outbox: Vec<OutboxRow>,
    next_room_id: i64,
    next_booking_id: i64,
    next_outbox_id: i64,
    fail_reserve: bool,
}

impl BookingState {
    fn stage(&mut self, message: &OutboxMessage) {
        self.next_outbox_id += 1;
        self.outbox.push(OutboxRow {
            entry: OutboxEntry {
                id: self.next_outbox_id,
                message: message.clone(),
                attempts: 0,
                created_at: Utc::now(),
            },
            claimed: false,
            published: false,
            last_error: None,
        });
    }
}

/// Rooms, bookings and outbox rows behind a single lock, so every operation
/// is atomic the way a database transaction would be.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBookingStore {
    state: Arc<Mutex<BookingState>>,
}

impl InMemoryBookingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a vacant room and returns its id.
    pub fn seed_room(&self, cost: f64, vendor_id: i64) -> i64 {
        let mut state = locked(&self.state);
        state.next_room_id += 1;
        let id = state.next_room_id;
        let now = Utc::now();
        state.rooms.insert(
            id,
            Room {
                id,
                cost,
                status: RoomStatus::Vacant,
                vendor_id,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    /// Makes the next reservations fail with a store error.
    pub fn set_fail_reserve(&self, fail: bool) {
        locked(&self.state).fail_reserve = fail;
    }

    pub fn room(&self, room_id: i64) -> Option<Room> {
        locked(&self.state).rooms.get(&room_id).cloned()
    }

    pub fn bookings(&self) -> Vec<Booking> {
        locked(&self.state).bookings.values().cloned().collect()
    }

    /// Every outbox message ever staged, in insertion order.
    pub fn outbox_messages(&self) -> Vec<OutboxMessage> {
        locked(&self.state)
            .outbox
            .iter()
            .map(|row| row.entry.message.clone())
            .collect()
    }

    pub fn unpublished_count(&self) -> usize {
        locked(&self.state).outbox.iter().filter(|row| !row.published).count()
    }

    /// Last recorded publish error for an outbox row.
    pub fn last_error(&self, outbox_id: i64) -> Option<String> {
        locked(&self.state)
            .outbox
            .iter()
            .find(|row| row.entry.id == outbox_id)
            .and_then(|row| row.last_error.clone())
    }

    /// Ages a booking so it falls behind reconciliation cutoffs.
    pub fn backdate_booking(&self, booking_id: i64, by: chrono::Duration) {
        if let Some(booking) = locked(&self.state).bookings.get_mut(&booking_id) {
            booking.created_at -= by;
        }
    }
}

#[async_trait]
impl BookingStore for InMemoryBookingStore {
    async fn reserve(&self, reservation: &Reservation) -> CoreResult<i64> {
        let mut state = locked(&self.state);
        if state.fail_reserve {
            return Err(CoreError::StoreError("reserve unavailable".to_string()));
        }

        let now = Utc::now();
        let vendor_id = match state.rooms.get_mut(&reservation.room_id) {
            Some(room) if room.status == RoomStatus::Vacant => {
                room.status = RoomStatus::Booked;
                room.updated_at = now;
                room.vendor_id
            }
            _ => return Err(CoreError::RoomUnavailable(reservation.room_id)),
        };

        state.next_booking_id += 1;
        let id = state.next_booking_id;
        state.bookings.insert(
            id,
            Booking {
                id,
                days: reservation.days,
                user_id: reservation.user_id,
                room_id: reservation.room_id,
                vendor_id,
                status: BookingStatus::Pending,
                created_at: now,
                updated_at: now,
            },
        );
        if let Some(event) = &reservation.event {
            state.stage(event);
        }
        Ok(id)
    }

    async fn get_booking(&self, booking_id: i64, user_id: i64) -> CoreResult<Option<Booking>> {
        Ok(locked(&self.state)
            .bookings
            .get(&booking_id)
            .filter(|b| b.user_id == user_id)
            .cloned())
    }

    async fn find_latest_booking(&self, user_id: i64, room_id: i64) -> CoreResult<Option<Booking>> {
        Ok(locked(&self.state)
            .bookings
            .values()
            .rev()
            .find(|b| b.user_id == user_id && b.room_id == room_id)
            .cloned())
    }

    async fn update_status(&self, update: &BookingUpdate) -> CoreResult<bool> {
        let mut state = locked(&self.state);
        let booking = state
            .bookings
            .get_mut(&update.booking_id)
            .filter(|b| b.user_id == update.user_id)
            .ok_or_else(|| CoreError::NotFound(format!("booking {}", update.booking_id)))?;

        if booking.status >= update.status {
            return Ok(false);
        }
        booking.status = update.status;
        booking.days = update.days;
        booking.updated_at = Utc::now();

        if let Some(event) = &update.event {
            state.stage(event);
        }
        Ok(true)
    }

    async fn delete(&self, booking_id: i64, vendor_id: i64, room_id: i64) -> CoreResult<()> {
        let mut state = locked(&self.state);
        let room_owned = state
            .rooms
            .get(&room_id)
            .is_some_and(|room| room.vendor_id == vendor_id);
        if !room_owned {
            return Err(CoreError::NotFound(format!("room {} for vendor {}", room_id, vendor_id)));
        }
        let booking_matches = state
            .bookings
            .get(&booking_id)
            .is_some_and(|b| b.room_id == room_id);
        if !booking_matches {
            return Err(CoreError::NotFound(format!("booking {}", booking_id)));
        }

        state.bookings.remove(&booking_id);
        if let Some(room) = state.rooms.get_mut(&room_id) {
            room.status = RoomStatus::Vacant;
            room.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_pending_before(&self, cutoff: DateTime<Utc>) -> CoreResult<Vec<Booking>> {
        Ok(locked(&self.state)
            .bookings
            .values()
            .filter(|b| b.status == BookingStatus::Pending && b.created_at < cutoff)
            .cloned()
            .collect())
    }

    async fn get_room(&self, room_id: i64) -> CoreResult<Option<Room>> {
        Ok(self.room(room_id))
    }
}

#[async_trait]
impl OutboxStore for InMemoryBookingStore {
    async fn claim_pending(&self, limit: i64) -> CoreResult<Vec<OutboxEntry>> {
        let mut state = locked(&self.state);
        let mut claimed = Vec::new();
        for row in state.outbox.iter_mut() {
            if claimed.len() as i64 >= limit {
                break;
            }
            if row.published || row.claimed {
                continue;
            }
            row.claimed = true;
            row.entry.attempts += 1;
            claimed.push(row.entry.clone());
        }
        Ok(claimed)
    }

    async fn mark_published(&self, id: i64) -> CoreResult<()> {
        let mut state = locked(&self.state);
        if let Some(row) = state.outbox.iter_mut().find(|row| row.entry.id == id) {
            row.published = true;
            row.claimed = false;
            row.last_error = None;
        }
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str) -> CoreResult<()> {
        let mut state = locked(&self.state);
        if let Some(row) = state.outbox.iter_mut().find(|row| row.entry.id == id) {
            row.claimed = false;
            row.last_error = Some(error.to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Payment holds
// ============================================================================

#[derive(Debug, Default)]
struct HoldState {
    holds: HashMap<i64, PaymentHold>,
    leases: HashMap<i64, (String, Instant)>,
    fail_removals: bool,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryHoldStore {
    state: Arc<Mutex<HoldState>>,
}

impl InMemoryHoldStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes removals fail, simulating a cache outage after settlement.
    pub fn set_fail_removals(&self, fail: bool) {
        locked(&self.state).fail_removals = fail;
    }

    pub fn hold_count(&self) -> usize {
        locked(&self.state).holds.len()
    }

    pub fn peek(&self, user_id: i64) -> Option<PaymentHold> {
        locked(&self.state).holds.get(&user_id).cloned()
    }

    pub fn backdate_hold(&self, user_id: i64, by: chrono::Duration) {
        if let Some(hold) = locked(&self.state).holds.get_mut(&user_id) {
            hold.created_at -= by;
        }
    }
}

#[async_trait]
impl PaymentHoldStore for InMemoryHoldStore {
    async fn hold(&self, user_id: i64, hold: &PaymentHold) -> CoreResult<()> {
        locked(&self.state).holds.insert(user_id, hold.clone());
        Ok(())
    }

    async fn hold_if_absent(&self, user_id: i64, hold: &PaymentHold) -> CoreResult<bool> {
        let mut state = locked(&self.state);
        if state.holds.get(&user_id).is_some_and(PaymentHold::is_active) {
            return Ok(false);
        }
        state.holds.insert(user_id, hold.clone());
        Ok(true)
    }

    async fn get_active(&self, user_id: i64) -> CoreResult<Option<PaymentHold>> {
        Ok(self.peek(user_id))
    }

    async fn update_status(&self, user_id: i64, expected: &str, status: &str) -> CoreResult<bool> {
        let mut state = locked(&self.state);
        match state.holds.get_mut(&user_id) {
            Some(hold) if hold.status == expected => {
                hold.status = status.to_string();
                hold.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn attach_booking(&self, user_id: i64, order_id: Uuid, booking_id: i64) -> CoreResult<bool> {
        let mut state = locked(&self.state);
        match state.holds.get_mut(&user_id) {
            Some(hold) if hold.order_id == order_id => {
                hold.booking_id = Some(booking_id);
                hold.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove(&self, user_id: i64) -> CoreResult<()> {
        let mut state = locked(&self.state);
        if state.fail_removals {
            return Err(CoreError::StoreError("hold store unavailable".to_string()));
        }
        state.holds.remove(&user_id);
        Ok(())
    }

    async fn remove_if_order(&self, user_id: i64, order_id: Uuid) -> CoreResult<bool> {
        let mut state = locked(&self.state);
        if state.fail_removals {
            return Err(CoreError::StoreError("hold store unavailable".to_string()));
        }
        if state.holds.get(&user_id).is_some_and(|h| h.order_id == order_id) {
            state.holds.remove(&user_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn list_holds(&self) -> CoreResult<Vec<PaymentHold>> {
        Ok(locked(&self.state).holds.values().cloned().collect())
    }

    async fn acquire_lease(&self, user_id: i64, ttl: Duration) -> CoreResult<Option<Lease>> {
        let mut state = locked(&self.state);
        let now = Instant::now();
        if state.leases.get(&user_id).is_some_and(|(_, expires)| *expires > now) {
            return Ok(None);
        }
        let token = Uuid::new_v4().to_string();
        state.leases.insert(user_id, (token.clone(), now + ttl));
        Ok(Some(Lease { user_id, token }))
    }

    async fn release_lease(&self, lease: &Lease) -> CoreResult<()> {
        let mut state = locked(&self.state);
        if state
            .leases
            .get(&lease.user_id)
            .is_some_and(|(token, _)| *token == lease.token)
        {
            state.leases.remove(&lease.user_id);
        }
        Ok(())
    }
}

// ============================================================================
// Payment gateway
// ============================================================================

#[derive(Debug, Default)]
struct GatewayState {
    sessions: HashMap<String, (String, Option<String>)>,
    requests: Vec<SessionRequest>,
    expired: Vec<String>,
    next_id: u32,
    fail_on_create: bool,
    fail_on_status: bool,
    delay: Option<Duration>,
}

/// Gateway double issuing sessions `SESS1`, `SESS2`, ... that stay open
/// until a test settles them.
#[derive(Debug, Clone, Default)]
pub struct StubPaymentGateway {
    state: Arc<Mutex<GatewayState>>,
}

impl StubPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_on_create(&self, fail: bool) {
        locked(&self.state).fail_on_create = fail;
    }

    pub fn set_fail_on_status(&self, fail: bool) {
        locked(&self.state).fail_on_status = fail;
    }

    /// Delays every call, for exercising request deadlines.
    pub fn set_delay(&self, delay: Option<Duration>) {
        locked(&self.state).delay = delay;
    }

    pub fn set_status(&self, session_id: &str, status: &str, payment_status: Option<&str>) {
        locked(&self.state).sessions.insert(
            session_id.to_string(),
            (status.to_string(), payment_status.map(str::to_string)),
        );
    }

    /// Marks a session as paid.
    pub fn complete(&self, session_id: &str) {
        self.set_status(session_id, "complete", Some("paid"));
    }

    pub fn created_count(&self) -> usize {
        locked(&self.state).requests.len()
    }

    pub fn requests(&self) -> Vec<SessionRequest> {
        locked(&self.state).requests.clone()
    }

    pub fn expired_sessions(&self) -> Vec<String> {
        locked(&self.state).expired.clone()
    }

    async fn pause(&self) {
        let delay = locked(&self.state).delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl PaymentGateway for StubPaymentGateway {
    async fn create_session(&self, request: &SessionRequest) -> CoreResult<PaymentSession> {
        self.pause().await;
        let mut state = locked(&self.state);
        if state.fail_on_create {
            return Err(CoreError::GatewayError("session creation declined".to_string()));
        }

        state.next_id += 1;
        let id = format!("SESS{}", state.next_id);
        state
            .sessions
            .insert(id.clone(), ("open".to_string(), Some("unpaid".to_string())));
        state.requests.push(request.clone());

        Ok(PaymentSession {
            client_secret: Some(format!("{}_secret", id)),
            url: Some(format!("https://checkout.test/{}", id)),
            status: "open".to_string(),
            capture_method: Some("automatic".to_string()),
            description: Some(request.description.clone()),
            id,
        })
    }

    async fn get_status(&self, session_id: &str) -> CoreResult<SessionStatus> {
        self.pause().await;
        let state = locked(&self.state);
        if state.fail_on_status {
            return Err(CoreError::GatewayError("status lookup unavailable".to_string()));
        }
        let (status, payment_status) = state
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| CoreError::GatewayError(format!("no such session {}", session_id)))?;

        Ok(SessionStatus {
            id: session_id.to_string(),
            raw: serde_json::json!({
                "id": session_id,
                "status": status,
                "payment_status": payment_status,
            }),
            status,
            payment_status,
        })
    }

    async fn expire_session(&self, session_id: &str) -> CoreResult<()> {
        let mut state = locked(&self.state);
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.0 = "expired".to_string();
        }
        state.expired.push(session_id.to_string());
        Ok(())
    }
}

// ============================================================================
// Event publisher
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedEvent {
    pub topic: String,
    pub key: String,
    pub payload: String,
}

#[derive(Debug, Default)]
struct PublisherState {
    published: Vec<PublishedEvent>,
    fail: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingPublisher {
    state: Arc<Mutex<PublisherState>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        locked(&self.state).fail = fail;
    }

    pub fn published(&self) -> Vec<PublishedEvent> {
        locked(&self.state).published.clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<PublishedEvent> {
        locked(&self.state)
            .published
            .iter()
            .filter(|e| e.topic == topic)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: &str) -> CoreResult<()> {
        let mut state = locked(&self.state);
        if state.fail {
            return Err(CoreError::PublishError("broker unavailable".to_string()));
        }
        state.published.push(PublishedEvent {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(user_id: i64, room_id: i64) -> Reservation {
        Reservation {
            days: 2,
            user_id,
            room_id,
            event: Some(OutboxMessage::new("bookings", "key", "{}")),
        }
    }

    fn open_hold(user_id: i64) -> PaymentHold {
        let session = PaymentSession {
            id: "SESS1".to_string(),
            client_secret: None,
            url: None,
            status: "open".to_string(),
            capture_method: None,
            description: None,
        };
        PaymentHold::open(Uuid::new_v4(), user_id, 12, 100.0, &session)
    }

    #[tokio::test]
    async fn test_reserve_books_room_and_stages_event() {
        let store = InMemoryBookingStore::new();
        let room_id = store.seed_room(50.0, 3);

        let id = store.reserve(&reservation(7, room_id)).await.unwrap();

        assert_eq!(store.room(room_id).unwrap().status, RoomStatus::Booked);
        let booking = store.get_booking(id, 7).await.unwrap().unwrap();
        assert_eq!(booking.status, BookingStatus::Pending);
        assert_eq!(booking.vendor_id, 3);
        assert_eq!(store.unpublished_count(), 1);
    }

    #[tokio::test]
    async fn test_reserve_booked_room_is_unavailable() {
        let store = InMemoryBookingStore::new();
        let room_id = store.seed_room(50.0, 3);
        store.reserve(&reservation(7, room_id)).await.unwrap();

        let result = store.reserve(&reservation(8, room_id)).await;
        assert!(matches!(result, Err(CoreError::RoomUnavailable(id)) if id == room_id));
        assert_eq!(store.bookings().len(), 1);
        assert_eq!(store.unpublished_count(), 1);
    }

    #[tokio::test]
    async fn test_update_status_only_moves_forward() {
        let store = InMemoryBookingStore::new();
        let room_id = store.seed_room(50.0, 3);
        let id = store.reserve(&reservation(7, room_id)).await.unwrap();
        let update = BookingUpdate {
            booking_id: id,
            user_id: 7,
            days: 2,
            status: BookingStatus::Confirmed,
            event: None,
        };

        assert!(store.update_status(&update).await.unwrap());
        assert!(!store.update_status(&update).await.unwrap());

        let wrong_owner = BookingUpdate { user_id: 8, ..update };
        assert!(matches!(
            store.update_status(&wrong_owner).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_requires_vendor_and_frees_room() {
        let store = InMemoryBookingStore::new();
        let room_id = store.seed_room(50.0, 3);
        let id = store.reserve(&reservation(7, room_id)).await.unwrap();

        assert!(store.delete(id, 4, room_id).await.is_err());
        store.delete(id, 3, room_id).await.unwrap();

        assert_eq!(store.room(room_id).unwrap().status, RoomStatus::Vacant);
        assert!(store.get_booking(id, 7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_outbox_claim_and_retry() {
        let store = InMemoryBookingStore::new();
        let room_id = store.seed_room(50.0, 3);
        store.reserve(&reservation(7, room_id)).await.unwrap();

        let claimed = store.claim_pending(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(store.claim_pending(10).await.unwrap().is_empty());

        store.mark_failed(claimed[0].id, "broker down").await.unwrap();
        assert_eq!(store.last_error(claimed[0].id).as_deref(), Some("broker down"));

        let retried = store.claim_pending(10).await.unwrap();
        assert_eq!(retried[0].attempts, 2);
        store.mark_published(retried[0].id).await.unwrap();
        assert_eq!(store.unpublished_count(), 0);
    }

    #[tokio::test]
    async fn test_hold_if_absent_respects_active_hold() {
        let holds = InMemoryHoldStore::new();
        let first = open_hold(7);
        let second = open_hold(7);

        assert!(holds.hold_if_absent(7, &first).await.unwrap());
        assert!(!holds.hold_if_absent(7, &second).await.unwrap());
        assert_eq!(holds.peek(7).unwrap().order_id, first.order_id);

        assert!(holds.update_status(7, HOLD_STATUS_INITIAL, "failed").await.unwrap());
        assert!(holds.hold_if_absent(7, &second).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_if_order_keeps_newer_attempt() {
        let holds = InMemoryHoldStore::new();
        let stale = open_hold(7);
        let fresh = open_hold(7);
        holds.hold(7, &fresh).await.unwrap();

        assert!(!holds.remove_if_order(7, stale.order_id).await.unwrap());
        assert!(holds.remove_if_order(7, fresh.order_id).await.unwrap());
        holds.remove(7).await.unwrap();
        assert_eq!(holds.hold_count(), 0);
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_until_released() {
        let holds = InMemoryHoldStore::new();
        let ttl = Duration::from_secs(5);

        let lease = holds.acquire_lease(7, ttl).await.unwrap().unwrap();
        assert!(holds.acquire_lease(7, ttl).await.unwrap().is_none());
        assert!(holds.acquire_lease(8, ttl).await.unwrap().is_some());

        holds.release_lease(&lease).await.unwrap();
        assert!(holds.acquire_lease(7, ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stub_gateway_sequential_sessions() {
        let gateway = StubPaymentGateway::new();
        let request = SessionRequest {
            order_id: Uuid::new_v4(),
            user_id: 7,
            room_id: 12,
            unit_amount: 10000,
            quantity: 2,
            currency: "kes".to_string(),
            description: "booking_12".to_string(),
        };

        let s1 = gateway.create_session(&request).await.unwrap();
        let s2 = gateway.create_session(&request).await.unwrap();
        assert_eq!(s1.id, "SESS1");
        assert_eq!(s2.id, "SESS2");

        gateway.complete("SESS1");
        let status = gateway.get_status("SESS1").await.unwrap();
        assert_eq!(status.outcome(), crate::payment::PaymentOutcome::Succeeded);

        gateway.expire_session("SESS2").await.unwrap();
        assert_eq!(gateway.expired_sessions(), vec!["SESS2".to_string()]);
    }
}
