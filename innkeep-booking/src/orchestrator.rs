use innkeep_core::booking::{Booking, BookingStatus, BookingUpdate, Reservation};
use innkeep_core::events::OutboxMessage;
use innkeep_core::hold::{Lease, PaymentHold, HOLD_STATUS_FAILED, HOLD_STATUS_INITIAL};
use innkeep_core::payment::{to_minor_units, PaymentGateway, PaymentOutcome, SessionRequest};
use innkeep_core::repository::{BookingStore, PaymentHoldStore};
use innkeep_core::{CoreError, CoreResult};
use innkeep_shared::models::BookingEvent;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::outbox::OutboxDispatcher;

pub const MAX_BOOKING_DAYS: i32 = 365;

#[derive(Debug, Clone)]
pub struct SagaSettings {
    pub currency: String,
    /// Upper bound on a whole Initiate or Confirm call
    pub request_deadline: Duration,
    pub lease_ttl: Duration,
    pub booking_topic: String,
    pub settlement_topic: String,
    pub event_key: String,
}

impl Default for SagaSettings {
    fn default() -> Self {
        Self {
            currency: "kes".to_string(),
            request_deadline: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(10),
            booking_topic: "booking.created".to_string(),
            settlement_topic: "payment.settled".to_string(),
            event_key: "booking".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitiateBooking {
    pub user_id: i64,
    pub room_id: i64,
    pub days: i32,
    /// Per-day price in major units
    pub amount: f64,
}

impl InitiateBooking {
    pub fn validate(&self) -> CoreResult<()> {
        if self.user_id <= 0 {
            return Err(CoreError::ValidationError("user_id must be positive".to_string()));
        }
        if self.room_id <= 0 {
            return Err(CoreError::ValidationError("room_id must be positive".to_string()));
        }
        if self.days < 1 || self.days > MAX_BOOKING_DAYS {
            return Err(CoreError::ValidationError(format!(
                "days must be between 1 and {}",
                MAX_BOOKING_DAYS
            )));
        }
        if !self.amount.is_finite() || self.amount <= 0.0 {
            return Err(CoreError::ValidationError("amount must be a positive number".to_string()));
        }
        Ok(())
    }
}

/// What the client needs to complete payment.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PaymentHandle {
    pub order_id: Uuid,
    pub session_id: String,
    pub client_secret: Option<String>,
    pub payment_url: Option<String>,
    pub room_id: i64,
    pub booking_id: Option<i64>,
    /// True when an earlier attempt is being resumed
    pub existing: bool,
}

impl PaymentHandle {
    fn resumed(hold: &PaymentHold) -> Self {
        Self {
            order_id: hold.order_id,
            session_id: hold.payment_id.clone(),
            client_secret: hold.client_secret.clone(),
            payment_url: hold.payment_url.clone(),
            room_id: hold.room_id,
            booking_id: hold.booking_id,
            existing: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Settlement {
    pub booking_id: i64,
    pub room_id: i64,
    pub order_id: Option<Uuid>,
    /// True when the booking was already confirmed before this call
    pub already_settled: bool,
}

/// Drives the reserve-then-pay saga across the hold store, the payment
/// gateway and the booking store.
pub struct BookingOrchestrator {
    bookings: Arc<dyn BookingStore>,
    holds: Arc<dyn PaymentHoldStore>,
    gateway: Arc<dyn PaymentGateway>,
    outbox: OutboxDispatcher,
    settings: SagaSettings,
}

impl BookingOrchestrator {
    pub fn new(
        bookings: Arc<dyn BookingStore>,
        holds: Arc<dyn PaymentHoldStore>,
        gateway: Arc<dyn PaymentGateway>,
        outbox: OutboxDispatcher,
        settings: SagaSettings,
    ) -> Self {
        Self {
            bookings,
            holds,
            gateway,
            outbox,
            settings,
        }
    }

    pub fn settings(&self) -> &SagaSettings {
        &self.settings
    }

    /// Open (or resume) a payment attempt and reserve the room.
    pub async fn initiate_booking(&self, request: InitiateBooking) -> CoreResult<PaymentHandle> {
        request.validate()?;
        let deadline = self.deadline();

        let lease = self.within(deadline, self.acquire_lease(request.user_id)).await?;
        let result = self.within(deadline, self.initiate_steps(&request)).await;
        // Released even when the deadline fired, so a retry is not locked out
        self.release_lease(&lease).await;
        result
    }

    /// Settle a booking once the gateway reports the payment as succeeded.
    pub async fn confirm_booking(&self, user_id: i64, booking_id: i64) -> CoreResult<Settlement> {
        let deadline = self.deadline();

        // 1. Ownership
        self.within(deadline, self.get_booking(user_id, booking_id)).await?;

        let lease = self.within(deadline, self.acquire_lease(user_id)).await?;
        let result = self.within(deadline, self.confirm_leased(user_id, booking_id)).await;
        self.release_lease(&lease).await;
        result
    }

    pub async fn get_booking(&self, user_id: i64, booking_id: i64) -> CoreResult<Booking> {
        self.bookings
            .get_booking(booking_id, user_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("booking {}", booking_id)))
    }

    /// Vendor-initiated release of a room and its booking.
    pub async fn cancel_booking(&self, vendor_id: i64, room_id: i64, booking_id: i64) -> CoreResult<()> {
        self.within(self.deadline(), async {
            self.bookings.delete(booking_id, vendor_id, room_id).await?;
            info!(booking_id, room_id, vendor_id, "Booking cancelled by vendor");
            Ok(())
        })
        .await
    }

    // ========================================================================
    // Initiate
    // ========================================================================

    async fn initiate_steps(&self, request: &InitiateBooking) -> CoreResult<PaymentHandle> {
        let user_id = request.user_id;

        // 1. Admission: one in-flight payment per user
        if let Some(active) = self.holds.get_active(user_id).await? {
            if active.is_active() {
                info!(user_id, order_id = %active.order_id, "Active payment found, resuming it");
                return Ok(PaymentHandle::resumed(&active));
            }
        }

        // 2. Gateway session, for a room that exists
        if self.bookings.get_room(request.room_id).await?.is_none() {
            return Err(CoreError::NotFound(format!("room {}", request.room_id)));
        }
        let order_id = Uuid::new_v4();
        let session = self
            .gateway
            .create_session(&SessionRequest {
                order_id,
                user_id,
                room_id: request.room_id,
                unit_amount: to_minor_units(request.amount),
                quantity: request.days,
                currency: self.settings.currency.clone(),
                description: format!("booking_{}", request.room_id),
            })
            .await?;

        // 3. Hold, unless a concurrent attempt got there first
        let hold = PaymentHold::open(order_id, user_id, request.room_id, request.amount, &session);
        if !self.holds.hold_if_absent(user_id, &hold).await? {
            warn!(user_id, session_id = %session.id, "Lost hold race, discarding new session");
            self.expire_quietly(&session.id).await;
            return match self.holds.get_active(user_id).await? {
                Some(winner) if winner.is_active() => Ok(PaymentHandle::resumed(&winner)),
                _ => Err(CoreError::AdmissionError(format!(
                    "payment attempt for user {} changed concurrently",
                    user_id
                ))),
            };
        }

        // 4. Reserve the room with the booking-created event in one transaction
        let event = BookingEvent {
            room_id: request.room_id,
            user_id,
            order_id,
            reference: session.id.clone(),
            transaction_id: session.id.clone(),
            status: BookingStatus::Pending.code(),
            amount: request.amount,
        };
        let reservation = Reservation {
            days: request.days,
            user_id,
            room_id: request.room_id,
            event: Some(self.stage(&self.settings.booking_topic, &event)?),
        };

        let booking_id = match self.bookings.reserve(&reservation).await {
            Ok(id) => id,
            Err(e) => {
                warn!(user_id, room_id = request.room_id, "Reservation failed, rolling back payment attempt: {}", e);
                self.abandon_attempt(user_id, order_id, &session.id).await;
                return Err(e);
            }
        };

        if let Err(e) = self.holds.attach_booking(user_id, order_id, booking_id).await {
            // Confirm still matches the hold by room
            warn!(user_id, booking_id, "Could not record booking on hold: {}", e);
        }

        // 5. Best-effort publish; the worker retries whatever is left
        self.flush_outbox().await;

        info!(user_id, booking_id, order_id = %order_id, session_id = %session.id, "Booking initiated");
        Ok(PaymentHandle {
            order_id,
            session_id: session.id,
            client_secret: session.client_secret,
            payment_url: session.url,
            room_id: request.room_id,
            booking_id: Some(booking_id),
            existing: false,
        })
    }

    async fn abandon_attempt(&self, user_id: i64, order_id: Uuid, session_id: &str) {
        if let Err(e) = self.holds.remove_if_order(user_id, order_id).await {
            error!(user_id, order_id = %order_id, "Hold left behind for reconciler: {}", e);
        }
        self.expire_quietly(session_id).await;
    }

    async fn expire_quietly(&self, session_id: &str) {
        if let Err(e) = self.gateway.expire_session(session_id).await {
            warn!(session_id, "Could not expire session: {}", e);
        }
    }

    // ========================================================================
    // Confirm
    // ========================================================================

    /// Runs under the lease. The status read before the lease may already be
    /// stale, so the booking is read again here.
    async fn confirm_leased(&self, user_id: i64, booking_id: i64) -> CoreResult<Settlement> {
        let booking = self.get_booking(user_id, booking_id).await?;
        if booking.status == BookingStatus::Pending {
            self.confirm_steps(&booking).await
        } else {
            self.converge_settled(&booking).await
        }
    }

    async fn confirm_steps(&self, booking: &Booking) -> CoreResult<Settlement> {
        let user_id = booking.user_id;

        // 2. Active hold for this booking
        let hold = match self.holds.get_active(user_id).await? {
            Some(hold) if hold.is_active() && hold.covers(booking.id, booking.room_id) => hold,
            _ => return Err(CoreError::NoActivePayment(user_id)),
        };

        // 3. Ask the gateway
        let status = self.gateway.get_status(&hold.payment_id).await?;
        debug!(session_id = %hold.payment_id, payload = %status.raw, "Gateway status");

        match status.outcome() {
            PaymentOutcome::Pending => Err(CoreError::PaymentPending(hold.payment_id)),
            PaymentOutcome::Failed => {
                self.holds
                    .update_status(user_id, HOLD_STATUS_INITIAL, HOLD_STATUS_FAILED)
                    .await?;
                info!(user_id, session_id = %hold.payment_id, status = %status.status, "Payment failed");

                // Free the room now rather than after the reconciler's grace period
                match self.bookings.delete(booking.id, booking.vendor_id, booking.room_id).await {
                    Ok(()) => info!(booking_id = booking.id, room_id = booking.room_id, "Unpaid booking released"),
                    Err(e) => warn!(booking_id = booking.id, "Unpaid booking left for reconciler: {}", e),
                }
                Err(CoreError::PaymentFailed(hold.payment_id, status.status))
            }
            PaymentOutcome::Succeeded => self.settle(booking, &hold).await,
        }
    }

    async fn settle(&self, booking: &Booking, hold: &PaymentHold) -> CoreResult<Settlement> {
        // 4. Transition with the settlement event in one transaction
        let event = BookingEvent {
            room_id: booking.room_id,
            user_id: booking.user_id,
            order_id: hold.order_id,
            reference: hold.transaction_id.clone(),
            transaction_id: hold.payment_id.clone(),
            status: BookingStatus::Confirmed.code(),
            amount: hold.amount,
        };
        let transitioned = self
            .bookings
            .update_status(&BookingUpdate {
                booking_id: booking.id,
                user_id: booking.user_id,
                days: booking.days,
                status: BookingStatus::Confirmed,
                event: Some(self.stage(&self.settings.settlement_topic, &event)?),
            })
            .await?;

        self.flush_outbox().await;

        // 5. Cleanup; a leftover hold is harmless and the reconciler sweeps it
        if let Err(e) = self.holds.remove_if_order(booking.user_id, hold.order_id).await {
            warn!(user_id = booking.user_id, "Hold cleanup deferred to reconciler: {}", e);
        }

        info!(booking_id = booking.id, order_id = %hold.order_id, transitioned, "Booking confirmed");
        Ok(Settlement {
            booking_id: booking.id,
            room_id: booking.room_id,
            order_id: Some(hold.order_id),
            already_settled: !transitioned,
        })
    }

    /// The booking is already settled: finish any cleanup a previous call
    /// left undone and report success.
    async fn converge_settled(&self, booking: &Booking) -> CoreResult<Settlement> {
        let mut order_id = None;
        if let Some(hold) = self.holds.get_active(booking.user_id).await? {
            if hold.covers(booking.id, booking.room_id) {
                order_id = Some(hold.order_id);
                if let Err(e) = self.holds.remove_if_order(booking.user_id, hold.order_id).await {
                    warn!(user_id = booking.user_id, "Hold cleanup deferred to reconciler: {}", e);
                }
            }
        }
        self.flush_outbox().await;

        debug!(booking_id = booking.id, "Booking already settled");
        Ok(Settlement {
            booking_id: booking.id,
            room_id: booking.room_id,
            order_id,
            already_settled: true,
        })
    }

    // ========================================================================
    // Plumbing
    // ========================================================================

    fn deadline(&self) -> Instant {
        Instant::now() + self.settings.request_deadline
    }

    /// Runs one step of a request against the request's shared deadline.
    async fn within<T>(&self, deadline: Instant, fut: impl Future<Output = CoreResult<T>>) -> CoreResult<T> {
        match tokio::time::timeout_at(deadline, fut).await {
            Ok(result) => result,
            Err(_) => {
                let millis = self.settings.request_deadline.as_millis() as u64;
                warn!(deadline_ms = millis, "Request deadline exceeded");
                Err(CoreError::DeadlineExceeded(millis))
            }
        }
    }

    async fn acquire_lease(&self, user_id: i64) -> CoreResult<Lease> {
        self.holds
            .acquire_lease(user_id, self.settings.lease_ttl)
            .await?
            .ok_or_else(|| {
                CoreError::AdmissionError(format!("another request for user {} is in progress", user_id))
            })
    }

    async fn release_lease(&self, lease: &Lease) {
        // Expires on its own if this fails
        if let Err(e) = self.holds.release_lease(lease).await {
            warn!(user_id = lease.user_id, "Could not release lease: {}", e);
        }
    }

    fn stage(&self, topic: &str, event: &BookingEvent) -> CoreResult<OutboxMessage> {
        Ok(OutboxMessage::new(topic, self.settings.event_key.as_str(), event.to_payload()?))
    }

    async fn flush_outbox(&self) {
        if let Err(e) = self.outbox.dispatch_pending().await {
            warn!("Outbox flush deferred to worker: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use innkeep_core::memory::{InMemoryBookingStore, InMemoryHoldStore, RecordingPublisher, StubPaymentGateway};

    fn request(days: i32, amount: f64) -> InitiateBooking {
        InitiateBooking {
            user_id: 7,
            room_id: 12,
            days,
            amount,
        }
    }

    /// Orchestrator over fresh in-memory stores holding one vacant room.
    fn orchestrator(gateway: StubPaymentGateway, settings: SagaSettings) -> (BookingOrchestrator, i64) {
        let bookings = InMemoryBookingStore::new();
        let room_id = bookings.seed_room(100.0, 3);
        let outbox = OutboxDispatcher::new(Arc::new(bookings.clone()), Arc::new(RecordingPublisher::new()), 10);
        let saga = BookingOrchestrator::new(
            Arc::new(bookings),
            Arc::new(InMemoryHoldStore::new()),
            Arc::new(gateway),
            outbox,
            settings,
        );
        (saga, room_id)
    }

    #[test]
    fn test_validation_rejects_bad_input() {
        assert!(request(2, 100.0).validate().is_ok());
        assert!(matches!(request(0, 100.0).validate(), Err(CoreError::ValidationError(_))));
        assert!(matches!(request(400, 100.0).validate(), Err(CoreError::ValidationError(_))));
        assert!(matches!(request(2, 0.0).validate(), Err(CoreError::ValidationError(_))));
        assert!(matches!(request(2, f64::NAN).validate(), Err(CoreError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_invalid_request_never_reaches_gateway() {
        let gateway = StubPaymentGateway::new();
        let (saga, _) = orchestrator(gateway.clone(), SagaSettings::default());

        let result = saga.initiate_booking(request(0, 100.0)).await;

        assert!(matches!(result, Err(CoreError::ValidationError(_))));
        assert_eq!(gateway.created_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_room_never_reaches_gateway() {
        let gateway = StubPaymentGateway::new();
        let (saga, room_id) = orchestrator(gateway.clone(), SagaSettings::default());

        let result = saga
            .initiate_booking(InitiateBooking {
                room_id: room_id + 1,
                ..request(2, 100.0)
            })
            .await;

        assert!(matches!(result, Err(CoreError::NotFound(_))));
        assert_eq!(gateway.created_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_gateway_hits_deadline() {
        let gateway = StubPaymentGateway::new();
        gateway.set_delay(Some(Duration::from_millis(300)));
        let settings = SagaSettings {
            request_deadline: Duration::from_millis(50),
            ..SagaSettings::default()
        };
        let (saga, room_id) = orchestrator(gateway, settings);

        let result = saga
            .initiate_booking(InitiateBooking {
                room_id,
                ..request(2, 100.0)
            })
            .await;

        assert!(matches!(result, Err(CoreError::DeadlineExceeded(50))));
    }

    #[tokio::test]
    async fn test_timed_out_request_releases_lease() {
        let gateway = StubPaymentGateway::new();
        gateway.set_delay(Some(Duration::from_millis(300)));
        let settings = SagaSettings {
            request_deadline: Duration::from_millis(50),
            lease_ttl: Duration::from_secs(60),
            ..SagaSettings::default()
        };
        let (saga, room_id) = orchestrator(gateway.clone(), settings);
        let booking = InitiateBooking {
            room_id,
            ..request(2, 100.0)
        };

        let timed_out = saga.initiate_booking(booking.clone()).await;
        assert!(matches!(timed_out, Err(CoreError::DeadlineExceeded(_))));

        // A retry well inside the lease TTL goes through
        gateway.set_delay(None);
        let retry = saga.initiate_booking(booking).await.unwrap();
        assert!(!retry.existing);
        assert!(retry.booking_id.is_some());
    }

    #[tokio::test]
    async fn test_unknown_booking_is_not_found() {
        let (saga, _) = orchestrator(StubPaymentGateway::new(), SagaSettings::default());

        assert!(matches!(saga.confirm_booking(7, 99).await, Err(CoreError::NotFound(_))));
        assert!(matches!(saga.get_booking(7, 99).await, Err(CoreError::NotFound(_))));
    }
}
