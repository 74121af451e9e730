use chrono::{DateTime, Utc};
use innkeep_core::booking::{Booking, BookingStatus};
use innkeep_core::hold::PaymentHold;
use innkeep_core::payment::{PaymentGateway, PaymentOutcome};
use innkeep_core::repository::{BookingStore, PaymentHoldStore};
use innkeep_core::CoreResult;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Slack for comparing hold and booking timestamps written by different clocks.
const CLOCK_SKEW_SECS: i64 = 60;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub holds_removed: usize,
    pub sessions_expired: usize,
    pub bookings_released: usize,
    pub errors: usize,
}

enum HoldVerdict {
    Keep,
    Remove { expire_session: bool },
}

/// Repairs what a crashed or partially failed saga leaves behind: holds
/// that outlived their booking and pending bookings nobody can pay for.
pub struct Reconciler {
    bookings: Arc<dyn BookingStore>,
    holds: Arc<dyn PaymentHoldStore>,
    gateway: Arc<dyn PaymentGateway>,
    grace: chrono::Duration,
}

impl Reconciler {
    pub fn new(
        bookings: Arc<dyn BookingStore>,
        holds: Arc<dyn PaymentHoldStore>,
        gateway: Arc<dyn PaymentGateway>,
        grace: chrono::Duration,
    ) -> Self {
        Self {
            bookings,
            holds,
            gateway,
            grace,
        }
    }

    pub async fn run_once(&self) -> CoreResult<ReconcileReport> {
        let cutoff = Utc::now() - self.grace;
        let mut report = ReconcileReport::default();

        // Holds first, so bookings whose payment just failed are released in the same pass
        for hold in self.holds.list_holds().await? {
            if hold.created_at >= cutoff {
                continue;
            }
            if let Err(e) = self.reconcile_hold(&hold, &mut report).await {
                warn!(user_id = hold.user_id, order_id = %hold.order_id, "Hold reconciliation failed: {}", e);
                report.errors += 1;
            }
        }

        for booking in self.bookings.list_pending_before(cutoff).await? {
            match self.release_if_orphaned(&booking).await {
                Ok(true) => report.bookings_released += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(booking_id = booking.id, "Booking reconciliation failed: {}", e);
                    report.errors += 1;
                }
            }
        }

        if report != ReconcileReport::default() {
            info!(
                holds_removed = report.holds_removed,
                sessions_expired = report.sessions_expired,
                bookings_released = report.bookings_released,
                errors = report.errors,
                "Reconciliation pass complete"
            );
        }
        Ok(report)
    }

    async fn reconcile_hold(&self, hold: &PaymentHold, report: &mut ReconcileReport) -> CoreResult<()> {
        let verdict = self.judge_hold(hold).await?;
        let HoldVerdict::Remove { expire_session } = verdict else {
            return Ok(());
        };

        // Only the attempt we inspected; a newer one may have replaced it
        if !self.holds.remove_if_order(hold.user_id, hold.order_id).await? {
            return Ok(());
        }
        report.holds_removed += 1;

        if expire_session {
            match self.gateway.expire_session(&hold.payment_id).await {
                Ok(()) => report.sessions_expired += 1,
                Err(e) => warn!(session_id = %hold.payment_id, "Could not expire stale session: {}", e),
            }
        }
        info!(user_id = hold.user_id, order_id = %hold.order_id, expire_session, "Stale hold removed");
        Ok(())
    }

    async fn judge_hold(&self, hold: &PaymentHold) -> CoreResult<HoldVerdict> {
        if !hold.is_active() {
            return Ok(HoldVerdict::Remove { expire_session: false });
        }

        let booking = match self.booking_for(hold).await? {
            Some(booking) => booking,
            // Reservation never committed
            None => return Ok(HoldVerdict::Remove { expire_session: true }),
        };

        if booking.status >= BookingStatus::Confirmed {
            // Settled, but the cleanup after settlement did not happen
            return Ok(HoldVerdict::Remove { expire_session: false });
        }

        // Pending booking: only give up once the gateway says the payment cannot succeed
        let status = self.gateway.get_status(&hold.payment_id).await?;
        match status.outcome() {
            PaymentOutcome::Failed => Ok(HoldVerdict::Remove { expire_session: false }),
            PaymentOutcome::Succeeded | PaymentOutcome::Pending => {
                debug!(booking_id = booking.id, status = %status.status, "Hold still payable, keeping it");
                Ok(HoldVerdict::Keep)
            }
        }
    }

    async fn booking_for(&self, hold: &PaymentHold) -> CoreResult<Option<Booking>> {
        if let Some(booking_id) = hold.booking_id {
            return self.bookings.get_booking(booking_id, hold.user_id).await;
        }
        let latest = self.bookings.find_latest_booking(hold.user_id, hold.room_id).await?;
        Ok(latest.filter(|b| is_same_attempt(hold.created_at, b.created_at)))
    }

    async fn release_if_orphaned(&self, booking: &Booking) -> CoreResult<bool> {
        let covered = self
            .holds
            .get_active(booking.user_id)
            .await?
            .is_some_and(|hold| hold.is_active() && hold.covers(booking.id, booking.room_id));
        if covered {
            return Ok(false);
        }

        self.bookings.delete(booking.id, booking.vendor_id, booking.room_id).await?;
        info!(booking_id = booking.id, room_id = booking.room_id, "Orphaned pending booking released");
        Ok(true)
    }
}

/// The booking is written after its hold, so a booking older than the
/// hold belongs to an earlier attempt.
fn is_same_attempt(hold_created: DateTime<Utc>, booking_created: DateTime<Utc>) -> bool {
    booking_created + chrono::Duration::seconds(CLOCK_SKEW_SECS) >= hold_created
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_attempt_tolerates_skew() {
        let hold_created = Utc::now();
        assert!(is_same_attempt(hold_created, hold_created + chrono::Duration::seconds(1)));
        assert!(is_same_attempt(hold_created, hold_created - chrono::Duration::seconds(30)));
        assert!(!is_same_attempt(hold_created, hold_created - chrono::Duration::hours(1)));
    }
}
