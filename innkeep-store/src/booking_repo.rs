use async_trait::async_trait;
use chrono::{DateTime, Utc};
use innkeep_core::booking::{Booking, BookingStatus, BookingUpdate, Reservation, Room, RoomStatus};
use innkeep_core::events::{OutboxEntry, OutboxMessage};
use innkeep_core::repository::{BookingStore, OutboxStore};
use innkeep_core::{CoreError, CoreResult};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct PostgresBookingRepository {
    pool: PgPool,
    /// Claimed outbox rows older than this are handed out again
    claim_timeout: Duration,
}

impl PostgresBookingRepository {
    pub fn new(pool: PgPool, claim_timeout: Duration) -> Self {
        Self { pool, claim_timeout }
    }
}

fn store_err(e: sqlx::Error) -> CoreError {
    CoreError::StoreError(e.to_string())
}

// Internal structs for type-safe querying
#[derive(sqlx::FromRow)]
struct RoomRow {
    id: i64,
    cost: f64,
    status: String,
    vendor_id: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RoomRow> for Room {
    type Error = CoreError;

    fn try_from(row: RoomRow) -> Result<Self, Self::Error> {
        Ok(Room {
            id: row.id,
            cost: row.cost,
            status: row.status.parse::<RoomStatus>()?,
            vendor_id: row.vendor_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BookingRow {
    id: i64,
    days: i32,
    user_id: i64,
    room_id: i64,
    vendor_id: i64,
    status: i16,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = CoreError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        let status = BookingStatus::from_code(row.status).ok_or_else(|| {
            CoreError::StoreError(format!("booking {} has unknown status {}", row.id, row.status))
        })?;
        Ok(Booking {
            id: row.id,
            days: row.days,
            user_id: row.user_id,
            room_id: row.room_id,
            vendor_id: row.vendor_id,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: i64,
    topic: String,
    key: String,
    payload: String,
    attempts: i32,
    created_at: DateTime<Utc>,
}

const BOOKING_COLUMNS: &str = "b.id, b.days, b.user_id, b.room_id, r.vendor_id, b.status, b.created_at, b.updated_at \
     FROM bookings b JOIN rooms r ON r.id = b.room_id";

async fn stage_event(tx: &mut Transaction<'_, Postgres>, event: &OutboxMessage) -> CoreResult<()> {
    sqlx::query("INSERT INTO outbox (topic, key, payload) VALUES ($1, $2, $3)")
        .bind(&event.topic)
        .bind(&event.key)
        .bind(&event.payload)
        .execute(&mut **tx)
        .await
        .map_err(store_err)?;
    Ok(())
}

#[async_trait]
impl BookingStore for PostgresBookingRepository {
    async fn reserve(&self, reservation: &Reservation) -> CoreResult<i64> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        // 1. Flip the room, only if nobody else holds it
        let flipped = sqlx::query(
            "UPDATE rooms SET status = 'BOOKED', updated_at = NOW() WHERE id = $1 AND status = 'VACANT'",
        )
        .bind(reservation.room_id)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        if flipped.rows_affected() < 1 {
            // Dropping the transaction rolls it back
            return Err(CoreError::RoomUnavailable(reservation.room_id));
        }

        // 2. Pending booking
        let booking_id: Option<i64> = sqlx::query_scalar(
            "INSERT INTO bookings (days, user_id, room_id, status) VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(reservation.days)
        .bind(reservation.user_id)
        .bind(reservation.room_id)
        .bind(BookingStatus::Pending.code())
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?;

        let booking_id = booking_id
            .ok_or_else(|| CoreError::StoreError("booking insert affected no rows".to_string()))?;

        // 3. Event rides the same transaction
        if let Some(event) = &reservation.event {
            stage_event(&mut tx, event).await?;
        }

        tx.commit().await.map_err(store_err)?;
        info!(booking_id, room_id = reservation.room_id, user_id = reservation.user_id, "Room reserved");
        Ok(booking_id)
    }

    async fn get_booking(&self, booking_id: i64, user_id: i64) -> CoreResult<Option<Booking>> {
        let row = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {} WHERE b.id = $1 AND b.user_id = $2",
            BOOKING_COLUMNS
        ))
        .bind(booking_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        row.map(Booking::try_from).transpose()
    }

    async fn find_latest_booking(&self, user_id: i64, room_id: i64) -> CoreResult<Option<Booking>> {
        let row = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {} WHERE b.user_id = $1 AND b.room_id = $2 ORDER BY b.id DESC LIMIT 1",
            BOOKING_COLUMNS
        ))
        .bind(user_id)
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        row.map(Booking::try_from).transpose()
    }

    async fn update_status(&self, update: &BookingUpdate) -> CoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        // Forward-only, so a repeated settlement changes nothing
        let result = sqlx::query(
            "UPDATE bookings SET status = $1, days = $2, updated_at = NOW() \
             WHERE id = $3 AND user_id = $4 AND status < $1",
        )
        .bind(update.status.code())
        .bind(update.days)
        .bind(update.booking_id)
        .bind(update.user_id)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        if result.rows_affected() < 1 {
            let exists: Option<i16> =
                sqlx::query_scalar("SELECT status FROM bookings WHERE id = $1 AND user_id = $2")
                    .bind(update.booking_id)
                    .bind(update.user_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(store_err)?;

            return match exists {
                Some(current) => {
                    debug!(booking_id = update.booking_id, current, "Booking already at or past requested status");
                    Ok(false)
                }
                None => Err(CoreError::NotFound(format!("booking {}", update.booking_id))),
            };
        }

        if let Some(event) = &update.event {
            stage_event(&mut tx, event).await?;
        }

        tx.commit().await.map_err(store_err)?;
        Ok(true)
    }

    async fn delete(&self, booking_id: i64, vendor_id: i64, room_id: i64) -> CoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let released = sqlx::query(
            "UPDATE rooms SET status = 'VACANT', updated_at = NOW() WHERE id = $1 AND vendor_id = $2",
        )
        .bind(room_id)
        .bind(vendor_id)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        if released.rows_affected() < 1 {
            return Err(CoreError::NotFound(format!("room {} for vendor {}", room_id, vendor_id)));
        }

        let deleted = sqlx::query("DELETE FROM bookings WHERE id = $1 AND room_id = $2")
            .bind(booking_id)
            .bind(room_id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

        if deleted.rows_affected() < 1 {
            return Err(CoreError::NotFound(format!("booking {}", booking_id)));
        }

        tx.commit().await.map_err(store_err)?;
        info!(booking_id, room_id, vendor_id, "Booking deleted and room released");
        Ok(())
    }

    async fn list_pending_before(&self, cutoff: DateTime<Utc>) -> CoreResult<Vec<Booking>> {
        let rows = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {} WHERE b.status = $1 AND b.created_at < $2 ORDER BY b.id",
            BOOKING_COLUMNS
        ))
        .bind(BookingStatus::Pending.code())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.into_iter().map(Booking::try_from).collect()
    }

    async fn get_room(&self, room_id: i64) -> CoreResult<Option<Room>> {
        let row = sqlx::query_as::<_, RoomRow>(
            "SELECT id, cost, status, vendor_id, created_at, updated_at FROM rooms WHERE id = $1",
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        row.map(Room::try_from).transpose()
    }
}

#[async_trait]
impl OutboxStore for PostgresBookingRepository {
    async fn claim_pending(&self, limit: i64) -> CoreResult<Vec<OutboxEntry>> {
        // SKIP LOCKED lets several dispatchers drain the table without
        // handing the same row to two of them
        let mut rows = sqlx::query_as::<_, OutboxRow>(
            "UPDATE outbox SET claimed_at = NOW(), attempts = attempts + 1 \
             WHERE id IN ( \
                 SELECT id FROM outbox \
                 WHERE published_at IS NULL \
                   AND (claimed_at IS NULL OR claimed_at < NOW() - make_interval(secs => $2)) \
                 ORDER BY id \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING id, topic, key, payload, attempts, created_at",
        )
        .bind(limit)
        .bind(self.claim_timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.sort_by_key(|row| row.id);
        Ok(rows
            .into_iter()
            .map(|row| OutboxEntry {
                id: row.id,
                message: OutboxMessage::new(row.topic, row.key, row.payload),
                attempts: row.attempts,
                created_at: row.created_at,
            })
            .collect())
    }

    async fn mark_published(&self, id: i64) -> CoreResult<()> {
        sqlx::query("UPDATE outbox SET published_at = NOW(), last_error = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str) -> CoreResult<()> {
        let result = sqlx::query("UPDATE outbox SET claimed_at = NULL, last_error = $2 WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        if result.rows_affected() < 1 {
            warn!(outbox_id = id, "Outbox row vanished before failure was recorded");
        }
        Ok(())
    }
}
