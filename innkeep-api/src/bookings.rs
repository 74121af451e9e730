use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    routing::{delete, get, post},
    Extension, Json, Router,
};
use innkeep_booking::InitiateBooking;
use innkeep_core::booking::{Booking, BookingStatus};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::{customer_auth_middleware, vendor_auth_middleware, AuthUser};
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateBookingRequest {
    pub room_id: Option<i64>,
    pub days: Option<i32>,
    pub amount: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct CreateBookingResponse {
    pub msg: String,
    pub order_id: Uuid,
    pub booking_id: Option<i64>,
    pub room_id: i64,
    pub client_secret: Option<String>,
    pub payment_url: Option<String>,
    pub pub_key: String,
    pub existing: bool,
}

#[derive(Debug, Serialize)]
pub struct BookingResponse {
    pub id: i64,
    pub room_id: i64,
    pub days: i32,
    pub status: BookingStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<Booking> for BookingResponse {
    fn from(b: Booking) -> Self {
        Self {
            id: b.id,
            room_id: b.room_id,
            days: b.days,
            status: b.status,
            created_at: b.created_at,
            updated_at: b.updated_at,
        }
    }
}

pub fn routes(state: AppState) -> Router<AppState> {
    let customer = Router::new()
        .route("/v1/bookings", post(create_booking))
        .route("/v1/bookings/{id}", get(get_booking))
        .route("/v1/bookings/{id}/verify", post(verify_booking))
        .route_layer(middleware::from_fn_with_state(state.clone(), customer_auth_middleware));

    let vendor = Router::new()
        .route("/v1/vendor/rooms/{room_id}/bookings/{id}", delete(cancel_booking))
        .route_layer(middleware::from_fn_with_state(state, vendor_auth_middleware));

    customer.merge(vendor)
}

// ============================================================================
// Handlers
// ============================================================================

async fn create_booking(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<CreateBookingRequest>,
) -> Result<(StatusCode, Json<CreateBookingResponse>), AppError> {
    let (Some(room_id), Some(days), Some(amount)) = (req.room_id, req.days, req.amount) else {
        return Err(AppError::ValidationError("room_id, days and amount are required".to_string()));
    };

    let handle = state
        .orchestrator
        .initiate_booking(InitiateBooking {
            user_id: user.user_id,
            room_id,
            days,
            amount,
        })
        .await?;

    let (status, msg) = if handle.existing {
        (StatusCode::OK, "You have an active payment, confirm payment to proceed")
    } else {
        (StatusCode::CREATED, "booking created")
    };

    Ok((
        status,
        Json(CreateBookingResponse {
            msg: msg.to_string(),
            order_id: handle.order_id,
            booking_id: handle.booking_id,
            room_id: handle.room_id,
            client_secret: handle.client_secret,
            payment_url: handle.payment_url,
            pub_key: state.pub_key.clone(),
            existing: handle.existing,
        }),
    ))
}

async fn verify_booking(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(booking_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    let settlement = state.orchestrator.confirm_booking(user.user_id, booking_id).await?;

    Ok(Json(json!({
        "msg": "booking success",
        "booking_id": settlement.booking_id,
        "room_id": settlement.room_id,
        "already_settled": settlement.already_settled,
    })))
}

async fn get_booking(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(booking_id): Path<i64>,
) -> Result<Json<BookingResponse>, AppError> {
    let booking = state.orchestrator.get_booking(user.user_id, booking_id).await?;
    Ok(Json(booking.into()))
}

async fn cancel_booking(
    State(state): State<AppState>,
    Extension(vendor): Extension<AuthUser>,
    Path((room_id, booking_id)): Path<(i64, i64)>,
) -> Result<StatusCode, AppError> {
    state
        .orchestrator
        .cancel_booking(vendor.user_id, room_id, booking_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
