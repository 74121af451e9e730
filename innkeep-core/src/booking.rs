use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::events::OutboxMessage;
use crate::CoreError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomStatus {
    Vacant,
    Booked,
}

impl RoomStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomStatus::Vacant => "VACANT",
            RoomStatus::Booked => "BOOKED",
        }
    }
}

impl FromStr for RoomStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "VACANT" => Ok(RoomStatus::Vacant),
            "BOOKED" => Ok(RoomStatus::Booked),
            other => Err(CoreError::StoreError(format!("unknown room status {}", other))),
        }
    }
}

/// Booking lifecycle. Codes are persisted and travel in events, so they
/// must stay stable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending = 0,
    Confirmed = 1,
    CheckedOut = 2,
}

impl BookingStatus {
    pub fn code(self) -> i16 {
        self as i16
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(BookingStatus::Pending),
            1 => Some(BookingStatus::Confirmed),
            2 => Some(BookingStatus::CheckedOut),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Room {
    pub id: i64,
    pub cost: f64,
    pub status: RoomStatus,
    pub vendor_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Booking {
    pub id: i64,
    pub days: i32,
    pub user_id: i64,
    pub room_id: i64,
    pub vendor_id: i64,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything `BookingStore::reserve` commits in one transaction.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub days: i32,
    pub user_id: i64,
    pub room_id: i64,
    pub event: Option<OutboxMessage>,
}

/// Status change for an owned booking, with the event that must be
/// recorded alongside it.
#[derive(Debug, Clone)]
pub struct BookingUpdate {
    pub booking_id: i64,
    pub user_id: i64,
    pub days: i32,
    pub status: BookingStatus,
    pub event: Option<OutboxMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_stable() {
        assert_eq!(BookingStatus::Pending.code(), 0);
        assert_eq!(BookingStatus::Confirmed.code(), 1);
        assert_eq!(BookingStatus::CheckedOut.code(), 2);
        assert_eq!(BookingStatus::from_code(1), Some(BookingStatus::Confirmed));
        assert_eq!(BookingStatus::from_code(9), None);
    }

    #[test]
    fn test_status_ordering_follows_lifecycle() {
        assert!(BookingStatus::Pending < BookingStatus::Confirmed);
        assert!(BookingStatus::Confirmed < BookingStatus::CheckedOut);
    }

    #[test]
    fn test_room_status_parsing() {
        assert_eq!("VACANT".parse::<RoomStatus>().unwrap(), RoomStatus::Vacant);
        assert_eq!(RoomStatus::Booked.as_str(), "BOOKED");
        assert!("vacant".parse::<RoomStatus>().is_err());
    }
}
