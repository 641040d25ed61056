use thiserror::Error;
use ulid::Ulid;

use crate::model::{ReservationId, RoomId, UserId};

/// Why a proposed time window was rejected. One variant per rule, checked
/// in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("invalid date format for start time or end time")]
    Malformed,
    #[error("start time cannot be in the past")]
    StartInPast,
    #[error("end time must be after start time")]
    EndBeforeStart,
    #[error("reservations must be made at least {0} minutes in advance")]
    InsufficientAdvance(u32),
    #[error("reservations cannot exceed {0} hours")]
    DurationExceeded(u32),
    #[error("reservations cannot be made more than {0} days in advance")]
    TooFarInAdvance(u32),
    #[error("reservations must start between {start}:00 and {end}:00 and end by {end}:00")]
    OutsideBusinessHours { start: u32, end: u32 },
}

impl WindowError {
    /// Short label for metrics.
    pub fn rule(&self) -> &'static str {
        match self {
            WindowError::Malformed => "malformed",
            WindowError::StartInPast => "start_in_past",
            WindowError::EndBeforeStart => "end_before_start",
            WindowError::InsufficientAdvance(_) => "min_advance",
            WindowError::DurationExceeded(_) => "max_duration",
            WindowError::TooFarInAdvance(_) => "max_advance",
            WindowError::OutsideBusinessHours { .. } => "business_hours",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotFound {
    #[error("room {0} not found")]
    Room(RoomId),
    #[error("reservation {0} not found")]
    Reservation(ReservationId),
    #[error("invalid invitee user ids: {}", join_ids(.0))]
    Invitees(Vec<UserId>),
}

fn join_ids(ids: &[Ulid]) -> String {
    ids.iter().map(Ulid::to_string).collect::<Vec<_>>().join(", ")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("invalid time window: {0}")]
    InvalidWindow(#[from] WindowError),
    #[error("the room is already booked for this time slot (conflicts with {0})")]
    Conflict(ReservationId),
    #[error(transparent)]
    NotFound(#[from] NotFound),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidWindow(_) => "invalid_window",
            EngineError::Conflict(_) => "conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::Storage(_) => "storage",
        }
    }
}
