use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Every instant in the crate uses it.
pub type Ms = i64;

pub type ReservationId = Ulid;
pub type RoomId = Ulid;
pub type UserId = Ulid;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Widen both edges by `buffer`.
    pub fn buffered(&self, buffer: Ms) -> Span {
        Span::new(self.start - buffer, self.end + buffer)
    }
}

/// A booked time window on one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub title: String,
    pub description: Option<String>,
    pub span: Span,
    pub room_id: RoomId,
    pub organizer_id: UserId,
    pub invitees: Vec<UserId>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Reservation {
    /// Organizer plus invitees.
    pub fn participant_count(&self) -> usize {
        1 + self.invitees.len()
    }
}

/// The room as seen through the access gate. Capacity only feeds the
/// over-capacity warning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: Option<String>,
    pub capacity: Option<u32>,
}

/// All reservations of one room, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct RoomTimeline {
    pub room_id: RoomId,
    pub reservations: Vec<Reservation>,
}

impl RoomTimeline {
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            reservations: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove(&mut self, id: ReservationId) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    /// Replace a reservation in place, re-sorting if its start moved.
    pub fn replace(&mut self, reservation: Reservation) {
        self.remove(reservation.id);
        self.insert(reservation);
    }

    pub fn get(&self, id: ReservationId) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Return only reservations whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }
}

/// The WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationCreated { reservation: Reservation },
    /// Carries the full post-merge record.
    ReservationUpdated { reservation: Reservation },
    ReservationDeleted { id: ReservationId, room_id: RoomId },
}

impl Event {
    pub fn room_id(&self) -> RoomId {
        match self {
            Event::ReservationCreated { reservation } | Event::ReservationUpdated { reservation } => {
                reservation.room_id
            }
            Event::ReservationDeleted { room_id, .. } => *room_id,
        }
    }
}

// ── Operation inputs ─────────────────────────────────────────────

/// Payload for creating a reservation. Times are raw ISO-8601 strings;
/// parsing is part of window validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewReservation {
    pub title: String,
    pub description: Option<String>,
    pub start_time: String,
    pub end_time: String,
    pub invitees: Vec<UserId>,
}

/// One field of a partial update: either left alone or replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Patch<T> {
    #[default]
    Unchanged,
    Set(T),
}

impl<T> Patch<T> {
    pub fn is_set(&self) -> bool {
        matches!(self, Patch::Set(_))
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Patch::Unchanged => None,
            Patch::Set(v) => Some(v),
        }
    }
}

/// Partial update. `description: Set(None)` clears the description;
/// `invitees: Set(vec![])` clears the invitee list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationPatch {
    pub title: Patch<String>,
    pub description: Patch<Option<String>>,
    pub start_time: Patch<String>,
    pub end_time: Patch<String>,
    pub invitees: Patch<Vec<UserId>>,
}

impl ReservationPatch {
    pub fn touches_window(&self) -> bool {
        self.start_time.is_set() || self.end_time.is_set()
    }
}

// ── Query result types ───────────────────────────────────────────

/// Result of create/update: the stored record plus the non-fatal
/// over-capacity warning, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationOutcome {
    pub reservation: Reservation,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    pub room: Room,
    pub reservations: Vec<Reservation>,
    pub available_slots: Vec<Span>,
}
