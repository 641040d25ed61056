use crate::model::*;

use super::availability::{compute, resolve_range};
use super::error::NotFound;
use super::{Engine, EngineError};

impl Engine {
    /// Ask the access gate, logging denials the way the mutations do.
    pub(super) async fn authorize(&self, room_id: RoomId, user_id: UserId) -> Result<Room, EngineError> {
        self.gate.authorize(room_id, user_id).await.inspect_err(|err| match err {
            EngineError::NotFound(_) => tracing::warn!(%room_id, %user_id, "room not found"),
            _ => tracing::warn!(%room_id, %user_id, "access denied to room: {err}"),
        })
    }

    /// All reservations of a room, earliest start first.
    pub async fn list_for_room(&self, room_id: RoomId, user_id: UserId) -> Result<Vec<Reservation>, EngineError> {
        self.authorize(room_id, user_id).await?;
        let Some(timeline) = self.timeline(&room_id) else {
            return Ok(Vec::new());
        };
        let guard = timeline.read().await;
        Ok(guard.reservations.clone())
    }

    pub async fn get_reservation(&self, id: ReservationId, user_id: UserId) -> Result<Reservation, EngineError> {
        let room_id = self.room_of(&id).ok_or(NotFound::Reservation(id))?;
        let timeline = self.timeline(&room_id).ok_or(NotFound::Reservation(id))?;
        let reservation = timeline
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(NotFound::Reservation(id))?;
        self.authorize(room_id, user_id).await?;
        Ok(reservation)
    }

    /// Bookings and free slots of a room over a range. Bounds are ISO-8601
    /// dates or timestamps; omitted bounds cover the coming week.
    /// `min_duration` drops slots shorter than the given milliseconds.
    pub async fn get_availability(
        &self,
        room_id: RoomId,
        user_id: UserId,
        start: Option<&str>,
        end: Option<&str>,
        min_duration: Option<Ms>,
    ) -> Result<Availability, EngineError> {
        let room = self.authorize(room_id, user_id).await?;
        let (range_start, range_end) = resolve_range(start, end, self.now(), self.config.utc_offset)?;
        let buffer = self.config.buffer_slots.then(|| self.config.buffer_ms());

        let (reservations, available_slots) = match self.timeline(&room_id) {
            Some(timeline) => {
                let guard = timeline.read().await;
                compute(Some(&guard), range_start, range_end, buffer, min_duration)
            }
            None => compute(None, range_start, range_end, buffer, min_duration),
        };

        Ok(Availability {
            room,
            reservations,
            available_slots,
        })
    }
}
