use ulid::Ulid;

use crate::config::SchedulingConfig;
use crate::model::*;
use crate::observability;

use super::conflict::check_no_conflict;
use super::error::{NotFound, WindowError};
use super::window::{check_window, parse_instant, validate_window};
use super::{Engine, EngineError};

/// Over-capacity advisory, or `None` when the participants fit (or the room
/// has no capacity set).
pub fn capacity_warning(room: &Room, participants: usize) -> Option<String> {
    let capacity = room.capacity?;
    (participants > capacity as usize).then(|| {
        format!("Warning: The number of participants ({participants}) exceeds the room capacity ({capacity})")
    })
}

/// Drop duplicates and the organizer, keeping first-seen order.
pub fn normalize_invitees(invitees: Vec<UserId>, organizer: UserId) -> Vec<UserId> {
    let mut seen = std::collections::HashSet::with_capacity(invitees.len());
    invitees
        .into_iter()
        .filter(|id| *id != organizer && seen.insert(*id))
        .collect()
}

fn require_title(title: &str) -> Result<(), EngineError> {
    if title.trim().is_empty() {
        return Err(EngineError::InvalidInput("title must not be empty".into()));
    }
    Ok(())
}

fn window_rejected(err: WindowError, room_id: RoomId, user_id: UserId) -> EngineError {
    metrics::counter!(observability::WINDOW_REJECTIONS_TOTAL, "rule" => err.rule()).increment(1);
    tracing::warn!(%room_id, %user_id, rule = err.rule(), "reservation window rejected: {err}");
    err.into()
}

/// The window an update asks for: supplied bounds replace the stored ones.
fn patched_span(
    patch: &ReservationPatch,
    current: Span,
    now: Ms,
    config: &SchedulingConfig,
) -> Result<Span, WindowError> {
    let pick = |raw: &Patch<String>, stored: Ms| match raw {
        Patch::Set(raw) => parse_instant(raw, config.utc_offset).ok_or(WindowError::Malformed),
        Patch::Unchanged => Ok(stored),
    };
    let start = pick(&patch.start_time, current.start)?;
    let end = pick(&patch.end_time, current.end)?;
    check_window(start, end, now, config, patch.start_time.is_set())
}

impl Engine {
    /// Every requested invitee must be a known user.
    async fn check_invitees(&self, invitees: &[UserId]) -> Result<(), EngineError> {
        if invitees.is_empty() {
            return Ok(());
        }
        let missing = self.directory.missing_users(invitees).await;
        if missing.is_empty() {
            return Ok(());
        }
        tracing::warn!(missing = ?missing, "invalid invitee user ids");
        Err(NotFound::Invitees(missing).into())
    }

    fn conflict_free(
        &self,
        timeline: &RoomTimeline,
        span: &Span,
        exclude: Option<ReservationId>,
        user_id: UserId,
    ) -> Result<(), EngineError> {
        check_no_conflict(timeline, span, self.config.buffer_ms(), exclude).inspect_err(|err| {
            metrics::counter!(observability::CONFLICTS_TOTAL).increment(1);
            tracing::warn!(
                room_id = %timeline.room_id,
                %user_id,
                start = span.start,
                end = span.end,
                "reservation conflict detected: {err}"
            );
        })
    }

    /// Book `room_id` for `organizer_id`.
    ///
    /// The room's write lock is held from the conflict check until the
    /// record is durable, so two overlapping bookings on one room cannot
    /// both succeed.
    pub async fn create_reservation(
        &self,
        room_id: RoomId,
        data: NewReservation,
        organizer_id: UserId,
    ) -> Result<ReservationOutcome, EngineError> {
        let room = self.authorize(room_id, organizer_id).await?;
        require_title(&data.title)?;

        let now = self.now();
        let span = validate_window(&data.start_time, &data.end_time, now, &self.config)
            .map_err(|e| window_rejected(e, room_id, organizer_id))?;
        let invitees = normalize_invitees(data.invitees, organizer_id);

        let timeline = self.timeline_or_create(room_id);
        let mut guard = timeline.write().await;
        self.conflict_free(&guard, &span, None, organizer_id)?;
        self.check_invitees(&invitees).await?;

        let reservation = Reservation {
            id: Ulid::new(),
            title: data.title,
            description: data.description,
            span,
            room_id,
            organizer_id,
            invitees,
            created_at: now,
            updated_at: now,
        };
        let participants = reservation.participant_count();
        let warning = capacity_warning(&room, participants);

        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;

        metrics::counter!(observability::RESERVATIONS_CREATED_TOTAL).increment(1);
        if warning.is_some() {
            metrics::counter!(observability::CAPACITY_WARNINGS_TOTAL).increment(1);
        }
        tracing::info!(
            reservation_id = %reservation.id,
            %room_id,
            user_id = %organizer_id,
            start = span.start,
            end = span.end,
            participants,
            has_warning = warning.is_some(),
            "reservation created"
        );
        Ok(ReservationOutcome { reservation, warning })
    }

    /// Apply a partial update. Only the organizer may do this.
    ///
    /// Window rules and the conflict check run only when a bound is
    /// supplied. The start-in-past rule runs only for a new start.
    pub async fn update_reservation(
        &self,
        id: ReservationId,
        patch: ReservationPatch,
        user_id: UserId,
    ) -> Result<ReservationOutcome, EngineError> {
        let room_id = self.room_of(&id).ok_or(NotFound::Reservation(id))?;
        let timeline = self.timeline(&room_id).ok_or(NotFound::Reservation(id))?;
        let mut guard = timeline.write().await;
        let existing = guard.get(id).cloned().ok_or(NotFound::Reservation(id))?;

        let room = self.authorize(room_id, user_id).await?;
        if existing.organizer_id != user_id {
            return Err(EngineError::forbidden("only the organizer can update this reservation"));
        }

        let now = self.now();
        let mut updated = existing.clone();

        if patch.touches_window() {
            let span = patched_span(&patch, existing.span, now, &self.config)
                .map_err(|e| window_rejected(e, room_id, user_id))?;
            self.conflict_free(&guard, &span, Some(id), user_id)?;
            updated.span = span;
        }

        if let Patch::Set(title) = patch.title {
            require_title(&title)?;
            updated.title = title;
        }
        if let Patch::Set(description) = patch.description {
            updated.description = description;
        }
        if let Patch::Set(invitees) = patch.invitees {
            let invitees = normalize_invitees(invitees, existing.organizer_id);
            self.check_invitees(&invitees).await?;
            updated.invitees = invitees;
        }
        updated.updated_at = now;

        let warning = capacity_warning(&room, updated.participant_count());
        let event = Event::ReservationUpdated {
            reservation: updated.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;

        if warning.is_some() {
            metrics::counter!(observability::CAPACITY_WARNINGS_TOTAL).increment(1);
        }
        tracing::info!(
            reservation_id = %id,
            %room_id,
            %user_id,
            has_warning = warning.is_some(),
            "reservation updated"
        );
        Ok(ReservationOutcome {
            reservation: updated,
            warning,
        })
    }

    /// Permanently remove a reservation. Only the organizer may do this.
    pub async fn delete_reservation(&self, id: ReservationId, user_id: UserId) -> Result<(), EngineError> {
        let room_id = self.room_of(&id).ok_or(NotFound::Reservation(id))?;
        let timeline = self.timeline(&room_id).ok_or(NotFound::Reservation(id))?;
        let mut guard = timeline.write().await;
        let existing = guard.get(id).ok_or(NotFound::Reservation(id))?;
        let organizer_id = existing.organizer_id;

        self.authorize(room_id, user_id).await?;
        if organizer_id != user_id {
            return Err(EngineError::forbidden("only the organizer can delete this reservation"));
        }

        let event = Event::ReservationDeleted { id, room_id };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!(reservation_id = %id, %room_id, %user_id, "reservation deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(capacity: Option<u32>) -> Room {
        Room {
            id: Ulid::new(),
            name: None,
            capacity,
        }
    }

    #[test]
    fn warning_only_above_capacity() {
        assert_eq!(capacity_warning(&room(Some(3)), 3), None);
        let warning = capacity_warning(&room(Some(3)), 4).unwrap();
        assert_eq!(
            warning,
            "Warning: The number of participants (4) exceeds the room capacity (3)"
        );
    }

    #[test]
    fn no_capacity_means_no_warning() {
        assert_eq!(capacity_warning(&room(None), 500), None);
    }

    #[test]
    fn invitees_are_deduplicated_without_organizer() {
        let organizer = Ulid::new();
        let (a, b) = (Ulid::new(), Ulid::new());
        assert_eq!(normalize_invitees(vec![a, organizer, b, a], organizer), vec![a, b]);
    }

    #[test]
    fn blank_title_is_invalid_input() {
        assert!(matches!(require_title("  "), Err(EngineError::InvalidInput(_))));
        assert!(require_title("Standup").is_ok());
    }
}
