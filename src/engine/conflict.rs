use crate::model::*;

use super::EngineError;

/// Find a reservation on the timeline that collides with `span` once the
/// proposed window is widened by `buffer` on both sides.
///
/// The test is strict half-open overlap, `span.start - buffer < r.end` and
/// `span.end + buffer > r.start`, so a gap of exactly `buffer` is allowed.
/// `exclude` skips the reservation being updated.
pub fn find_conflict(
    timeline: &RoomTimeline,
    span: &Span,
    buffer: Ms,
    exclude: Option<ReservationId>,
) -> Option<ReservationId> {
    let buffered = span.buffered(buffer);
    timeline
        .overlapping(&buffered)
        .find(|r| Some(r.id) != exclude)
        .map(|r| r.id)
}

pub fn has_conflict(
    timeline: &RoomTimeline,
    span: &Span,
    buffer: Ms,
    exclude: Option<ReservationId>,
) -> bool {
    find_conflict(timeline, span, buffer, exclude).is_some()
}

pub(crate) fn check_no_conflict(
    timeline: &RoomTimeline,
    span: &Span,
    buffer: Ms,
    exclude: Option<ReservationId>,
) -> Result<(), EngineError> {
    match find_conflict(timeline, span, buffer, exclude) {
        Some(existing) => Err(EngineError::Conflict(existing)),
        None => Ok(()),
    }
}
