use chrono::FixedOffset;

use crate::model::*;

use super::error::WindowError;
use super::window::{date_of, day_end, day_start, parse_date, parse_instant};

/// Width of the default availability range.
pub const DEFAULT_RANGE_DAYS: Ms = 7;

// ── Range resolution ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Start,
    End,
}

/// Resolve the query range. Date-only or omitted bounds snap to the start
/// of their day (range start) or the last millisecond of their day (range
/// end). Full timestamps are taken as given. Omitted bounds default to
/// `[now, now + 7 days)`.
///
/// The result may be inverted; callers treat that as an empty range.
pub fn resolve_range(
    start: Option<&str>,
    end: Option<&str>,
    now: Ms,
    offset: FixedOffset,
) -> Result<(Ms, Ms), WindowError> {
    let start = resolve_bound(start, now, offset, Edge::Start)?;
    let end = resolve_bound(end, now + DEFAULT_RANGE_DAYS * DAY_MS, offset, Edge::End)?;
    Ok((start, end))
}

fn resolve_bound(raw: Option<&str>, default: Ms, offset: FixedOffset, edge: Edge) -> Result<Ms, WindowError> {
    let date = match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => date_of(default, offset),
        Some(raw) => match parse_date(raw) {
            Some(date) => Some(date),
            None => return parse_instant(raw, offset).ok_or(WindowError::Malformed),
        },
    };
    let bound = date.and_then(|date| match edge {
        Edge::Start => day_start(date, offset),
        Edge::End => day_end(date, offset),
    });
    bound.ok_or(WindowError::Malformed)
}

// ── Gap walk ──────────────────────────────────────────────────────

/// Free gaps between `booked` spans (sorted by start) inside
/// `[range_start, range_end)`.
///
/// Walks a cursor from the range start: every reservation that begins after
/// the cursor closes a slot, and the cursor jumps to the furthest end seen.
/// When `buffer` is given, slot edges that touch a reservation are pulled in
/// by the buffer and slots that vanish are dropped, so every slot reported
/// can be booked edge to edge.
pub fn free_slots(booked: &[Span], range_start: Ms, range_end: Ms, buffer: Option<Ms>) -> Vec<Span> {
    let mut slots = Vec::new();
    if range_start >= range_end {
        return slots;
    }
    let pad = buffer.unwrap_or(0);
    let mut cursor = range_start;
    let mut cursor_after_booking = false;

    for span in booked {
        if span.start >= range_end {
            break;
        }
        if span.start > cursor {
            let from = if cursor_after_booking { cursor + pad } else { cursor };
            push_slot(&mut slots, from, span.start - pad);
        }
        if span.end > cursor {
            cursor = span.end;
            cursor_after_booking = true;
        }
    }

    if cursor < range_end {
        let from = if cursor_after_booking { cursor + pad } else { cursor };
        push_slot(&mut slots, from, range_end);
    }
    slots
}

fn push_slot(slots: &mut Vec<Span>, start: Ms, end: Ms) {
    if start < end {
        slots.push(Span::new(start, end));
    }
}

/// Reservations overlapping the range plus the free slots between them,
/// optionally dropping slots shorter than `min_duration`.
pub fn compute(
    timeline: Option<&RoomTimeline>,
    range_start: Ms,
    range_end: Ms,
    buffer: Option<Ms>,
    min_duration: Option<Ms>,
) -> (Vec<Reservation>, Vec<Span>) {
    let reservations: Vec<Reservation> = match timeline {
        Some(tl) if range_start < range_end => tl
            .overlapping(&Span::new(range_start, range_end))
            .cloned()
            .collect(),
        _ => Vec::new(),
    };
    let booked: Vec<Span> = reservations.iter().map(|r| r.span).collect();
    let mut slots = free_slots(&booked, range_start, range_end, buffer);
    if let Some(min) = min_duration {
        slots.retain(|s| s.duration_ms() >= min);
    }
    (reservations, slots)
}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::*;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn at(raw: &str) -> Ms {
        parse_instant(raw, utc()).unwrap()
    }

    fn span(start: &str, end: &str) -> Span {
        Span::new(at(start), at(end))
    }

    fn timeline(spans: &[Span]) -> RoomTimeline {
        let mut tl = RoomTimeline::new(Ulid::new());
        for &s in spans {
            tl.insert(Reservation {
                id: Ulid::new(),
                title: "busy".into(),
                description: None,
                span: s,
                room_id: tl.room_id,
                organizer_id: Ulid::new(),
                invitees: Vec::new(),
                created_at: 0,
                updated_at: 0,
            });
        }
        tl
    }

    #[test]
    fn gaps_between_two_bookings() {
        let booked = [
            span("2030-01-15T10:00:00Z", "2030-01-15T11:00:00Z"),
            span("2030-01-15T14:00:00Z", "2030-01-15T15:00:00Z"),
        ];
        let slots = free_slots(&booked, at("2030-01-15T08:00:00Z"), at("2030-01-15T18:00:00Z"), None);
        assert_eq!(
            slots,
            vec![
                span("2030-01-15T08:00:00Z", "2030-01-15T10:00:00Z"),
                span("2030-01-15T11:00:00Z", "2030-01-15T14:00:00Z"),
                span("2030-01-15T15:00:00Z", "2030-01-15T18:00:00Z"),
            ]
        );
    }

    #[test]
    fn empty_room_is_one_slot() {
        let slots = free_slots(&[], 0, 10 * HOUR_MS, None);
        assert_eq!(slots, vec![Span::new(0, 10 * HOUR_MS)]);
    }

    #[test]
    fn back_to_back_bookings_leave_no_gap() {
        let booked = [Span::new(100, 200), Span::new(200, 300)];
        assert_eq!(
            free_slots(&booked, 0, 400, None),
            vec![Span::new(0, 100), Span::new(300, 400)]
        );
    }

    #[test]
    fn nested_booking_does_not_rewind_cursor() {
        let booked = [Span::new(100, 500), Span::new(200, 300)];
        assert_eq!(
            free_slots(&booked, 0, 600, None),
            vec![Span::new(0, 100), Span::new(500, 600)]
        );
    }

    #[test]
    fn booking_straddling_range_start_blocks_head() {
        let booked = [Span::new(-100, 150)];
        assert_eq!(free_slots(&booked, 0, 400, None), vec![Span::new(150, 400)]);
    }

    #[test]
    fn booking_past_range_end_suppresses_trailing_slot() {
        let booked = [Span::new(300, 900)];
        assert_eq!(free_slots(&booked, 0, 400, None), vec![Span::new(0, 300)]);
    }

    #[test]
    fn inverted_range_has_no_slots() {
        assert!(free_slots(&[], 500, 100, None).is_empty());
    }

    #[test]
    fn buffered_slots_shrink_only_booking_edges() {
        let b = 15 * MINUTE_MS;
        let booked = [Span::new(2 * HOUR_MS, 3 * HOUR_MS)];
        let slots = free_slots(&booked, 0, 6 * HOUR_MS, Some(b));
        assert_eq!(
            slots,
            vec![Span::new(0, 2 * HOUR_MS - b), Span::new(3 * HOUR_MS + b, 6 * HOUR_MS)]
        );
    }

    #[test]
    fn buffered_slots_drop_gaps_narrower_than_two_buffers() {
        let b = 15 * MINUTE_MS;
        let booked = [Span::new(HOUR_MS, 2 * HOUR_MS), Span::new(2 * HOUR_MS + 20 * MINUTE_MS, 3 * HOUR_MS)];
        let slots = free_slots(&booked, HOUR_MS, 3 * HOUR_MS, Some(b));
        assert!(slots.is_empty());
    }

    #[test]
    fn compute_filters_short_slots() {
        let tl = timeline(&[
            span("2030-01-15T10:00:00Z", "2030-01-15T11:00:00Z"),
            span("2030-01-15T11:30:00Z", "2030-01-15T12:00:00Z"),
        ]);
        let (reservations, slots) = compute(
            Some(&tl),
            at("2030-01-15T08:00:00Z"),
            at("2030-01-15T18:00:00Z"),
            None,
            Some(HOUR_MS),
        );
        assert_eq!(reservations.len(), 2);
        assert_eq!(
            slots,
            vec![
                span("2030-01-15T08:00:00Z", "2030-01-15T10:00:00Z"),
                span("2030-01-15T12:00:00Z", "2030-01-15T18:00:00Z"),
            ]
        );
    }

    #[test]
    fn compute_reports_only_overlapping_reservations() {
        let tl = timeline(&[
            span("2030-01-14T10:00:00Z", "2030-01-14T11:00:00Z"),
            span("2030-01-15T10:00:00Z", "2030-01-15T11:00:00Z"),
            span("2030-01-16T10:00:00Z", "2030-01-16T11:00:00Z"),
        ]);
        let (reservations, _) = compute(
            Some(&tl),
            at("2030-01-15T00:00:00Z"),
            at("2030-01-16T00:00:00Z") - 1,
            None,
            None,
        );
        assert_eq!(reservations.len(), 1);
        assert_eq!(reservations[0].span.start, at("2030-01-15T10:00:00Z"));
    }

    #[test]
    fn compute_without_timeline_is_whole_range() {
        let (reservations, slots) = compute(None, 0, HOUR_MS, None, None);
        assert!(reservations.is_empty());
        assert_eq!(slots, vec![Span::new(0, HOUR_MS)]);
    }

    // ── range resolution ─────────────────────────────────

    #[test]
    fn date_bounds_snap_to_day_edges() {
        let (start, end) = resolve_range(Some("2030-01-15"), Some("2030-01-16"), 0, utc()).unwrap();
        assert_eq!(start, at("2030-01-15T00:00:00Z"));
        assert_eq!(end, at("2030-01-17T00:00:00Z") - 1);
    }

    #[test]
    fn timestamp_bounds_are_exact() {
        let (start, end) = resolve_range(
            Some("2030-01-15T08:00:00Z"),
            Some("2030-01-15T18:00:00Z"),
            0,
            utc(),
        )
        .unwrap();
        assert_eq!(start, at("2030-01-15T08:00:00Z"));
        assert_eq!(end, at("2030-01-15T18:00:00Z"));
    }

    #[test]
    fn omitted_bounds_cover_a_week_of_whole_days() {
        let now = at("2030-01-14T12:34:56Z");
        let (start, end) = resolve_range(None, None, now, utc()).unwrap();
        assert_eq!(start, at("2030-01-14T00:00:00Z"));
        assert_eq!(end, at("2030-01-22T00:00:00Z") - 1);
    }

    #[test]
    fn date_bounds_follow_offset() {
        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        let (start, _) = resolve_range(Some("2030-01-15"), None, 0, plus_two).unwrap();
        assert_eq!(start, at("2030-01-14T22:00:00Z"));
    }

    #[test]
    fn malformed_bound_is_rejected() {
        assert_eq!(
            resolve_range(Some("next week"), None, 0, utc()),
            Err(WindowError::Malformed)
        );
    }
}
