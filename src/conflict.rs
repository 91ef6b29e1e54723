use ulid::Ulid;

use crate::error::Error;
use crate::limits::MAX_RESERVATION_DURATION_MS;
use crate::model::*;

/// First confirmed reservation on `rs` overlapping `span`, ignoring `exclude`.
/// Cancelled reservations never conflict.
pub fn find_conflict<'a>(
    rs: &'a ResourceState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Option<&'a Reservation> {
    rs.overlapping(span)
        .find(|r| r.is_confirmed() && Some(r.id) != exclude)
}

pub fn has_conflict(rs: &ResourceState, span: &Span, exclude: Option<Ulid>) -> bool {
    find_conflict(rs, span, exclude).is_some()
}

/// Must be called with the room's write lock held by the same transaction
/// that stages the write.
pub fn check_no_conflict(rs: &ResourceState, span: &Span, exclude: Option<Ulid>) -> Result<(), Error> {
    match find_conflict(rs, span, exclude) {
        Some(existing) => {
            metrics::counter!(crate::observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
            Err(Error::Overlap(existing.id))
        }
        None => Ok(()),
    }
}

/// Turn raw instants into a bookable span: ordered, capped, not in the past.
pub fn validate_booking_range(start: Ms, end: Ms, now: Ms) -> Result<Span, Error> {
    let span = Span::try_new(start, end)
        .ok_or_else(|| Error::validation("start time must be before end time"))?;
    if span.duration_ms() > MAX_RESERVATION_DURATION_MS {
        return Err(Error::validation("reservation cannot be longer than 8 hours"));
    }
    if span.start < now {
        return Err(Error::validation("cannot book a time in the past"));
    }
    Ok(span)
}
