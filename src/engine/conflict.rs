use chrono::{DateTime, NaiveDate, Utc};

use crate::limits::MAX_RANGE_DAYS;
use crate::model::{DateRange, ItemState, Money};

use super::EngineError;

pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}

pub(crate) fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Date-window validation for a booking request: no past starts, no inverted
/// ranges, nothing absurdly wide. `today` is passed in so the rules stay
/// deterministic under test.
pub(crate) fn validate_range(range: &DateRange, today: NaiveDate) -> Result<(), EngineError> {
    if range.end < range.start {
        return Err(EngineError::Validation("end date is before start date"));
    }
    if range.start < today {
        return Err(EngineError::Validation("start date is in the past"));
    }
    if range.day_count() > MAX_RANGE_DAYS {
        return Err(EngineError::LimitExceeded("date range too wide"));
    }
    Ok(())
}

/// Conflict check A: a scheduled or in-progress maintenance day falling
/// inside the requested range blocks the booking. Terminal records never
/// appear in `windows`, so no status filter is needed here.
pub(crate) fn check_no_maintenance_conflict(
    state: &ItemState,
    range: &DateRange,
) -> Result<(), EngineError> {
    if let Some(window) = state.window_within(range) {
        return Err(EngineError::Conflict {
            item_id: state.item.id,
            blocker: window.maintenance_id,
        });
    }
    Ok(())
}

/// Conflict check B: closed-interval overlap against active reservations.
/// Boundary-touching days collide — the item cannot be returned and re-rented
/// on the same calendar day.
pub(crate) fn check_no_booking_conflict(
    state: &ItemState,
    range: &DateRange,
) -> Result<(), EngineError> {
    if let Some(existing) = state.bookings_overlapping(range).next() {
        return Err(EngineError::Conflict {
            item_id: state.item.id,
            blocker: existing.reservation_id,
        });
    }
    Ok(())
}

/// Both availability checks, maintenance first (matching the order user
/// messages are surfaced in).
pub(crate) fn check_no_conflict(state: &ItemState, range: &DateRange) -> Result<(), EngineError> {
    check_no_maintenance_conflict(state, range)?;
    check_no_booking_conflict(state, range)
}

/// price_per_day × quantity × inclusive day count.
pub(crate) fn line_subtotal(rate: Money, quantity: u32, day_count: i64) -> Money {
    rate * Money::from(quantity) * Money::from(day_count)
}
