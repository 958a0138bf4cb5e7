use ulid::Ulid;

use crate::limits::{MAX_LINE_ITEMS, MAX_QUANTITY};
use crate::model::*;
use crate::policy::{Action, Principal};

use super::conflict::{check_no_conflict, line_subtotal, now, today, validate_range};
use super::{Engine, EngineError, ItemGuards};

/// One requested line of a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRequest {
    pub item_id: Ulid,
    pub quantity: u32,
}

/// Outcome of `cancel` — cancelling twice is not an error, just a signal the
/// caller can surface as a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyCancelled,
}

impl Engine {
    /// Book a single item for a date range. The common path; delegates to
    /// `reserve_many` with one line.
    pub async fn reserve(
        &self,
        principal: &Principal,
        item_id: Ulid,
        range: DateRange,
    ) -> Result<Reservation, EngineError> {
        self.reserve_many(principal, &[LineRequest { item_id, quantity: 1 }], range)
            .await
    }

    /// Book several items for one date range, all-or-nothing.
    ///
    /// Item write locks are taken in sorted id order and held across the
    /// conflict checks, the WAL append and the state apply — two overlapping
    /// requests for the same item serialize here instead of racing past each
    /// other's conflict checks. The whole reservation (header + lines) is one
    /// WAL event, so a partial booking cannot be persisted.
    pub async fn reserve_many(
        &self,
        principal: &Principal,
        lines: &[LineRequest],
        range: DateRange,
    ) -> Result<Reservation, EngineError> {
        self.authorize(principal, Action::BookReservation)?;
        if lines.is_empty() {
            return Err(EngineError::Validation("a reservation needs at least one item"));
        }
        if lines.len() > MAX_LINE_ITEMS {
            return Err(EngineError::LimitExceeded("too many line items"));
        }
        for line in lines {
            if line.quantity == 0 {
                return Err(EngineError::Validation("quantity must be at least 1"));
            }
            if line.quantity > MAX_QUANTITY {
                return Err(EngineError::LimitExceeded("quantity too large"));
            }
        }
        let mut ids: Vec<Ulid> = lines.iter().map(|l| l.item_id).collect();
        ids.sort();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            return Err(EngineError::Validation(
                "an item may appear only once per reservation",
            ));
        }
        validate_range(&range, today())?;

        let mut guards = ItemGuards::lock(self, ids).await?;

        for line in lines {
            let state = guards
                .get(line.item_id)
                .ok_or(EngineError::NotFound(line.item_id))?;
            if let Err(e) = check_no_conflict(state, &range) {
                if matches!(e, EngineError::Conflict { .. }) {
                    metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL)
                        .increment(1);
                }
                return Err(e);
            }
        }

        let day_count = range.day_count();
        let mut total = Money::ZERO;
        let mut records = Vec::with_capacity(lines.len());
        for line in lines {
            let state = guards
                .get(line.item_id)
                .ok_or(EngineError::NotFound(line.item_id))?;
            let rate = state.item.daily_rate;
            let subtotal = line_subtotal(rate, line.quantity, day_count);
            total += subtotal;
            records.push(LineItem {
                item_id: line.item_id,
                quantity: line.quantity,
                price_per_day: rate,
                subtotal,
            });
        }

        let id = Ulid::new();
        let at = now();
        let event = Event::ReservationBooked {
            id,
            customer: principal.id,
            range,
            status: ReservationStatus::Active,
            total_cost: total,
            lines: records,
            created_at: at,
            updated_at: at,
        };
        self.persist_and_apply(&event, &mut guards).await?;
        metrics::counter!(crate::observability::RESERVATIONS_BOOKED_TOTAL).increment(1);
        tracing::info!(reservation = %id, customer = %principal.id, "booked");

        self.reservations
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or_else(|| EngineError::Invariant(format!("reservation {id} vanished after booking")))
    }

    /// Cancel a reservation. Owner-only regardless of role; idempotent when
    /// already cancelled.
    pub async fn cancel(
        &self,
        principal: &Principal,
        reservation_id: Ulid,
    ) -> Result<CancelOutcome, EngineError> {
        let (owner, line_ids) = {
            let r = self
                .reservations
                .get(&reservation_id)
                .ok_or(EngineError::NotFound(reservation_id))?;
            let r = r.value();
            (r.customer, r.lines.iter().map(|l| l.item_id).collect::<Vec<_>>())
        };
        self.authorize(principal, Action::CancelReservation { owner })?;

        let mut guards = ItemGuards::lock_existing(self, line_ids).await;
        // Status may have moved while we waited for the locks.
        let status = self
            .reservations
            .get(&reservation_id)
            .ok_or(EngineError::NotFound(reservation_id))?
            .value()
            .status;
        if status == ReservationStatus::Cancelled {
            tracing::warn!(reservation = %reservation_id, "cancel of already-cancelled reservation");
            return Ok(CancelOutcome::AlreadyCancelled);
        }
        if !status.can_transition_to(ReservationStatus::Cancelled) {
            return Err(EngineError::InvalidReservationTransition {
                from: status,
                to: ReservationStatus::Cancelled,
            });
        }

        let event = Event::ReservationStatusChanged {
            id: reservation_id,
            status: ReservationStatus::Cancelled,
            at: now(),
        };
        self.persist_and_apply(&event, &mut guards).await?;
        Ok(CancelOutcome::Cancelled)
    }

    /// Staff path that closes out a rental. Only a `completed` return is
    /// meaningful; the availability flag on every line item comes back up,
    /// whatever it was before.
    pub async fn process_return(
        &self,
        principal: &Principal,
        reservation_id: Ulid,
        new_status: ReservationStatus,
    ) -> Result<Reservation, EngineError> {
        self.authorize(principal, Action::ProcessReturn)?;
        if new_status != ReservationStatus::Completed {
            return Err(EngineError::Validation("returns can only complete a reservation"));
        }

        let line_ids: Vec<Ulid> = self
            .reservations
            .get(&reservation_id)
            .ok_or(EngineError::NotFound(reservation_id))?
            .value()
            .lines
            .iter()
            .map(|l| l.item_id)
            .collect();

        let mut guards = ItemGuards::lock_existing(self, line_ids).await;
        let status = self
            .reservations
            .get(&reservation_id)
            .ok_or(EngineError::NotFound(reservation_id))?
            .value()
            .status;
        if !status.can_transition_to(ReservationStatus::Completed) {
            return Err(EngineError::InvalidReservationTransition {
                from: status,
                to: ReservationStatus::Completed,
            });
        }

        let event = Event::ReservationStatusChanged {
            id: reservation_id,
            status: ReservationStatus::Completed,
            at: now(),
        };
        self.persist_and_apply(&event, &mut guards).await?;
        tracing::info!(reservation = %reservation_id, staff = %principal.id, "return processed");

        self.reservations
            .get(&reservation_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| {
                EngineError::Invariant(format!("reservation {reservation_id} vanished during return"))
            })
    }
}
