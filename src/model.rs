use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::policy::Role;

/// Fixed-point money — daily rates, snapshots, totals.
pub type Money = Decimal;

/// Closed calendar-date interval `[start, end]` — both endpoint days are rented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start <= end, "DateRange start must not be after end");
        Self { start, end }
    }

    /// Parse a `YYYY-MM-DD` pair. Normalization happens here, once — nothing
    /// downstream re-normalizes on the way to storage.
    pub fn parse(start: &str, end: &str) -> Result<Self, chrono::ParseError> {
        let start = NaiveDate::parse_from_str(start, "%Y-%m-%d")?;
        let end = NaiveDate::parse_from_str(end, "%Y-%m-%d")?;
        Ok(Self { start, end })
    }

    /// Inclusive day count — a same-day range is one rental day.
    pub fn day_count(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Closed-interval overlap: ranges sharing a boundary day DO collide.
    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains_day(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Active,
    Completed,
    Cancelled,
}

impl ReservationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReservationStatus::Completed | ReservationStatus::Cancelled)
    }

    /// The one reservation lifecycle: pending → confirmed → active →
    /// {completed, cancelled}, with cancellation allowed from any live state.
    /// Direct bookings enter at `Active`.
    pub fn can_transition_to(self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Active)
                | (Pending, Cancelled)
                | (Confirmed, Active)
                | (Confirmed, Cancelled)
                | (Active, Completed)
                | (Active, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Active => "active",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl MaintenanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, MaintenanceStatus::Completed | MaintenanceStatus::Cancelled)
    }

    pub fn can_transition_to(self, next: MaintenanceStatus) -> bool {
        use MaintenanceStatus::*;
        matches!(
            (self, next),
            (Scheduled, InProgress)
                | (Scheduled, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Cancelled)
        )
    }

    /// Only live windows block bookings.
    pub fn blocks_booking(self) -> bool {
        matches!(self, MaintenanceStatus::Scheduled | MaintenanceStatus::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MaintenanceStatus::Scheduled => "scheduled",
            MaintenanceStatus::InProgress => "in_progress",
            MaintenanceStatus::Completed => "completed",
            MaintenanceStatus::Cancelled => "cancelled",
        }
    }
}

// ── Aggregates ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: Ulid,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: Ulid,
    pub name: String,
    pub description: String,
    pub category_id: Ulid,
    pub daily_rate: Money,
    pub condition: String,
    pub is_available: bool,
    pub last_maintained: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One item on one reservation, with the rate snapshotted at booking time.
/// Later rate changes never touch historical reservations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub item_id: Ulid,
    pub quantity: u32,
    #[serde(with = "rust_decimal::serde::str")]
    pub price_per_day: Money,
    #[serde(with = "rust_decimal::serde::str")]
    pub subtotal: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub customer: Ulid,
    pub range: DateRange,
    pub status: ReservationStatus,
    pub total_cost: Money,
    pub lines: Vec<LineItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Maintenance {
    pub id: Ulid,
    pub item_id: Ulid,
    pub staff: Ulid,
    pub date: DateTime<Utc>,
    pub description: String,
    pub status: MaintenanceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: Ulid,
    pub username: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

// ── Per-item conflict state ──────────────────────────────────────

/// An active reservation's claim on one item's calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookedRange {
    pub reservation_id: Ulid,
    pub range: DateRange,
}

/// A live (scheduled/in-progress) maintenance window, reduced to the
/// calendar day it blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceWindow {
    pub maintenance_id: Ulid,
    pub day: NaiveDate,
}

/// The item record plus its live blockers. Terminal reservations and
/// maintenance records leave these vectors, so conflict checks only ever
/// scan what can actually collide.
#[derive(Debug, Clone)]
pub struct ItemState {
    pub item: Item,
    /// Active booked ranges, sorted by `range.start`.
    pub bookings: Vec<BookedRange>,
    /// Blocking maintenance days, sorted by `day`.
    pub windows: Vec<MaintenanceWindow>,
}

impl ItemState {
    pub fn new(item: Item) -> Self {
        Self {
            item,
            bookings: Vec::new(),
            windows: Vec::new(),
        }
    }

    /// Insert maintaining sort order by range.start.
    pub fn insert_booking(&mut self, booking: BookedRange) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.range.start, |b| b.range.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, reservation_id: Ulid) -> Option<BookedRange> {
        let pos = self
            .bookings
            .iter()
            .position(|b| b.reservation_id == reservation_id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn insert_window(&mut self, window: MaintenanceWindow) {
        let pos = self
            .windows
            .binary_search_by_key(&window.day, |w| w.day)
            .unwrap_or_else(|e| e);
        self.windows.insert(pos, window);
    }

    pub fn remove_window(&mut self, maintenance_id: Ulid) -> Option<MaintenanceWindow> {
        let pos = self
            .windows
            .iter()
            .position(|w| w.maintenance_id == maintenance_id)?;
        Some(self.windows.remove(pos))
    }

    /// Booked ranges overlapping the query, closed-interval. Binary search
    /// prunes everything starting after `query.end`.
    pub fn bookings_overlapping<'a>(
        &'a self,
        query: &'a DateRange,
    ) -> impl Iterator<Item = &'a BookedRange> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.range.start <= query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.range.end >= query.start)
    }

    /// First blocking maintenance day inside the query range, if any.
    pub fn window_within(&self, query: &DateRange) -> Option<&MaintenanceWindow> {
        self.windows.iter().find(|w| query.contains_day(w.day))
    }
}

// ── WAL event format ─────────────────────────────────────────────

/// The event types — flat, no nesting. This is the WAL record format.
/// Events carry their timestamps so replay is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CategoryCreated {
        id: Ulid,
        name: String,
        description: String,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    },
    CategoryUpdated {
        id: Ulid,
        name: String,
        description: String,
        at: DateTime<Utc>,
    },
    CategoryDeleted {
        id: Ulid,
    },
    ItemRegistered {
        id: Ulid,
        name: String,
        description: String,
        category_id: Ulid,
        #[serde(with = "rust_decimal::serde::str")]
        daily_rate: Money,
        condition: String,
        is_available: bool,
        last_maintained: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    },
    ItemUpdated {
        id: Ulid,
        name: String,
        description: String,
        category_id: Ulid,
        #[serde(with = "rust_decimal::serde::str")]
        daily_rate: Money,
        condition: String,
        at: DateTime<Utc>,
    },
    ItemAvailabilityChanged {
        id: Ulid,
        available: bool,
        at: DateTime<Utc>,
    },
    ItemDeleted {
        id: Ulid,
    },
    ProfileProvisioned {
        user_id: Ulid,
        username: String,
        role: Role,
        created_at: DateTime<Utc>,
    },
    RoleChanged {
        user_id: Ulid,
        role: Role,
    },
    ProfileDeleted {
        user_id: Ulid,
    },
    /// Header and line items travel in one event — booking is atomic by
    /// construction, a reservation can never be persisted without its lines.
    ReservationBooked {
        id: Ulid,
        customer: Ulid,
        range: DateRange,
        status: ReservationStatus,
        #[serde(with = "rust_decimal::serde::str")]
        total_cost: Money,
        lines: Vec<LineItem>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    },
    ReservationStatusChanged {
        id: Ulid,
        status: ReservationStatus,
        at: DateTime<Utc>,
    },
    MaintenanceScheduled {
        id: Ulid,
        item_id: Ulid,
        staff: Ulid,
        date: DateTime<Utc>,
        description: String,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    },
    MaintenanceStatusChanged {
        id: Ulid,
        status: MaintenanceStatus,
        at: DateTime<Utc>,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryStats {
    pub name: String,
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
    pub in_maintenance: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub total_items: usize,
    pub available_items: usize,
    pub active_reservations: usize,
    pub in_maintenance_today: usize,
    pub pending_returns: usize,
    pub categories: Vec<CategoryStats>,
}
