use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;
use crate::policy::{Action, Principal};

use super::conflict::today;
use super::{Engine, EngineError, SharedItemState};

impl Engine {
    pub async fn get_item(&self, id: Ulid) -> Option<Item> {
        let state = self.get_item_state(&id)?;
        let guard = state.read().await;
        Some(guard.item.clone())
    }

    /// Catalog listing, optionally narrowed to a category or to items whose
    /// availability flag is up. Sorted by name.
    pub async fn list_items(&self, category: Option<Ulid>, available_only: bool) -> Vec<Item> {
        let states: Vec<SharedItemState> =
            self.items.iter().map(|e| e.value().clone()).collect();
        let mut items = Vec::with_capacity(states.len());
        for state in states {
            let guard = state.read().await;
            if let Some(category) = category
                && guard.item.category_id != category
            {
                continue;
            }
            if available_only && !guard.item.is_available {
                continue;
            }
            items.push(guard.item.clone());
        }
        items.sort_by(|a, b| a.name.cmp(&b.name));
        items
    }

    pub fn list_categories(&self) -> Vec<Category> {
        let mut categories: Vec<Category> =
            self.categories.iter().map(|e| e.value().clone()).collect();
        categories.sort_by(|a, b| a.name.cmp(&b.name));
        categories
    }

    pub fn get_reservation(&self, id: &Ulid) -> Option<Reservation> {
        self.reservations.get(id).map(|r| r.value().clone())
    }

    /// A customer's own reservations, newest first.
    pub fn my_reservations(&self, principal: &Principal) -> Vec<Reservation> {
        let mut out: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|e| e.value().customer == principal.id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|r| std::cmp::Reverse(r.created_at));
        out
    }

    /// The returns desk feed: active rentals whose end date has passed.
    pub fn reservations_due_back(
        &self,
        principal: &Principal,
    ) -> Result<Vec<Reservation>, EngineError> {
        self.authorize(principal, Action::ProcessReturn)?;
        let today = today();
        let mut out: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|e| {
                let r = e.value();
                r.status == ReservationStatus::Active && r.range.end <= today
            })
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|r| r.range.end);
        Ok(out)
    }

    pub fn get_maintenance(&self, id: &Ulid) -> Option<Maintenance> {
        self.maintenance.get(id).map(|m| m.value().clone())
    }

    /// Full maintenance calendar, soonest first. Staff-area view.
    pub fn maintenance_schedule(
        &self,
        principal: &Principal,
    ) -> Result<Vec<Maintenance>, EngineError> {
        self.authorize(principal, Action::ViewMaintenance)?;
        let mut out: Vec<Maintenance> =
            self.maintenance.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|m| m.date);
        Ok(out)
    }

    /// Fleet snapshot for managers: totals, per-category utilization, what is
    /// in the shop today and what should be coming back.
    pub async fn report_summary(
        &self,
        principal: &Principal,
    ) -> Result<ReportSummary, EngineError> {
        self.authorize(principal, Action::ViewReports)?;
        let today = today();

        struct Tally {
            total: usize,
            available: usize,
            in_use: usize,
            in_maintenance: usize,
        }

        let states: Vec<SharedItemState> =
            self.items.iter().map(|e| e.value().clone()).collect();
        let mut total_items = 0usize;
        let mut available_items = 0usize;
        let mut in_maintenance_today = 0usize;
        let mut per_category: HashMap<Ulid, Tally> = HashMap::new();

        for state in states {
            let guard = state.read().await;
            total_items += 1;
            let available = guard.item.is_available;
            if available {
                available_items += 1;
            }
            let in_use = guard.bookings.iter().any(|b| b.range.contains_day(today));
            let in_maintenance = guard.windows.iter().any(|w| w.day == today);
            if in_maintenance {
                in_maintenance_today += 1;
            }

            let tally = per_category
                .entry(guard.item.category_id)
                .or_insert(Tally {
                    total: 0,
                    available: 0,
                    in_use: 0,
                    in_maintenance: 0,
                });
            tally.total += 1;
            if available {
                tally.available += 1;
            }
            if in_use {
                tally.in_use += 1;
            }
            if in_maintenance {
                tally.in_maintenance += 1;
            }
        }

        let active_reservations = self
            .reservations
            .iter()
            .filter(|e| e.value().status == ReservationStatus::Active)
            .count();
        let pending_returns = self
            .reservations
            .iter()
            .filter(|e| {
                let r = e.value();
                r.status == ReservationStatus::Active && r.range.end <= today
            })
            .count();

        let mut categories: Vec<CategoryStats> = per_category
            .into_iter()
            .map(|(id, tally)| CategoryStats {
                name: self
                    .categories
                    .get(&id)
                    .map(|c| c.value().name.clone())
                    .unwrap_or_else(|| id.to_string()),
                total: tally.total,
                available: tally.available,
                in_use: tally.in_use,
                in_maintenance: tally.in_maintenance,
            })
            .collect();
        categories.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(ReportSummary {
            total_items,
            available_items,
            active_reservations,
            in_maintenance_today,
            pending_returns,
            categories,
        })
    }
}
