use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::limits::MAX_DESCRIPTION_LEN;
use crate::model::*;
use crate::policy::{Action, Principal};

use super::conflict::now;
use super::{Engine, EngineError, ItemGuards};

impl Engine {
    /// Put a maintenance window on an item. The window's calendar day blocks
    /// bookings for as long as the record stays scheduled or in progress.
    pub async fn schedule_maintenance(
        &self,
        principal: &Principal,
        item_id: Ulid,
        date: DateTime<Utc>,
        description: &str,
    ) -> Result<Maintenance, EngineError> {
        self.authorize(principal, Action::ScheduleMaintenance)?;
        let description = description.trim();
        if description.is_empty() {
            return Err(EngineError::Validation("maintenance description is required"));
        }
        if description.len() > MAX_DESCRIPTION_LEN {
            return Err(EngineError::LimitExceeded("description too long"));
        }
        let at = now();
        if date < at {
            return Err(EngineError::Validation("maintenance date is in the past"));
        }

        let mut guards = ItemGuards::lock(self, [item_id]).await?;
        let id = Ulid::new();
        let event = Event::MaintenanceScheduled {
            id,
            item_id,
            staff: principal.id,
            date,
            description: description.to_string(),
            created_at: at,
            updated_at: at,
        };
        self.persist_and_apply(&event, &mut guards).await?;
        tracing::info!(maintenance = %id, item = %item_id, "maintenance scheduled");

        self.maintenance
            .get(&id)
            .map(|m| m.value().clone())
            .ok_or_else(|| EngineError::Invariant(format!("maintenance {id} vanished after scheduling")))
    }

    /// Move a maintenance record through its lifecycle. The transition table
    /// is strict: scheduled → {in_progress, cancelled},
    /// in_progress → {completed, cancelled}, terminal states reject
    /// everything. A completed record stamps the item's `last_maintained`,
    /// and a terminal record stops blocking bookings.
    pub async fn update_maintenance_status(
        &self,
        principal: &Principal,
        id: Ulid,
        new_status: MaintenanceStatus,
    ) -> Result<Maintenance, EngineError> {
        self.authorize(principal, Action::UpdateMaintenanceStatus)?;
        let item_id = self
            .maintenance
            .get(&id)
            .ok_or(EngineError::NotFound(id))?
            .value()
            .item_id;

        let mut guards = ItemGuards::lock_existing(self, [item_id]).await;
        // Re-read under the item lock — another staff member may have raced us.
        let current = self
            .maintenance
            .get(&id)
            .ok_or(EngineError::NotFound(id))?
            .value()
            .status;
        if !current.can_transition_to(new_status) {
            return Err(EngineError::InvalidMaintenanceTransition {
                from: current,
                to: new_status,
            });
        }

        let event = Event::MaintenanceStatusChanged {
            id,
            status: new_status,
            at: now(),
        };
        self.persist_and_apply(&event, &mut guards).await?;

        self.maintenance
            .get(&id)
            .map(|m| m.value().clone())
            .ok_or(EngineError::NotFound(id))
    }
}
