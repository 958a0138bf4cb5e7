use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::policy::{Action, Principal};

use super::conflict::now;
use super::{Engine, EngineError, ItemGuards, SharedItemState};

impl Engine {
    pub async fn create_category(
        &self,
        principal: &Principal,
        name: &str,
        description: &str,
    ) -> Result<Category, EngineError> {
        self.authorize(principal, Action::ManageCategories)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::Validation("category name is required"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("category name too long"));
        }
        if description.len() > MAX_DESCRIPTION_LEN {
            return Err(EngineError::LimitExceeded("description too long"));
        }
        if self.categories.len() >= MAX_CATEGORIES {
            return Err(EngineError::LimitExceeded("too many categories"));
        }

        let at = now();
        let category = Category {
            id: Ulid::new(),
            name: name.to_string(),
            description: description.to_string(),
            created_at: at,
            updated_at: at,
        };
        let event = Event::CategoryCreated {
            id: category.id,
            name: category.name.clone(),
            description: category.description.clone(),
            created_at: at,
            updated_at: at,
        };
        self.persist_and_apply(&event, &mut ItemGuards::none()).await?;
        Ok(category)
    }

    pub async fn update_category(
        &self,
        principal: &Principal,
        id: Ulid,
        name: &str,
        description: &str,
    ) -> Result<Category, EngineError> {
        self.authorize(principal, Action::ManageCategories)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::Validation("category name is required"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("category name too long"));
        }
        if description.len() > MAX_DESCRIPTION_LEN {
            return Err(EngineError::LimitExceeded("description too long"));
        }
        if !self.categories.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }

        let event = Event::CategoryUpdated {
            id,
            name: name.to_string(),
            description: description.to_string(),
            at: now(),
        };
        self.persist_and_apply(&event, &mut ItemGuards::none()).await?;
        self.categories
            .get(&id)
            .map(|c| c.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    /// A category with items cannot be deleted — reassign or remove the
    /// items first.
    pub async fn delete_category(&self, principal: &Principal, id: Ulid) -> Result<(), EngineError> {
        self.authorize(principal, Action::ManageCategories)?;
        if !self.categories.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let states: Vec<SharedItemState> =
            self.items.iter().map(|e| e.value().clone()).collect();
        for state in states {
            if state.read().await.item.category_id == id {
                return Err(EngineError::CategoryInUse(id));
            }
        }

        let event = Event::CategoryDeleted { id };
        self.persist_and_apply(&event, &mut ItemGuards::none()).await
    }

    pub async fn register_item(
        &self,
        principal: &Principal,
        name: &str,
        description: &str,
        category_id: Ulid,
        daily_rate: Money,
        condition: &str,
    ) -> Result<Item, EngineError> {
        self.authorize(principal, Action::ManageInventory)?;
        validate_item_fields(name, description, condition, daily_rate)?;
        if !self.categories.contains_key(&category_id) {
            return Err(EngineError::NotFound(category_id));
        }
        if self.items.len() >= MAX_ITEMS {
            return Err(EngineError::LimitExceeded("too many items"));
        }

        let at = now();
        let item = Item {
            id: Ulid::new(),
            name: name.trim().to_string(),
            description: description.to_string(),
            category_id,
            daily_rate,
            condition: condition.to_string(),
            is_available: true,
            last_maintained: None,
            created_at: at,
            updated_at: at,
        };
        let event = Event::ItemRegistered {
            id: item.id,
            name: item.name.clone(),
            description: item.description.clone(),
            category_id,
            daily_rate,
            condition: item.condition.clone(),
            is_available: true,
            last_maintained: None,
            created_at: at,
            updated_at: at,
        };
        self.persist_and_apply(&event, &mut ItemGuards::none()).await?;
        Ok(item)
    }

    /// Edit an item's descriptive fields and rate. Historical reservations
    /// keep their price snapshots — only future bookings see the new rate.
    pub async fn update_item(
        &self,
        principal: &Principal,
        id: Ulid,
        name: &str,
        description: &str,
        category_id: Ulid,
        daily_rate: Money,
        condition: &str,
    ) -> Result<Item, EngineError> {
        self.authorize(principal, Action::ManageInventory)?;
        validate_item_fields(name, description, condition, daily_rate)?;
        if !self.categories.contains_key(&category_id) {
            return Err(EngineError::NotFound(category_id));
        }

        let mut guards = ItemGuards::lock(self, [id]).await?;
        let event = Event::ItemUpdated {
            id,
            name: name.trim().to_string(),
            description: description.to_string(),
            category_id,
            daily_rate,
            condition: condition.to_string(),
            at: now(),
        };
        self.persist_and_apply(&event, &mut guards).await?;
        guards
            .get(id)
            .map(|state| state.item.clone())
            .ok_or(EngineError::NotFound(id))
    }

    /// Items with live bookings or maintenance windows cannot be deleted.
    pub async fn delete_item(&self, principal: &Principal, id: Ulid) -> Result<(), EngineError> {
        self.authorize(principal, Action::ManageInventory)?;
        let mut guards = ItemGuards::lock(self, [id]).await?;
        {
            let state = guards.get(id).ok_or(EngineError::NotFound(id))?;
            if !state.bookings.is_empty() || !state.windows.is_empty() {
                return Err(EngineError::ItemInUse(id));
            }
        }
        let event = Event::ItemDeleted { id };
        self.persist_and_apply(&event, &mut guards).await
    }

    /// Direct availability-flag control for the inventory desk. Bookings do
    /// not consult the flag — overlap checks are the gatekeeper — but the
    /// catalog does.
    pub async fn set_available(
        &self,
        principal: &Principal,
        id: Ulid,
        available: bool,
    ) -> Result<Item, EngineError> {
        self.authorize(principal, Action::ManageInventory)?;
        let mut guards = ItemGuards::lock(self, [id]).await?;
        let event = Event::ItemAvailabilityChanged {
            id,
            available,
            at: now(),
        };
        self.persist_and_apply(&event, &mut guards).await?;
        guards
            .get(id)
            .map(|state| state.item.clone())
            .ok_or(EngineError::NotFound(id))
    }
}

fn validate_item_fields(
    name: &str,
    description: &str,
    condition: &str,
    daily_rate: Money,
) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Validation("item name is required"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("item name too long"));
    }
    if description.len() > MAX_DESCRIPTION_LEN {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    if condition.len() > MAX_CONDITION_LEN {
        return Err(EngineError::LimitExceeded("condition too long"));
    }
    if daily_rate.is_sign_negative() {
        return Err(EngineError::Validation("daily rate cannot be negative"));
    }
    Ok(())
}
