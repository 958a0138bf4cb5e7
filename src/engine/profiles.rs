use ulid::Ulid;

use crate::limits::{MAX_PROFILES, MAX_USERNAME_LEN};
use crate::model::{Event, Profile};
use crate::policy::{Action, Principal, Role};

use super::conflict::now;
use super::{Engine, EngineError, ItemGuards};

impl Engine {
    /// Explicitly provision a profile at account-creation time. This replaces
    /// any notion of reactive on-create hooks — the caller decides when, the
    /// engine records it once.
    pub async fn provision_profile(
        &self,
        principal: &Principal,
        user_id: Ulid,
        username: &str,
        role: Role,
    ) -> Result<Profile, EngineError> {
        self.authorize(principal, Action::ProvisionProfile { role })?;
        let username = username.trim();
        if username.is_empty() {
            return Err(EngineError::Validation("username is required"));
        }
        if username.len() > MAX_USERNAME_LEN {
            return Err(EngineError::LimitExceeded("username too long"));
        }
        if self.profiles.contains_key(&user_id) {
            return Err(EngineError::AlreadyExists(user_id));
        }
        if self.profiles.len() >= MAX_PROFILES {
            return Err(EngineError::LimitExceeded("too many profiles"));
        }

        let at = now();
        let profile = Profile {
            user_id,
            username: username.to_string(),
            role,
            created_at: at,
        };
        let event = Event::ProfileProvisioned {
            user_id,
            username: profile.username.clone(),
            role,
            created_at: at,
        };
        self.persist_and_apply(&event, &mut ItemGuards::none()).await?;
        Ok(profile)
    }

    pub async fn change_role(
        &self,
        principal: &Principal,
        user_id: Ulid,
        new_role: Role,
    ) -> Result<Profile, EngineError> {
        let target_current = self
            .profiles
            .get(&user_id)
            .ok_or(EngineError::NotFound(user_id))?
            .value()
            .role;
        self.authorize(
            principal,
            Action::ChangeRole {
                target_current,
                new_role,
                target_is_self: principal.id == user_id,
            },
        )?;

        let event = Event::RoleChanged {
            user_id,
            role: new_role,
        };
        self.persist_and_apply(&event, &mut ItemGuards::none()).await?;
        self.profiles
            .get(&user_id)
            .map(|p| p.value().clone())
            .ok_or(EngineError::NotFound(user_id))
    }

    pub async fn delete_profile(
        &self,
        principal: &Principal,
        user_id: Ulid,
    ) -> Result<(), EngineError> {
        let target_role = self
            .profiles
            .get(&user_id)
            .ok_or(EngineError::NotFound(user_id))?
            .value()
            .role;
        self.authorize(
            principal,
            Action::DeleteProfile {
                target_role,
                target_is_self: principal.id == user_id,
            },
        )?;

        let event = Event::ProfileDeleted { user_id };
        self.persist_and_apply(&event, &mut ItemGuards::none()).await
    }

    pub fn get_profile(&self, user_id: &Ulid) -> Option<Profile> {
        self.profiles.get(user_id).map(|p| p.value().clone())
    }
}
