use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Capability tiers, ordered: each staff-area tier subsumes the ones below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Staff,
    Manager,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Staff => "staff",
            Role::Manager => "manager",
            Role::Admin => "admin",
        }
    }
}

/// The authenticated actor. Resolution (credentials → id + role) happens
/// upstream; the core only ever sees the resolved principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: Ulid,
    pub role: Role,
}

/// Everything a principal can ask the engine to do. Actions that need more
/// than a minimum role carry their context inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    BookReservation,
    /// Owner-only regardless of role — staff elevation does not grant it.
    CancelReservation { owner: Ulid },
    ProcessReturn,
    ViewMaintenance,
    UpdateMaintenanceStatus,
    ScheduleMaintenance,
    ManageInventory,
    ManageCategories,
    ViewReports,
    ProvisionProfile { role: Role },
    ChangeRole {
        target_current: Role,
        new_role: Role,
        target_is_self: bool,
    },
    DeleteProfile {
        target_role: Role,
        target_is_self: bool,
    },
}

impl Action {
    pub fn label(&self) -> &'static str {
        match self {
            Action::BookReservation => "book reservation",
            Action::CancelReservation { .. } => "cancel reservation",
            Action::ProcessReturn => "process return",
            Action::ViewMaintenance => "view maintenance",
            Action::UpdateMaintenanceStatus => "update maintenance status",
            Action::ScheduleMaintenance => "schedule maintenance",
            Action::ManageInventory => "manage inventory",
            Action::ManageCategories => "manage categories",
            Action::ViewReports => "view reports",
            Action::ProvisionProfile { .. } => "provision profile",
            Action::ChangeRole { .. } => "change role",
            Action::DeleteProfile { .. } => "delete profile",
        }
    }
}

/// Minimum-role table for plainly hierarchy-gated actions. `None` means the
/// action's rule is not a simple minimum (ownership, admin specials) and is
/// handled in `authorize` directly.
const fn minimum_role(action: &Action) -> Option<Role> {
    match action {
        Action::BookReservation => Some(Role::Customer),
        Action::ProcessReturn
        | Action::ViewMaintenance
        | Action::UpdateMaintenanceStatus => Some(Role::Staff),
        Action::ScheduleMaintenance
        | Action::ManageInventory
        | Action::ManageCategories
        | Action::ViewReports => Some(Role::Manager),
        Action::CancelReservation { .. }
        | Action::ProvisionProfile { .. }
        | Action::ChangeRole { .. }
        | Action::DeleteProfile { .. } => None,
    }
}

/// Pure predicate — never errors on a well-typed input. Callers surface a
/// denial as a forbidden response.
pub fn authorize(principal: &Principal, action: &Action) -> bool {
    if let Some(min) = minimum_role(action) {
        return principal.role >= min;
    }
    match *action {
        Action::CancelReservation { owner } => principal.id == owner,
        // Managers provision staff and customer accounts; only admins hand
        // out manager or admin.
        Action::ProvisionProfile { role } => {
            if role >= Role::Manager {
                principal.role == Role::Admin
            } else {
                principal.role >= Role::Manager
            }
        }
        // Nobody modifies their own role. Touching a manager/admin account,
        // or elevating anyone to manager/admin, is admin-only.
        Action::ChangeRole {
            target_current,
            new_role,
            target_is_self,
        } => {
            !target_is_self
                && principal.role >= Role::Manager
                && (new_role < Role::Manager || principal.role == Role::Admin)
                && (target_current < Role::Manager || principal.role == Role::Admin)
        }
        Action::DeleteProfile {
            target_role,
            target_is_self,
        } => {
            !target_is_self
                && principal.role >= Role::Manager
                && (target_role < Role::Manager || principal.role == Role::Admin)
        }
        _ => unreachable!("actions with a minimum role are handled above"),
    }
}
