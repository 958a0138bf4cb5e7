use ulid::Ulid;

use crate::model::{MaintenanceStatus, ReservationStatus};

#[derive(Debug)]
pub enum EngineError {
    /// Malformed or logically invalid input. Recoverable — the caller fixes
    /// the request.
    Validation(&'static str),
    /// The requested range collides with existing state on `item_id`;
    /// `blocker` is the reservation or maintenance record in the way.
    Conflict { item_id: Ulid, blocker: Ulid },
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Principal lacks the required role for the named action.
    Forbidden(&'static str),
    InvalidReservationTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    InvalidMaintenanceTransition {
        from: MaintenanceStatus,
        to: MaintenanceStatus,
    },
    CategoryInUse(Ulid),
    ItemInUse(Ulid),
    LimitExceeded(&'static str),
    /// Internal invariant breach — never user-triggerable. The operation
    /// aborts without committing.
    Invariant(String),
    Wal(String),
}

impl EngineError {
    /// Stable kind label, used as the wire error discriminant and as a
    /// metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Conflict { .. } => "conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::InvalidReservationTransition { .. }
            | EngineError::InvalidMaintenanceTransition { .. } => "invalid_transition",
            EngineError::CategoryInUse(_) => "category_in_use",
            EngineError::ItemInUse(_) => "item_in_use",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Invariant(_) => "invariant",
            EngineError::Wal(_) => "storage",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::Conflict { item_id, blocker } => {
                write!(f, "item {item_id} is not free for the requested dates (blocked by {blocker})")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Forbidden(action) => write!(f, "not allowed to {action}"),
            EngineError::InvalidReservationTransition { from, to } => {
                write!(f, "reservation cannot go from {} to {}", from.as_str(), to.as_str())
            }
            EngineError::InvalidMaintenanceTransition { from, to } => {
                write!(f, "maintenance cannot go from {} to {}", from.as_str(), to.as_str())
            }
            EngineError::CategoryInUse(id) => {
                write!(f, "cannot delete category {id}: items still reference it")
            }
            EngineError::ItemInUse(id) => {
                write!(f, "cannot delete item {id}: live reservations or maintenance exist")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Invariant(msg) => write!(f, "internal invariant violated: {msg}"),
            EngineError::Wal(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
