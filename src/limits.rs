//! Input-size and range limits. Oversized input is rejected with
//! `EngineError::LimitExceeded` before it reaches the WAL.

pub const MAX_NAME_LEN: usize = 120;
pub const MAX_DESCRIPTION_LEN: usize = 2_000;
pub const MAX_CONDITION_LEN: usize = 50;
pub const MAX_USERNAME_LEN: usize = 64;

/// Widest bookable range, inclusive days.
pub const MAX_RANGE_DAYS: i64 = 366;

pub const MAX_LINE_ITEMS: usize = 32;
pub const MAX_QUANTITY: u32 = 1_000;

pub const MAX_ITEMS: usize = 100_000;
pub const MAX_CATEGORIES: usize = 10_000;
pub const MAX_PROFILES: usize = 1_000_000;

/// Longest accepted protocol line (bytes).
pub const MAX_WIRE_LINE_LEN: usize = 64 * 1024;
