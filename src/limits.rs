//! Input bounds enforced before anything touches the ledger.

/// Longest accepted venue identifier, in bytes.
pub const MAX_VENUE_ID_LEN: usize = 128;

/// Longest accepted block label, in bytes.
pub const MAX_LABEL_LEN: usize = 512;

/// Upper bound on stored intervals for a single venue.
pub const MAX_INTERVALS_PER_VENUE: usize = 10_000;

/// Upper bound on distinct venues tracked by one ledger.
pub const MAX_VENUES: usize = 100_000;

/// Widest single block, in days (inclusive count).
pub const MAX_BLOCK_DAYS: i64 = 731;

/// Widest window accepted by range queries, in days (inclusive count).
pub const MAX_QUERY_WINDOW_DAYS: i64 = 3_660;

/// Calendar years outside this range are rejected.
pub const MIN_VALID_YEAR: i32 = 1970;
pub const MAX_VALID_YEAR: i32 = 9999;

/// Rows accepted in one multi-row INSERT.
pub const MAX_BATCH_SIZE: usize = 1_000;
