use crate::model::Ms;

// Hard input bounds. Requests past these are rejected up front so a single
// client cannot grow a school's state or the WAL without bound.

/// 2000-01-01T00:00:00Z. Nothing in this system predates the school.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Longest contiguous run of 20-minute slots in one booking (4 hours).
pub const MAX_SLOTS_PER_BOOKING: usize = 12;

/// Widest availability query window (31 days).
pub const MAX_QUERY_WINDOW_MS: Ms = 31 * 24 * 3_600_000;

/// Widest single blackout or busy period (31 days).
pub const MAX_SPAN_DURATION_MS: Ms = 31 * 24 * 3_600_000;

pub const MAX_IDENTIFIER_LEN: usize = 254; // RFC 5321 mailbox ceiling
pub const MAX_LOCATION_LEN: usize = 120;
pub const MAX_COMMENT_LEN: usize = 2000;
pub const MAX_TOPIC_LEN: usize = 200;
pub const MAX_REASON_LEN: usize = 500;
pub const MAX_PREP_MATERIALS: usize = 10;
pub const MAX_PREP_URL_LEN: usize = 2048;

pub const MAX_RESOURCES_PER_SCHOOL: usize = 10_000;
pub const MAX_ENTRIES_PER_RESOURCE: usize = 100_000;
pub const MAX_BLACKOUTS: usize = 1_000;

pub const MAX_QUOTA_LIMIT: u32 = 100;

pub const MAX_SCHOOLS: usize = 256;
pub const MAX_SCHOOL_NAME_LEN: usize = 256;
