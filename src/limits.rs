//! Hard limits and fixed policy constants.

use crate::model::Ms;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

pub const MAX_BOOKING_DURATION_MS: Ms = DAY_MS;
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;

pub const MAX_DURATION_MINUTES: u32 = 24 * 60;
pub const MAX_NOTICE_HOURS: u32 = 24 * 365;
pub const MAX_DAYS_AHEAD: u32 = 365;

pub const DEFAULT_MIN_NOTICE_HOURS: u32 = 24;
pub const DEFAULT_MAX_DAYS_AHEAD: u32 = 30;

/// Guests may cancel through the public link until this many calendar days
/// before the booking's local start.
pub const CANCEL_NOTICE_DAYS: u64 = 3;

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_GUEST_NAME_LEN: usize = 200;
pub const MAX_LOCATION_LEN: usize = 500;
pub const MAX_URL_LEN: usize = 2048;
pub const MAX_SLUG_LEN: usize = 64;

pub const SLUG_PREFIX_LEN: usize = 10;
pub const SLUG_SUFFIX_LEN: usize = 6;
pub const MAX_SLUG_ATTEMPTS: usize = 10;

pub const MAX_PAGES_PER_TENANT: usize = 100_000;
pub const MAX_BOOKINGS_PER_OWNER: usize = 200_000;
pub const MAX_NOTIFICATIONS_PER_OWNER: usize = 200_000;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;
