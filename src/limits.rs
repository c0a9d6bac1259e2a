use crate::model::Ms;

/// 2000-01-01T00:00:00Z.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// Longest single observation window: 31 days.
pub const MAX_WINDOW_DURATION_MS: Ms = 31 * 24 * 3_600_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TENANT_NAME_LEN: usize = 256;
pub const MAX_TENANTS: usize = 64;
pub const MAX_TELESCOPES_PER_TENANT: usize = 1_024;
pub const MAX_USERS_PER_TENANT: usize = 100_000;
pub const MAX_APPOINTMENTS_PER_TELESCOPE: usize = 100_000;
pub const MAX_COORDINATES_PER_APPOINTMENT: usize = 4_096;
pub const MAX_ROLES_PER_USER: usize = 8;
