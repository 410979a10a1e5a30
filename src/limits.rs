//! Hard limits on request sizes and stored state.

/// Max length of names and short text fields (contact name, location, speaker, category).
pub const MAX_NAME_LEN: usize = 200;

/// Max length of a contact phone number.
pub const MAX_PHONE_LEN: usize = 32;

/// Max length of free text (descriptions, purpose, admin notes).
pub const MAX_TEXT_LEN: usize = 10_000;

/// Max length of a user id taken from the connection.
pub const MAX_USER_ID_LEN: usize = 128;

/// Max visitors a single appointment may bring.
pub const MAX_VISITOR_COUNT: u32 = 500;

/// Max configured time slots in the daily schedule.
pub const MAX_TIME_SLOTS: usize = 96;

/// Max activities held by one engine.
pub const MAX_ACTIVITIES: usize = 100_000;

/// Max appointments held by one engine.
pub const MAX_APPOINTMENTS: usize = 5_000_000;

/// Max booking horizon accepted from configuration, in days.
pub const MAX_BOOKING_HORIZON_DAYS: i64 = 366;

/// Max rows returned by a single list query.
pub const MAX_LIST_ROWS: usize = 10_000;
