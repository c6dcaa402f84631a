/// Capacity of a slot that never had one set.
pub const DEFAULT_SLOT_CAPACITY: u32 = 1;

/// Capacity given to a freshly added slot when the operator names none.
pub const NEW_SLOT_DEFAULT_CAPACITY: u32 = 5;

pub const MAX_SLOT_CAPACITY: u32 = 100;

pub const MAX_PROVIDERS: usize = 10_000;
pub const MAX_SLOTS_PER_PROVIDER: usize = 256;
pub const MAX_BOOKINGS_PER_PROVIDER: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 4096;

/// Widest window accepted by date-range queries.
pub const MAX_DATE_WINDOW_DAYS: u32 = 366;
