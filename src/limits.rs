use std::time::Duration;

/// Reservation length bounds, in whole weeks.
pub const MIN_WEEKS: u32 = 1;
pub const MAX_WEEKS: u32 = 8;

/// Attempts an admission makes against a conflicting concurrent writer before giving up.
pub const MAX_ADMISSION_ATTEMPTS: u32 = 5;

/// Attempts a reconciliation makes on write conflicts before surfacing the conflict.
pub const MAX_RECONCILE_ATTEMPTS: u32 = 3;

/// Controller retry backoff for failed reconciliations.
pub const BACKOFF_BASE: Duration = Duration::from_millis(100);
pub const BACKOFF_MAX: Duration = Duration::from_secs(300);

pub const MIN_PRIORITY: i32 = 0;
pub const MAX_PRIORITY: i32 = 5;

pub const MAX_NAME_LEN: usize = 253;
pub const MAX_TITLE_LEN: usize = 512;
pub const MAX_TEXT_LEN: usize = 8192;
pub const MAX_LIST_LEN: usize = 64;
pub const MAX_RESERVATIONS_PER_WISH: usize = 10_000;

/// Broadcast buffer for each namespace's watch feed.
pub const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// Longest the controller sleeps on a single wake; longer waits are re-derived
/// on the next pass.
pub const MAX_REQUEUE: Duration = Duration::from_secs(24 * 3600);

/// Shortest wake the reconciler asks for. A deadline landing exactly on the
/// pass's clock reading still needs one more pass just after it.
pub const MIN_WAKE: Duration = Duration::from_millis(1);

/// Largest WAL payload accepted on replay; a longer length prefix is treated
/// as a torn tail rather than allocated.
pub const MAX_WAL_RECORD: usize = 16 * 1024 * 1024;
