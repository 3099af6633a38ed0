// ==================== CONFIGURATION ====================

/// Tickets granted for each verified task
/// Reconciliation enforces tickets == verified_tasks × this
pub const TICKETS_PER_VERIFIED_TASK: u32 = 2;

/// From address the mail worker sends as
pub const EMAIL_SENDER: &str = "Raffles <raffles@noreply.app>";

/// Send attempts before an email is dead-lettered
pub const MAX_EMAIL_ATTEMPTS: u8 = 5;

/// Sent emails and dead letters are kept this long for auditing
pub const EMAIL_RETENTION_DAYS: i64 = 7;

/// How often the outbox cleanup reducer runs (seconds)
pub const OUTBOX_CLEANUP_INTERVAL_SECS: u64 = 60 * 60;

/// Input limits
pub const MAX_DISPLAY_NAME_LEN: usize = 64;
pub const MAX_TITLE_LEN: usize = 120;
pub const MAX_TASK_TYPE_LEN: usize = 32;
pub const MAX_USERNAME_LEN: usize = 64;

pub const MICROS_PER_MINUTE: i64 = 60 * 1_000_000;
pub const MICROS_PER_DAY: i64 = 24 * 60 * MICROS_PER_MINUTE;
