use thiserror::Error;

/// Errors returned by raffle reducers
///
/// Reducers hand these back to the host as `Err(String)`, which aborts the
/// transaction and surfaces the message to the HTTP caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RaffleError {
    /// Caller is neither an authorized worker nor an admin
    #[error("Unauthorized: admin role required")]
    Unauthorized,

    #[error("Raffle {0} not found")]
    RaffleNotFound(u64),

    #[error("Raffle {0} is not active")]
    RaffleInactive(u64),

    #[error("Raffle {0} already has a winner")]
    WinnerAlreadySelected(u64),

    #[error("Raffle {0} has no entries")]
    NoEntries(u64),

    #[error("Task {0} not found")]
    TaskNotFound(u64),

    #[error("Task {0} has already been reviewed")]
    TaskAlreadyReviewed(u64),

    #[error("Task '{task_type}' already submitted for raffle {raffle_id}")]
    DuplicateTask { raffle_id: u64, task_type: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Malformed import data; the whole restore is rolled back
    #[error("Restore failed: {0}")]
    Restore(String),
}

impl RaffleError {
    /// Coarse class used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            RaffleError::Unauthorized => "authorization",
            RaffleError::Restore(_) => "persistence",
            _ => "precondition",
        }
    }
}

/// Log a rejected reducer call and convert the error for the host
pub(crate) fn reject(tag: &str, reducer: &str, err: RaffleError) -> String {
    log::warn!("[{}] {} rejected kind:{} error:{}", tag, reducer, err.kind(), err);
    err.to_string()
}
