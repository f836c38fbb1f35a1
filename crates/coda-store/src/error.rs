use thiserror::Error;

/// Storage failures callers can match on.
///
/// The `Closed` display string deliberately contains "closed": the agent
/// loop's write finalizer swallows persistence errors whose message contains
/// that word so a shutdown race never turns into a crash.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is closed")]
    Closed,

    #[error("database busy after {0} attempts")]
    Busy(usize),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store task failed: {0}")]
    Task(String),

    #[error("secret cipher error: {0}")]
    Cipher(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
