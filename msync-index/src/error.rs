use thiserror::Error;

/// Error kinds, not one-off messages — callers that need to branch (the
/// sync driver, the importer) match on the variant.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("corrupted index state: {0}")]
    Corrupted(String),

    #[error("stale handle, reopen required")]
    Stale,

    #[error("lock busy")]
    Busy,

    #[error("transient I/O failure: {0}")]
    Transient(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    Denied(String),
}

pub type Result<T> = std::result::Result<T, IndexError>;
