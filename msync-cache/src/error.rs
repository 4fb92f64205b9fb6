use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache file corrupted: {0}")]
    Corrupted(String),

    #[error("cache file is stale, reset_id does not match current file_seq")]
    Stale,

    #[error("cache file locked by another writer")]
    Busy,

    #[error("transient I/O failure: {0}")]
    Transient(String),

    #[error("field not found: {0}")]
    NotFound(String),
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::Transient(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
