use thiserror::Error;

#[derive(Error, Debug)]
pub enum DsyncError {
    #[error("tree corrupted: {0}")]
    Corrupted(String),

    #[error("changes raced during sync, retry with a regressed last_common_uid")]
    ChangesDuringSync,

    #[error("node not found: {0}")]
    NotFound(String),

    #[error("transient failure: {0}")]
    Transient(String),
}

pub type Result<T> = std::result::Result<T, DsyncError>;
