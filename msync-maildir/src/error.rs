use thiserror::Error;

#[derive(Error, Debug)]
pub enum MaildirError {
    #[error("uid list corrupted: {0}")]
    Corrupted(String),

    #[error("uid list lock is stale or held by another process")]
    Busy,

    #[error("transient I/O failure: {0}")]
    Transient(String),

    #[error("entry not found: {0}")]
    NotFound(String),
}

impl From<std::io::Error> for MaildirError {
    fn from(e: std::io::Error) -> Self {
        MaildirError::Transient(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MaildirError>;
