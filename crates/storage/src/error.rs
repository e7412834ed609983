use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("row decoding error: {0}")]
    Decode(#[from] serde_rusqlite::Error),

    /// A stored value that no longer decodes to its model type.
    #[error("invalid stored data: {0}")]
    InvalidData(String),

    #[error("store connection lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Policy(#[from] policy::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;
