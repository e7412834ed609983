use policy::Id;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown or inactive user: {0}")]
    UnknownUser(Id),

    #[error(transparent)]
    Storage(#[from] storage::Error),

    #[error(transparent)]
    Policy(#[from] policy::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
