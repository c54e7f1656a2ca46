use thiserror::Error;
use watchpost_core::CheckKey;

pub type CheckerResult<T> = Result<T, CheckerError>;

#[derive(Debug, Error)]
pub enum CheckerError {
    #[error("invalid check {key}: {reason}")]
    InvalidCheck { key: CheckKey, reason: String },

    #[error("check {0} is already running")]
    Duplicate(CheckKey),
}
