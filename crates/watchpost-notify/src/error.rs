use std::time::Duration;

use thiserror::Error;

pub type NotifyResult<T> = Result<T, NotifyError>;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid webhook: {0}")]
    Invalid(String),

    #[error("connection to {target} failed: {reason}")]
    Connect { target: String, reason: String },

    #[error("tls error: {0}")]
    Tls(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("webhook responded with status {0}")]
    Status(u16),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}
