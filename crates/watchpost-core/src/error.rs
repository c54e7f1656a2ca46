//! Configuration error types.

use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating a config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("'db' must be specified in the config file")]
    MissingDb,

    #[error("config file contains no services")]
    NoServices,

    #[error("empty service '{0}' defined in config")]
    EmptyService(String),

    #[error("check #{index} in service '{service}': {reason}")]
    InvalidCheck {
        service: String,
        index: usize,
        reason: String,
    },

    #[error("invalid webhook: {0}")]
    InvalidWebhook(String),

    #[error("invalid duration '{0}'")]
    InvalidDuration(String),

    #[error("unrecognized log level: '{0}'")]
    InvalidLogLevel(String),
}
