//! Errors raised while loading the `taskboard` TOML config
//!
//! Reading the file, parsing it, and validating the merged result (file plus
//! env overlays) each map to one variant. API and credential failures have
//! their own error types in `api-client` and `session-auth`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result of loading or validating config
pub type Result<T> = std::result::Result<T, Error>;
