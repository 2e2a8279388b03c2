//! HTTP executor error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("API token not set: export {0}")]
    MissingToken(String),

    #[error("Invalid API settings: {0}")]
    InvalidSettings(String),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, HttpError>;
