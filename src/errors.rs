use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarmonyError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Crypto error: {0}")]
    Crypto(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("cancelled")]
    Cancelled,
}

impl HarmonyError {
    /// Cancellation is cooperative and silent; callers use this to tell it
    /// apart from real failures.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, HarmonyError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, HarmonyError>;
