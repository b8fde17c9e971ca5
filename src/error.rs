//! Error types for canopy_db

use thiserror::Error;

/// Result type alias for canopy_db operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in canopy_db operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Tree is empty")]
    EmptyTree,

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid database file: {0}")]
    InvalidFile(String),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Construction error: {0}")]
    Construction(String),
}

impl Error {
    /// Build a `KeyNotFound` error for a raw key, rendering it as UTF-8
    /// when possible and hex otherwise.
    pub(crate) fn key_not_found(key: &[u8]) -> Self {
        match std::str::from_utf8(key) {
            Ok(s) => Error::KeyNotFound(s.to_string()),
            Err(_) => Error::KeyNotFound(hex::encode(key)),
        }
    }
}
