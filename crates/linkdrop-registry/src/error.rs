//! Error types for the identity and link registry.

use thiserror::Error;

/// Registry errors
///
/// Not-found conditions are kept apart from generic failures so callers can
/// tell "that code was consumed or expired" from "the store is down".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Link code does not match the expected format
    #[error("invalid link code: {0:?}")]
    InvalidLinkCode(String),

    /// Link code unknown, expired, or already consumed
    #[error("link code not found or expired")]
    LinkCodeNotFound,

    /// Private id does not belong to any registered client
    #[error("unknown client")]
    UnknownClient,

    /// Key holds a value of a different kind than the operation expects
    #[error("wrong value type for key {0}")]
    WrongType(String),

    /// Underlying store failure
    #[error("registry store error: {0}")]
    Store(String),
}

impl RegistryError {
    /// Returns true for the distinct "does not exist" conditions
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RegistryError::LinkCodeNotFound | RegistryError::UnknownClient
        )
    }
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;
