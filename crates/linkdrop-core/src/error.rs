//! Error types for the linkdrop client
//!
//! Errors are categorized to support retry logic and proper error handling.
//!
//! # Error Categories
//!
//! - **Transient**: Temporary failures that may succeed on retry (relay hiccups, link failures)
//! - **Permanent**: Failures that will not succeed without intervention (invalid input, not found)
//! - **Not found**: Unknown client, consumed or expired link code, missing storage entry.
//!   Kept apart from generic failures so callers can report "that code is gone"
//!   instead of "something broke"
//!
//! Every error is scoped to the peer, file or request it concerns; none is
//! fatal to the client.

use crate::link::LinkError;
use linkdrop_files::StorageError;
use linkdrop_registry::RegistryError;
use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur in client operations
#[derive(Debug, Error, Clone)]
pub enum ClientError {
    // ============ Input Errors ============
    /// Malformed input, rejected before any state was touched
    #[error("Invalid input: {0}")]
    Invalid(Cow<'static, str>),

    /// Unknown client, expired link code, missing file entry
    #[error("Not found: {0}")]
    NotFound(Cow<'static, str>),

    // ============ Collaborator Errors ============
    /// Registry failure other than not-found
    #[error("Registry error: {0}")]
    Registry(RegistryError),

    /// Relay rejected the subscription or failed to publish
    #[error("Relay error: {0}")]
    Relay(Cow<'static, str>),

    /// Direct link or data channel failure
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// Local storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    // ============ Protocol Errors ============
    /// Control message payload did not match the expected shape
    #[error("Protocol error: {0}")]
    Protocol(Cow<'static, str>),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    // ============ Configuration & State Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Internal channel closed (client shutting down)
    #[error("Channel error: {0}")]
    Channel(Cow<'static, str>),

    /// File I/O error
    #[error("File I/O error: {0}")]
    Io(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(Cow<'static, str>),
}

impl ClientError {
    /// Returns true if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::Timeout(_)
                | ClientError::Relay(_)
                | ClientError::Link(_)
                | ClientError::Channel(_)
        )
    }

    /// Returns true if this error is permanent and will not succeed on retry
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ClientError::Invalid(_)
                | ClientError::NotFound(_)
                | ClientError::InvalidConfig(_)
                | ClientError::InvalidState(_)
                | ClientError::Protocol(_)
        )
    }

    /// Returns true if this error should trigger an automatic retry
    ///
    /// Timeouts are transient but left to the caller.
    #[must_use]
    pub fn should_retry(&self) -> bool {
        self.is_transient() && !matches!(self, ClientError::Timeout(_))
    }

    /// Returns true for the distinct not-found condition
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }

    /// Returns true for timeouts
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout(_))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        ClientError::Timeout(Cow::Borrowed(context))
    }

    /// Create a protocol error with static context (zero allocation)
    #[must_use]
    pub const fn protocol(context: &'static str) -> Self {
        ClientError::Protocol(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        ClientError::InvalidState(Cow::Borrowed(context))
    }

    /// Create a channel error with static context (zero allocation)
    #[must_use]
    pub const fn channel(context: &'static str) -> Self {
        ClientError::Channel(Cow::Borrowed(context))
    }
}

impl From<RegistryError> for ClientError {
    fn from(err: RegistryError) -> Self {
        if matches!(err, RegistryError::InvalidLinkCode(_)) {
            ClientError::Invalid(Cow::Owned(err.to_string()))
        } else if err.is_not_found() {
            ClientError::NotFound(Cow::Owned(err.to_string()))
        } else {
            ClientError::Registry(err)
        }
    }
}

impl From<StorageError> for ClientError {
    fn from(err: StorageError) -> Self {
        if err.is_not_found() {
            ClientError::NotFound(Cow::Owned(err.to_string()))
        } else {
            ClientError::Storage(err.to_string())
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Serialization(Cow::Owned(err.to_string()))
    }
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
