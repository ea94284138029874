//! Client configuration

use crate::error::{ClientError, Result};
use linkdrop_files::StorageConfig;
use std::borrow::Cow;
use std::time::Duration;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Display name announced during handshakes and identity queries.
    ///
    /// Overrides the persisted profile name when set.
    pub display_name: Option<String>,

    /// Dispatcher configuration
    pub dispatch: DispatchConfig,

    /// Transfer configuration
    pub transfer: TransferConfig,

    /// Storage configuration for received files
    pub storage: StorageConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            display_name: None,
            dispatch: DispatchConfig::default(),
            transfer: TransferConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Check every section.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidConfig`] naming the first bad value.
    pub fn validate(&self) -> Result<()> {
        self.dispatch.validate()?;
        self.transfer.validate()?;
        self.storage
            .validate()
            .map_err(|e| ClientError::InvalidConfig(Cow::Owned(e.to_string())))
    }
}

/// Message dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Timeout for correlated replies (handshake, identity, list)
    pub response_timeout: Duration,

    /// Buffer of the all-messages subscriber channel
    pub event_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(10),
            event_capacity: 256,
        }
    }
}

impl DispatchConfig {
    fn validate(&self) -> Result<()> {
        if self.response_timeout.is_zero() {
            return Err(ClientError::InvalidConfig(Cow::Borrowed(
                "response_timeout must be non-zero",
            )));
        }
        if self.event_capacity == 0 {
            return Err(ClientError::InvalidConfig(Cow::Borrowed(
                "event_capacity must be non-zero",
            )));
        }
        Ok(())
    }
}

/// File transfer configuration
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Bytes per data channel message
    pub chunk_size: usize,

    /// Pause sending once this many bytes are buffered
    pub max_buffered: usize,

    /// Resume sending once the buffer drains to this level
    pub low_watermark: usize,

    /// Simultaneous file transfers per peer
    pub max_concurrent: usize,

    /// A receiving channel idle for this long is failed
    pub idle_timeout: Duration,

    /// An accepted file whose channel has not opened by then is failed
    pub open_timeout: Duration,

    /// Negotiation restarts before a failed link is torn down
    pub max_restarts: u32,

    /// Answer every send-request by accepting all offered files
    pub auto_accept: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            max_buffered: crate::DEFAULT_MAX_BUFFERED,
            low_watermark: crate::DEFAULT_LOW_WATERMARK,
            max_concurrent: 3,
            idle_timeout: Duration::from_secs(30),
            open_timeout: Duration::from_secs(30),
            max_restarts: 2,
            auto_accept: true,
        }
    }
}

impl TransferConfig {
    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(ClientError::InvalidConfig(Cow::Borrowed(
                "chunk_size must be non-zero",
            )));
        }
        if self.low_watermark >= self.max_buffered {
            return Err(ClientError::InvalidConfig(Cow::Owned(format!(
                "low_watermark ({}) must be below max_buffered ({})",
                self.low_watermark, self.max_buffered
            ))));
        }
        if self.max_concurrent == 0 {
            return Err(ClientError::InvalidConfig(Cow::Borrowed(
                "max_concurrent must be at least 1",
            )));
        }
        if self.idle_timeout.is_zero() || self.open_timeout.is_zero() {
            return Err(ClientError::InvalidConfig(Cow::Borrowed(
                "transfer timeouts must be non-zero",
            )));
        }
        Ok(())
    }
}
