//! Persistent client profile.
//!
//! The profile is everything a client keeps across restarts: its display
//! name, its identity pair and its trusted-peer records.

use crate::error::Result;
use async_trait::async_trait;
use linkdrop_registry::{ClientIdentity, PublicId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Display name used until the user picks one
pub const DEFAULT_DISPLAY_NAME: &str = "Anonymous Client";

/// A remote client this client accepts messages from without a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedPeer {
    /// The peer's public id
    pub public_id: PublicId,
    /// Name the peer reported for itself
    pub name: String,
    /// Local-only alias
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// When the handshake completed (ms since the Unix epoch)
    pub connected_at: u64,
}

impl TrustedPeer {
    /// Alias if set, otherwise the self-reported name
    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Everything a client persists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientProfile {
    /// Self-reported display name
    pub name: String,
    /// Identity pair, once created
    #[serde(default)]
    pub identity: Option<ClientIdentity>,
    /// Trusted peers, most recently connected first
    #[serde(default)]
    pub peers: Vec<TrustedPeer>,
}

impl Default for ClientProfile {
    fn default() -> Self {
        Self {
            name: DEFAULT_DISPLAY_NAME.to_string(),
            identity: None,
            peers: Vec::new(),
        }
    }
}

/// Profile persistence capability
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Load the stored profile, `None` if nothing was saved yet
    async fn load(&self) -> Result<Option<ClientProfile>>;

    /// Replace the stored profile
    async fn save(&self, profile: &ClientProfile) -> Result<()>;
}

/// Profile kept in memory only
#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    profile: Mutex<Option<ClientProfile>>,
}

impl MemoryProfileStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `profile`
    pub fn with_profile(profile: ClientProfile) -> Self {
        Self {
            profile: Mutex::new(Some(profile)),
        }
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn load(&self) -> Result<Option<ClientProfile>> {
        Ok(self.profile.lock().await.clone())
    }

    async fn save(&self, profile: &ClientProfile) -> Result<()> {
        *self.profile.lock().await = Some(profile.clone());
        Ok(())
    }
}

/// Profile stored as a JSON file
#[derive(Debug)]
pub struct JsonProfileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonProfileStore {
    /// Store the profile at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Location of the profile file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ProfileStore for JsonProfileStore {
    async fn load(&self) -> Result<Option<ClientProfile>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, profile: &ClientProfile) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_string_pretty(profile)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!("Saved profile to {}", self.path.display());
        Ok(())
    }
}
