//! Client identity types
//!
//! A linkdrop client is identified by two opaque strings:
//! - **Private id**: a high-entropy secret known only to its owner. It
//!   authenticates the client to the registry and the relay.
//! - **Public id**: a shareable handle. It is the relay address of the client
//!   and the key under which other clients record it as a trusted peer.
//!
//! # Example
//!
//! ```
//! use linkdrop_registry::ClientIdentity;
//!
//! let identity = ClientIdentity::generate();
//! assert_eq!(identity.private_id.as_str().len(), 64);
//! assert_ne!(identity.private_id.as_str(), identity.public_id.as_str());
//! ```

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of random bytes behind a private id
const PRIVATE_ID_BYTES: usize = 32;

/// Shareable client handle (relay address, trust-record key)
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicId(String);

impl PublicId {
    /// Wrap an existing public id string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random public id (UUID v4)
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }
}

impl fmt::Display for PublicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PublicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicId({})", self.short())
    }
}

impl From<&str> for PublicId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Owner-only client secret
///
/// `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrivateId(String);

impl PrivateId {
    /// Wrap an existing private id string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh private id from 32 bytes of OS randomness
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; PRIVATE_ID_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Borrow the secret as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PrivateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateId(..)")
    }
}

/// A client's identity pair
///
/// Created once per client and never mutated afterwards.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientIdentity {
    /// Owner-only secret
    pub private_id: PrivateId,
    /// Shareable handle
    pub public_id: PublicId,
}

impl ClientIdentity {
    /// Generate a random identity pair
    #[must_use]
    pub fn generate() -> Self {
        Self {
            private_id: PrivateId::generate(),
            public_id: PublicId::generate(),
        }
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("public_id", &self.public_id.short())
            .finish_non_exhaustive()
    }
}
