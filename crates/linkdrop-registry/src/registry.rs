//! Identity and link-code registry.
//!
//! # Link Flow
//!
//! ```text
//! Issuer (A)                Registry                 Resolver (B)
//!     |                         |                         |
//!     |-- issue_link_code ----->|                         |
//!     |<------ "7K4X" ----------|                         |
//!     |                         |                         |
//!     |   ...code shared out of band...                   |
//!     |                         |                         |
//!     |                         |<-- resolve("7K4X") -----|
//!     |                         |--- A's public id ------>|
//!     |                         |   (code deleted)        |
//! ```

use crate::code::LinkCode;
use crate::error::{RegistryError, Result};
use crate::identity::{ClientIdentity, PrivateId, PublicId};
use crate::store::RegistryStore;
use std::sync::Arc;
use std::time::Duration;

const PUBLIC_ID_FIELD: &str = "publicId";

fn client_key(private_id: &PrivateId) -> String {
    format!("client:{}", private_id.as_str())
}

fn link_code_key(code: &LinkCode) -> String {
    format!("linkcode:{}", code.as_str())
}

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Lifetime of a freshly issued link code
    pub link_code_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            link_code_ttl: Duration::from_secs(crate::DEFAULT_LINK_CODE_TTL_SECS),
        }
    }
}

/// Server-side identity and link-code registry
///
/// Stateless apart from its store; clone the `Arc` to share it.
pub struct LinkRegistry {
    store: Arc<dyn RegistryStore>,
    config: RegistryConfig,
}

impl LinkRegistry {
    /// Create a registry over the given store
    pub fn new(store: Arc<dyn RegistryStore>, config: RegistryConfig) -> Self {
        Self { store, config }
    }

    /// Registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Generate and persist a new identity pair.
    ///
    /// # Errors
    ///
    /// Fails only when the store is unavailable.
    pub async fn create_identity(&self) -> Result<ClientIdentity> {
        let identity = ClientIdentity::generate();
        self.store
            .hset(
                &client_key(&identity.private_id),
                PUBLIC_ID_FIELD,
                identity.public_id.as_str(),
            )
            .await?;

        tracing::info!("Created client identity {}", identity.public_id.short());
        Ok(identity)
    }

    /// Look up the identity owning a private id.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownClient`] if no client owns the id.
    pub async fn lookup_by_private_id(&self, private_id: &PrivateId) -> Result<ClientIdentity> {
        let public_id = self
            .store
            .hget(&client_key(private_id), PUBLIC_ID_FIELD)
            .await?
            .ok_or(RegistryError::UnknownClient)?;

        Ok(ClientIdentity {
            private_id: private_id.clone(),
            public_id: PublicId::new(public_id),
        })
    }

    /// Issue a link code for a public id with the configured TTL.
    pub async fn issue_link_code(&self, public_id: &PublicId) -> Result<LinkCode> {
        self.issue_link_code_with_ttl(public_id, self.config.link_code_ttl)
            .await
    }

    /// Issue a link code for a public id with an explicit TTL.
    ///
    /// Collisions with a live code are not checked; the newer binding wins.
    pub async fn issue_link_code_with_ttl(
        &self,
        public_id: &PublicId,
        ttl: Duration,
    ) -> Result<LinkCode> {
        let code = LinkCode::generate();
        self.store
            .set_ex(&link_code_key(&code), public_id.as_str(), ttl)
            .await?;

        tracing::debug!(
            "Issued link code for {} (ttl {}s)",
            public_id.short(),
            ttl.as_secs()
        );
        Ok(code)
    }

    /// Issue a link code on behalf of the client owning `private_id`.
    ///
    /// This is the client-facing entry point: the caller proves ownership of
    /// the public id with its secret.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownClient`] for an unregistered secret.
    pub async fn link_code_for_client(&self, private_id: &PrivateId) -> Result<LinkCode> {
        let identity = self.lookup_by_private_id(private_id).await?;
        self.issue_link_code(&identity.public_id).await
    }

    /// Resolve a link code to the issuer's public id, consuming it.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::InvalidLinkCode`] for malformed input (nothing is
    ///   read or deleted)
    /// - [`RegistryError::LinkCodeNotFound`] when the code was never issued,
    ///   has expired, or was already resolved
    pub async fn resolve_link_code(&self, code: &str) -> Result<PublicId> {
        let code = LinkCode::parse(code)?;
        let public_id = self
            .store
            .get_del(&link_code_key(&code))
            .await?
            .map(PublicId::new)
            .ok_or(RegistryError::LinkCodeNotFound)?;

        tracing::debug!("Resolved link code to {}", public_id.short());
        Ok(public_id)
    }
}
