//! # linkdrop Registry
//!
//! Server-side identity and link-code registry for linkdrop.
//!
//! This crate provides:
//! - Issuance of opaque client identity pairs (private secret + public handle)
//! - Short, single-use link codes bound to a public identity
//! - The [`RegistryStore`] capability the registry is built on, plus an
//!   in-memory implementation with TTL expiry
//!
//! ## Single-use guarantee
//!
//! Resolving a link code is an atomic get-and-delete on the underlying store.
//! The registry performs no locking of its own: the store's atomicity is the
//! only thing standing between two concurrent resolvers.
//!
//! ## Example
//!
//! ```rust,no_run
//! use linkdrop_registry::{LinkRegistry, MemoryRegistryStore, RegistryConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), linkdrop_registry::RegistryError> {
//! let registry = LinkRegistry::new(Arc::new(MemoryRegistryStore::new()), RegistryConfig::default());
//! let alice = registry.create_identity().await?;
//! let code = registry.issue_link_code(&alice.public_id).await?;
//! assert_eq!(registry.resolve_link_code(code.as_str()).await?, alice.public_id);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod code;
pub mod error;
pub mod identity;
pub mod registry;
pub mod store;

pub use code::LinkCode;
pub use error::{RegistryError, Result};
pub use identity::{ClientIdentity, PrivateId, PublicId};
pub use registry::{LinkRegistry, RegistryConfig};
pub use store::{MemoryRegistryStore, RegistryStore};

/// Default link code lifetime in seconds (10 minutes)
pub const DEFAULT_LINK_CODE_TTL_SECS: u64 = 600;

/// Length of a link code in characters
pub const LINK_CODE_LEN: usize = 4;
