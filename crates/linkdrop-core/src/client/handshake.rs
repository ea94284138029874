//! Trust handshake, disconnect and identity queries.
//!
//! The client that issues a link code is the responder. The client that
//! resolves it sends a connection request carrying the code and waits for the
//! issuer's response; each side then records the other as a trusted peer.
//! Trust is kept independently on each side and may briefly diverge after a
//! one-sided disconnect.

use super::client::Client;
use super::events::ClientEvent;
use super::profile::TrustedPeer;
use super::trust::TokenKind;
use crate::error::{ClientError, Result};
use crate::protocol::{ControlMessage, MessageType, NamePayload};
use linkdrop_registry::{LinkCode, PublicId};
use rand::Rng;
use std::borrow::Cow;
use std::sync::PoisonError;
use std::time::{SystemTime, UNIX_EPOCH};

/// Alphabet of share-path codes
const SHARE_CODE_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Render `value` in lowercase base 36
fn base36(mut value: u32) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(SHARE_CODE_ALPHABET[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

/// Split a `{publicId}/{code}` share path.
///
/// # Errors
///
/// Returns [`ClientError::Invalid`] if either part is missing or the code is
/// not lowercase alphanumeric.
pub fn parse_share_path(path: &str) -> Result<(PublicId, String)> {
    let invalid = || ClientError::Invalid(Cow::Owned(format!("malformed share path: {path}")));
    let (id, code) = path.trim().split_once('/').ok_or_else(invalid)?;
    if id.is_empty()
        || code.is_empty()
        || !code
            .bytes()
            .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase())
    {
        return Err(invalid());
    }
    Ok((PublicId::new(id), code.to_string()))
}

// ═══════════════════════════════════════════════════════════════════════════
// Handshake
// ═══════════════════════════════════════════════════════════════════════════

impl Client {
    /// Issue a link code for this client and start accepting it.
    ///
    /// The code is honored for exactly one connection request.
    ///
    /// # Errors
    ///
    /// Fails if the registry does not know this client or cannot store the
    /// code.
    pub async fn create_link_code(&self) -> Result<LinkCode> {
        let code = self
            .inner
            .registry
            .link_code_for_client(&self.inner.identity.private_id)
            .await?;
        self.inner.trust.add_token(code.as_str(), TokenKind::LinkCode);
        tracing::info!("Issued link code {}", code.as_str());
        Ok(code)
    }

    /// Complete a handshake with the issuer of `code`.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Invalid`] for a malformed code
    /// - [`ClientError::InvalidState`] for this client's own code
    /// - [`ClientError::NotFound`] for an unknown, expired or used code
    /// - [`ClientError::Timeout`] if the issuer does not answer
    pub async fn connect(&self, code: &str) -> Result<TrustedPeer> {
        let code = LinkCode::parse(code.trim())?;
        if self.inner.trust.token_kind(code.as_str()) == Some(TokenKind::LinkCode) {
            return Err(ClientError::invalid_state("cannot connect with own link code"));
        }

        let remote = self.inner.registry.resolve_link_code(code.as_str()).await?;
        if &remote == self.public_id() {
            return Err(ClientError::invalid_state("cannot connect with own link code"));
        }

        self.inner.trust.add_token(code.as_str(), TokenKind::LinkCode);
        let result = self.exchange_names(&remote, &code).await;
        self.inner.trust.remove_token(code.as_str());

        let name = result?;
        tracing::info!("Handshake with {} ({}) complete", remote.short(), name);
        Ok(self.add_trusted_peer(remote, name).await)
    }

    async fn exchange_names(&self, remote: &PublicId, code: &LinkCode) -> Result<String> {
        let request = ControlMessage::new(MessageType::ConnectionRequest, remote.clone())
            .with_auth(code.as_str())
            .with_data(&NamePayload { name: self.name() })?;

        let expected = remote.clone();
        let token = code.as_str().to_string();
        let reply = self
            .inner
            .dispatcher
            .request(
                request,
                MessageType::ConnectionResponse,
                move |m| {
                    m.client_id == expected && m.authentication.as_deref() == Some(token.as_str())
                },
                self.inner.config.dispatch.response_timeout,
            )
            .await?;

        let NamePayload { name } = reply.payload()?;
        Ok(name)
    }

    pub(crate) async fn on_connection_request(&self, message: ControlMessage) {
        let consumed = message
            .authentication
            .as_deref()
            .is_some_and(|token| self.inner.trust.take_token(token, TokenKind::LinkCode));
        if !consumed && !self.is_trusted(&message.client_id) {
            tracing::warn!(
                "Connection request from {} without a link code",
                message.client_id.short()
            );
            return;
        }

        let NamePayload { name } = match message.payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Bad connection request from {}: {}", message.client_id.short(), e);
                return;
            }
        };

        let response = ControlMessage::new(MessageType::ConnectionResponse, message.client_id.clone())
            .with_optional_auth(message.authentication.clone())
            .with_data(&NamePayload { name: self.name() });
        match response.and_then(|r| self.inner.dispatcher.send(r)) {
            Ok(()) => {
                tracing::info!("Accepted connection from {} ({})", message.client_id.short(), name);
                self.add_trusted_peer(message.client_id, name).await;
            }
            Err(e) => tracing::warn!("Failed to answer connection request: {}", e),
        }
    }

    /// Record `remote` as trusted, keeping any local alias.
    async fn add_trusted_peer(&self, remote: PublicId, name: String) -> TrustedPeer {
        let alias = self.inner.trust.peer(&remote).and_then(|p| p.alias);
        let peer = TrustedPeer {
            public_id: remote,
            name,
            alias,
            connected_at: now_millis(),
        };
        self.inner.trust.trust(peer.clone());
        self.persist().await;
        self.emit(ClientEvent::PeerConnected(peer.clone()));
        peer
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Disconnect & Peer Records
// ═══════════════════════════════════════════════════════════════════════════

impl Client {
    /// Stop trusting `peer`, optionally asking it to forget us too.
    ///
    /// Always succeeds locally. Any live session with the peer is closed.
    ///
    /// # Errors
    ///
    /// Only fails if the notification cannot be queued (client shut down);
    /// the local removal has happened regardless.
    pub async fn disconnect(&self, peer: &PublicId, notify: bool) -> Result<()> {
        let sent = if notify {
            self.inner
                .dispatcher
                .send(ControlMessage::new(MessageType::Disconnect, peer.clone()))
        } else {
            Ok(())
        };
        self.forget_peer(peer).await;
        sent
    }

    /// Drop trust, session and offers of `peer`
    async fn forget_peer(&self, peer: &PublicId) {
        let known = self.inner.trust.forget(peer).is_some();
        self.reset_session(peer).await;
        self.inner.remote_offers.remove(peer);
        if known {
            self.persist().await;
            self.emit(ClientEvent::PeerDisconnected(peer.clone()));
            tracing::info!("Disconnected from {}", peer.short());
        }
    }

    pub(crate) async fn on_disconnect(&self, message: ControlMessage) {
        // Gated, so the sender is still trusted or holds a token
        self.forget_peer(&message.client_id).await;
    }

    /// Set or clear the local alias of a trusted peer.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotFound`] if `peer` is not trusted.
    pub async fn rename_peer(&self, peer: &PublicId, alias: Option<String>) -> Result<()> {
        let alias = alias.map(|a| a.trim().to_string()).filter(|a| !a.is_empty());
        if !self.inner.trust.rename(peer, alias) {
            return Err(ClientError::NotFound(Cow::Owned(format!(
                "no trusted peer {}",
                peer.short()
            ))));
        }
        self.persist().await;
        Ok(())
    }

    /// Change this client's display name.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Invalid`] for an empty name.
    pub async fn set_name(&self, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ClientError::Invalid(Cow::Borrowed("display name is empty")));
        }
        *self
            .inner
            .name
            .write()
            .unwrap_or_else(PoisonError::into_inner) = name.to_string();
        self.persist().await;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Identity Queries
// ═══════════════════════════════════════════════════════════════════════════

impl Client {
    /// Ask `peer` for its display name.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Timeout`] if `peer` does not answer; requests
    /// that fail authentication are never answered.
    pub async fn identify(&self, peer: &PublicId, token: Option<String>) -> Result<String> {
        let request =
            ControlMessage::new(MessageType::IdentityRequest, peer.clone()).with_optional_auth(token);
        let expected = peer.clone();
        let reply = self
            .inner
            .dispatcher
            .request(
                request,
                MessageType::IdentityResponse,
                move |m| m.client_id == expected,
                self.inner.config.dispatch.response_timeout,
            )
            .await?;
        let NamePayload { name } = reply.payload()?;
        Ok(name)
    }

    pub(crate) async fn on_identity_request(&self, message: ControlMessage) {
        let response = ControlMessage::new(MessageType::IdentityResponse, message.client_id)
            .with_data(&NamePayload { name: self.name() });
        if let Err(e) = response.and_then(|r| self.inner.dispatcher.send(r)) {
            tracing::warn!("Failed to answer identity request: {}", e);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Share Paths
// ═══════════════════════════════════════════════════════════════════════════

impl Client {
    /// Create a `{publicId}/{code}` share path.
    ///
    /// Anyone holding the path may list and request this client's shared
    /// files until it is revoked. It never grants a handshake.
    pub fn share_path(&self) -> String {
        let code = base36(rand::thread_rng().r#gen());
        self.inner.trust.add_token(code.as_str(), TokenKind::SharePath);
        format!("{}/{}", self.public_id(), code)
    }

    /// Revoke a share path created by [`Client::share_path`]; false if it
    /// was not live.
    pub fn revoke_share_path(&self, path: &str) -> bool {
        match parse_share_path(path) {
            Ok((id, code)) if &id == self.public_id() => {
                self.inner.trust.take_token(&code, TokenKind::SharePath)
            }
            _ => false,
        }
    }
}
