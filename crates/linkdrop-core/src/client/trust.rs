//! Trust and authentication state.
//!
//! A message authenticates iff its token is a currently valid ephemeral
//! token or its sender is a trusted peer. Nothing else passes, and failures
//! are never answered.

use super::profile::TrustedPeer;
use crate::dispatcher::Middleware;
use crate::protocol::ControlMessage;
use dashmap::DashMap;
use linkdrop_registry::PublicId;
use std::ops::ControlFlow;
use std::sync::Arc;

/// What an ephemeral token was issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Handshake link code; consumed by the first connection request
    LinkCode,
    /// Share-path code; valid until revoked, never grants a handshake
    SharePath,
}

/// Ephemeral tokens and trusted peers of one client
#[derive(Debug, Default)]
pub struct TrustStore {
    tokens: DashMap<String, TokenKind>,
    peers: DashMap<PublicId, TrustedPeer>,
}

impl TrustStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store trusting `peers`
    pub fn with_peers(peers: impl IntoIterator<Item = TrustedPeer>) -> Self {
        let store = Self::new();
        for peer in peers {
            store.peers.insert(peer.public_id.clone(), peer);
        }
        store
    }

    /// Accept `token` until it is removed
    pub fn add_token(&self, token: impl Into<String>, kind: TokenKind) {
        self.tokens.insert(token.into(), kind);
    }

    /// Stop accepting `token`
    pub fn remove_token(&self, token: &str) -> Option<TokenKind> {
        self.tokens.remove(token).map(|(_, kind)| kind)
    }

    /// Remove `token` only if it is of `kind`; true if it was removed.
    ///
    /// Removal is atomic, so of several concurrent callers at most one wins.
    pub fn take_token(&self, token: &str, kind: TokenKind) -> bool {
        self.tokens.remove_if(token, |_, k| *k == kind).is_some()
    }

    /// Kind of a currently valid token
    pub fn token_kind(&self, token: &str) -> Option<TokenKind> {
        self.tokens.get(token).map(|k| *k)
    }

    /// Number of currently valid tokens
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Trust a peer, replacing any previous record
    pub fn trust(&self, peer: TrustedPeer) {
        self.peers.insert(peer.public_id.clone(), peer);
    }

    /// Stop trusting a peer
    pub fn forget(&self, public_id: &PublicId) -> Option<TrustedPeer> {
        self.peers.remove(public_id).map(|(_, peer)| peer)
    }

    /// Whether `public_id` is trusted
    pub fn is_trusted(&self, public_id: &PublicId) -> bool {
        self.peers.contains_key(public_id)
    }

    /// Record of a trusted peer
    pub fn peer(&self, public_id: &PublicId) -> Option<TrustedPeer> {
        self.peers.get(public_id).map(|p| p.value().clone())
    }

    /// Set or clear the local alias of a trusted peer; false if unknown
    pub fn rename(&self, public_id: &PublicId, alias: Option<String>) -> bool {
        match self.peers.get_mut(public_id) {
            Some(mut peer) => {
                peer.alias = alias;
                true
            }
            None => false,
        }
    }

    /// All trusted peers, most recently connected first
    pub fn peers(&self) -> Vec<TrustedPeer> {
        let mut peers: Vec<_> = self.peers.iter().map(|p| p.value().clone()).collect();
        peers.sort_by(|a, b| b.connected_at.cmp(&a.connected_at));
        peers
    }

    /// The authentication predicate
    pub fn authenticates(&self, message: &ControlMessage) -> bool {
        let token_ok = message
            .authentication
            .as_deref()
            .is_some_and(|token| self.tokens.contains_key(token));
        token_ok || self.is_trusted(&message.client_id)
    }
}

/// Middleware dropping every message that does not authenticate
pub struct Authenticator {
    trust: Arc<TrustStore>,
}

impl Authenticator {
    /// Gate on `trust`
    pub fn new(trust: Arc<TrustStore>) -> Self {
        Self { trust }
    }
}

impl Middleware for Authenticator {
    fn process(&self, message: &ControlMessage) -> ControlFlow<()> {
        if self.trust.authenticates(message) {
            ControlFlow::Continue(())
        } else {
            tracing::warn!(
                "Authentication failed for {} from {}",
                message.kind,
                message.client_id.short()
            );
            ControlFlow::Break(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;

    fn peer(id: &str, at: u64) -> TrustedPeer {
        TrustedPeer {
            public_id: PublicId::new(id),
            name: id.to_uppercase(),
            alias: None,
            connected_at: at,
        }
    }

    fn msg(from: &str, token: Option<&str>) -> ControlMessage {
        ControlMessage::new(MessageType::ListRequest, PublicId::new(from))
            .with_optional_auth(token.map(str::to_string))
    }

    #[test]
    fn test_predicate() {
        let trust = TrustStore::with_peers([peer("friend", 1)]);
        trust.add_token("7K4X", TokenKind::LinkCode);

        assert!(trust.authenticates(&msg("friend", None)));
        assert!(trust.authenticates(&msg("stranger", Some("7K4X"))));
        assert!(trust.authenticates(&msg("friend", Some("bogus"))));
        assert!(!trust.authenticates(&msg("stranger", None)));
        assert!(!trust.authenticates(&msg("stranger", Some("bogus"))));
    }

    #[test]
    fn test_take_token_respects_kind() {
        let trust = TrustStore::new();
        trust.add_token("abc123", TokenKind::SharePath);
        assert!(!trust.take_token("abc123", TokenKind::LinkCode));
        assert_eq!(trust.token_kind("abc123"), Some(TokenKind::SharePath));

        trust.add_token("7K4X", TokenKind::LinkCode);
        assert!(trust.take_token("7K4X", TokenKind::LinkCode));
        assert!(!trust.take_token("7K4X", TokenKind::LinkCode));
        assert_eq!(trust.token_count(), 1);
    }

    #[test]
    fn test_peers_newest_first_and_rename() {
        let trust = TrustStore::with_peers([peer("a", 1), peer("c", 3), peer("b", 2)]);
        let order: Vec<_> = trust.peers().into_iter().map(|p| p.name).collect();
        assert_eq!(order, ["C", "B", "A"]);

        assert!(trust.rename(&PublicId::new("a"), Some("laptop".into())));
        assert_eq!(trust.peer(&PublicId::new("a")).unwrap().display_name(), "laptop");
        assert!(!trust.rename(&PublicId::new("zz"), None));

        assert!(trust.forget(&PublicId::new("a")).is_some());
        assert!(!trust.is_trusted(&PublicId::new("a")));
    }

    #[test]
    fn test_authenticator_breaks_silently() {
        let trust = Arc::new(TrustStore::new());
        let gate = Authenticator::new(Arc::clone(&trust));
        assert!(gate.process(&msg("x", None)).is_break());
        trust.trust(peer("x", 1));
        assert!(gate.process(&msg("x", None)).is_continue());
    }
}
