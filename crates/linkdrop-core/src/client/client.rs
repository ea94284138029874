//! Client context object

use super::config::ClientConfig;
use super::events::{ClientEvent, Direction, TransferEvent, TransferStatus};
use super::profile::{ClientProfile, ProfileStore, TrustedPeer};
use super::session::PeerSession;
use super::transfer::ExpectedFile;
use super::trust::{Authenticator, TrustStore};
use crate::dispatcher::{Dispatcher, Middleware};
use crate::error::Result;
use crate::link::LinkFactory;
use crate::protocol::{ControlMessage, FileOffer, MessageType};
use crate::relay::Relay;
use dashmap::DashMap;
use linkdrop_files::{FileStore, LocalFile};
use linkdrop_registry::{ClientIdentity, LinkRegistry, PublicId};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Mutex, Semaphore, broadcast};
use tokio::time::Instant;

/// Capacity of the client event channel
const EVENT_CAPACITY: usize = 1024;

/// External capabilities a client is built from
#[derive(Clone)]
pub struct Collaborators {
    /// Identity and link-code registry
    pub registry: Arc<LinkRegistry>,
    /// Signaling relay
    pub relay: Arc<dyn Relay>,
    /// Direct-link capability
    pub links: Arc<dyn LinkFactory>,
    /// Storage for received files
    pub files: Arc<dyn FileStore>,
    /// Persistence for name, identity and trusted peers
    pub profiles: Arc<dyn ProfileStore>,
}

/// Key of per-file state: (peer, file name)
pub(crate) type FileKey = (PublicId, String);

/// Shared client state
pub(crate) struct ClientInner {
    /// Identity pair
    pub(crate) identity: ClientIdentity,
    /// Configuration
    pub(crate) config: ClientConfig,
    /// Link-code registry
    pub(crate) registry: Arc<LinkRegistry>,
    /// Link factory
    pub(crate) links: Arc<dyn LinkFactory>,
    /// Received-file storage
    pub(crate) files: Arc<dyn FileStore>,
    /// Profile persistence
    pub(crate) profiles: Arc<dyn ProfileStore>,
    /// Message dispatcher
    pub(crate) dispatcher: Dispatcher,
    /// Tokens and trusted peers
    pub(crate) trust: Arc<TrustStore>,
    /// Display name
    pub(crate) name: RwLock<String>,
    /// Peer sessions (remote -> session)
    pub(crate) sessions: DashMap<PublicId, Arc<PeerSession>>,
    /// Files offered to peers (name -> file)
    pub(crate) shared: DashMap<String, LocalFile>,
    /// Files peers offered to us
    pub(crate) remote_offers: DashMap<PublicId, Vec<FileOffer>>,
    /// Accepted files whose channel has not opened yet
    pub(crate) expected: DashMap<FileKey, ExpectedFile>,
    /// Files currently moving
    pub(crate) active: DashMap<FileKey, Direction>,
    /// Last inbound file chunk per peer
    pub(crate) received_at: DashMap<PublicId, Instant>,
    /// Per-peer transfer slots
    pub(crate) limits: DashMap<PublicId, Arc<Semaphore>>,
    /// Event channel
    pub(crate) events: broadcast::Sender<ClientEvent>,
    /// Serializes profile saves
    pub(crate) persist_lock: Mutex<()>,
    /// Cleared on shutdown
    pub(crate) running: AtomicBool,
}

/// A linkdrop client
///
/// Cheap to clone; every clone drives the same client. Create one with
/// [`Client::setup`] and end it with [`Client::shutdown`].
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Lifecycle
// ═══════════════════════════════════════════════════════════════════════════

impl Client {
    /// Build a client.
    ///
    /// Loads the persisted profile, creates an identity through the registry
    /// if the profile has none, subscribes to the relay and registers every
    /// message handler.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, profile storage failure, registry
    /// failure or a rejected relay subscription.
    pub async fn setup(collaborators: Collaborators, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let Collaborators {
            registry,
            relay,
            links,
            files,
            profiles,
        } = collaborators;

        let mut profile = profiles.load().await?.unwrap_or_default();
        if let Some(name) = &config.display_name {
            profile.name.clone_from(name);
        }
        let identity = match profile.identity.clone() {
            Some(identity) => identity,
            None => {
                let identity = registry.create_identity().await?;
                tracing::info!("Created identity {}", identity.public_id.short());
                profile.identity = Some(identity.clone());
                identity
            }
        };
        profiles.save(&profile).await?;

        let subscription = relay
            .subscribe(&identity.public_id, &identity.private_id)
            .await?;
        let (dispatcher, outbound) =
            Dispatcher::new(identity.public_id.clone(), config.dispatch.event_capacity);

        let peer_count = profile.peers.len();
        let client = Self {
            inner: Arc::new(ClientInner {
                identity,
                config,
                registry,
                links,
                files,
                profiles,
                dispatcher,
                trust: Arc::new(TrustStore::with_peers(profile.peers)),
                name: RwLock::new(profile.name),
                sessions: DashMap::new(),
                shared: DashMap::new(),
                remote_offers: DashMap::new(),
                expected: DashMap::new(),
                active: DashMap::new(),
                received_at: DashMap::new(),
                limits: DashMap::new(),
                events: broadcast::channel(EVENT_CAPACITY).0,
                persist_lock: Mutex::new(()),
                running: AtomicBool::new(true),
            }),
        };

        client.register_handlers();
        client
            .inner
            .dispatcher
            .attach(outbound, subscription.publisher, subscription.inbox)
            .await;

        tracing::info!(
            "Client {} ready ({} trusted peers)",
            client.public_id().short(),
            peer_count
        );
        Ok(client)
    }

    fn register_handlers(&self) {
        use MessageType::*;

        self.on(ConnectionRequest, |c, m| async move { c.on_connection_request(m).await });
        self.on(Disconnect, |c, m| async move { c.on_disconnect(m).await });
        self.on(IdentityRequest, |c, m| async move { c.on_identity_request(m).await });
        self.on(ListRequest, |c, m| async move { c.on_list_request(m).await });
        self.on(SendRequest, |c, m| async move { c.on_send_request(m).await });
        self.on(ReceiveRequest, |c, m| async move { c.on_receive_request(m).await });
        self.on(Offer, |c, m| async move { c.on_offer(m).await });
        self.on(Answer, |c, m| async move { c.on_answer(m).await });
        self.on(IceCandidate, |c, m| async move { c.on_candidate(m).await });
    }

    /// Register a handler holding only a weak reference to the client.
    ///
    /// Gated message types get the authentication middleware.
    fn on<F, Fut>(&self, kind: MessageType, handler: F)
    where
        F: Fn(Client, ControlMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let middleware: Vec<Arc<dyn Middleware>> = if kind.is_gated() {
            vec![Arc::new(Authenticator::new(Arc::clone(&self.inner.trust)))]
        } else {
            Vec::new()
        };

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .dispatcher
            .handle(kind, middleware, move |message: ControlMessage| {
                let pending = weak
                    .upgrade()
                    .map(|inner| handler(Client { inner }, message));
                async move {
                    if let Some(pending) = pending {
                        pending.await;
                    }
                }
            });
    }

    /// Stop the client.
    ///
    /// Closes every peer session, cancels pending open timers and detaches
    /// from the relay. Persisted state is left as is.
    pub async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for key in self.peer_session_ids() {
            self.reset_session(&key).await;
        }
        for entry in self.inner.expected.iter() {
            entry.value().cancel();
        }
        self.inner.expected.clear();
        self.inner.received_at.clear();
        self.inner.dispatcher.shutdown().await;
        tracing::info!("Client {} stopped", self.public_id().short());
    }

    /// Whether [`Client::shutdown`] has not been called
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Accessors
// ═══════════════════════════════════════════════════════════════════════════

impl Client {
    /// This client's public id
    pub fn public_id(&self) -> &PublicId {
        &self.inner.identity.public_id
    }

    /// This client's identity pair
    pub fn identity(&self) -> &ClientIdentity {
        &self.inner.identity
    }

    /// Effective configuration
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Current display name
    pub fn name(&self) -> String {
        self.inner
            .name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Trusted peers, most recently connected first
    pub fn peers(&self) -> Vec<TrustedPeer> {
        self.inner.trust.peers()
    }

    /// Whether `peer` is trusted
    pub fn is_trusted(&self, peer: &PublicId) -> bool {
        self.inner.trust.is_trusted(peer)
    }

    /// Storage receiving inbound files
    pub fn file_store(&self) -> &Arc<dyn FileStore> {
        &self.inner.files
    }

    /// Subscribe to client events
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Subscribe to every inbound control message, before authentication
    pub fn subscribe_messages(&self) -> broadcast::Receiver<ControlMessage> {
        self.inner.dispatcher.subscribe()
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    pub(crate) fn emit_transfer(
        &self,
        peer: &PublicId,
        file: &str,
        direction: Direction,
        status: TransferStatus,
    ) {
        self.emit(ClientEvent::Transfer(TransferEvent {
            peer: peer.clone(),
            file: file.to_string(),
            direction,
            status,
        }));
    }

    /// Save name, identity and trusted peers.
    ///
    /// Failures are logged; the in-memory state stays authoritative.
    pub(crate) async fn persist(&self) {
        let _guard = self.inner.persist_lock.lock().await;
        let profile = ClientProfile {
            name: self.name(),
            identity: Some(self.inner.identity.clone()),
            peers: self.inner.trust.peers(),
        };
        if let Err(e) = self.inner.profiles.save(&profile).await {
            tracing::warn!("Failed to persist profile: {}", e);
        }
    }
}
