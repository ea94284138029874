//! Peer sessions.
//!
//! One [`PeerSession`] per remote client owns the direct link to it. The
//! side serving files makes the offer; the other side answers. Descriptor
//! and candidate messages are not gated by authentication.
//!
//! ```text
//! NoConnection ──offer/answer──► Signaling ──link up──► Connected
//!                                   ▲   │                   │
//!                          restart  └───┘ failed            │ closed / reset
//!                                       │ (bound exceeded)  ▼
//!                                       └─────────────────► Closed
//! ```
//!
//! Local candidates are forwarded only after the descriptor they belong to
//! has been queued, so the remote side never sees a candidate for a
//! negotiation it has not heard of.

use super::client::{Client, ClientInner};
use crate::error::{ClientError, Result};
use crate::link::{LinkError, LinkEvent, LinkState, PeerLink};
use crate::protocol::{Candidate, ControlMessage, Descriptor, MessageType};
use dashmap::mapref::entry::Entry;
use linkdrop_registry::PublicId;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};

/// Connection state of a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No link negotiated yet
    NoConnection,
    /// Descriptors or candidates in flight, including restarts
    Signaling,
    /// Direct link established
    Connected,
    /// Torn down; a new session replaces it on next use
    Closed,
}

/// The link to one remote client
pub struct PeerSession {
    remote: PublicId,
    link: Arc<dyn PeerLink>,
    state: watch::Sender<SessionState>,
    restarts: AtomicU32,
    offerer: AtomicBool,
    /// Held while producing a descriptor and queueing it
    signaling: Mutex<()>,
}

impl PeerSession {
    fn new(remote: PublicId, link: Arc<dyn PeerLink>) -> Self {
        Self {
            remote,
            link,
            state: watch::channel(SessionState::NoConnection).0,
            restarts: AtomicU32::new(0),
            offerer: AtomicBool::new(false),
            signaling: Mutex::new(()),
        }
    }

    /// Remote client
    pub fn remote(&self) -> &PublicId {
        &self.remote
    }

    /// Underlying link
    pub fn link(&self) -> &Arc<dyn PeerLink> {
        &self.link
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Restarts since the link was last connected
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    fn set_state(&self, new: SessionState) {
        self.state.send_if_modified(|state| {
            if *state == new || *state == SessionState::Closed {
                false
            } else {
                tracing::debug!("Session {} {:?} -> {:?}", self.remote.short(), *state, new);
                *state = new;
                true
            }
        });
    }

    /// Wait until the link is connected.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Link`] if the session closes first
    /// - [`ClientError::Timeout`] if `timeout` elapses
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.state.subscribe();
        let wait = async {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    SessionState::Connected => return Ok(()),
                    SessionState::Closed => return Err(ClientError::Link(LinkError::LinkClosed)),
                    SessionState::NoConnection | SessionState::Signaling => {}
                }
                if rx.changed().await.is_err() {
                    return Err(ClientError::Link(LinkError::LinkClosed));
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ClientError::timeout("waiting for peer connection"))?
    }

    async fn close(&self) {
        self.set_state(SessionState::Closed);
        self.link.close().await;
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Session management
// ═══════════════════════════════════════════════════════════════════════════

impl Client {
    /// State of the session with `peer`
    pub fn session_state(&self, peer: &PublicId) -> SessionState {
        self.inner
            .sessions
            .get(peer)
            .map_or(SessionState::NoConnection, |s| s.state())
    }

    /// Remote ids with a session
    pub fn peer_session_ids(&self) -> Vec<PublicId> {
        self.inner.sessions.iter().map(|s| s.key().clone()).collect()
    }

    /// The live session with `peer`, creating one if needed
    pub(crate) fn ensure_session(&self, peer: &PublicId) -> Result<Arc<PeerSession>> {
        let mut created = None;
        let session = match self.inner.sessions.entry(peer.clone()) {
            Entry::Occupied(mut entry) if entry.get().state() == SessionState::Closed => {
                let (session, events) = self.create_session(peer)?;
                entry.insert(Arc::clone(&session));
                created = Some(events);
                session
            }
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let (session, events) = self.create_session(peer)?;
                entry.insert(Arc::clone(&session));
                created = Some(events);
                session
            }
        };

        if let Some(events) = created {
            tracing::debug!("New session with {}", peer.short());
            tokio::spawn(run_session(
                Arc::downgrade(&self.inner),
                Arc::clone(&session),
                events,
            ));
        }
        Ok(session)
    }

    fn create_session(
        &self,
        peer: &PublicId,
    ) -> Result<(Arc<PeerSession>, mpsc::UnboundedReceiver<LinkEvent>)> {
        let (link, events) = self.inner.links.create(self.public_id(), peer)?;
        Ok((Arc::new(PeerSession::new(peer.clone(), link)), events))
    }

    /// Send an offer on `session`.
    pub(crate) async fn negotiate(&self, session: &PeerSession, restart: bool) -> Result<()> {
        let _guard = session.signaling.lock().await;
        session.offerer.store(true, Ordering::SeqCst);
        session.set_state(SessionState::Signaling);

        let sdp = session.link.create_offer(restart).await?;
        let offer = ControlMessage::new(MessageType::Offer, session.remote.clone())
            .with_data(&Descriptor { sdp })?;
        self.inner.dispatcher.send(offer)?;
        tracing::debug!(
            "Sent {}offer to {}",
            if restart { "restart " } else { "" },
            session.remote.short()
        );
        Ok(())
    }

    /// Discard the session with `peer` and every channel on it
    pub(crate) async fn reset_session(&self, peer: &PublicId) {
        let removed = self.inner.sessions.remove(peer);
        if let Some((_, session)) = removed {
            tracing::debug!("Resetting session with {}", peer.short());
            session.close().await;
        }
    }

    async fn teardown(&self, session: &Arc<PeerSession>) {
        self.inner
            .sessions
            .remove_if(&session.remote, |_, s| Arc::ptr_eq(s, session));
        session.close().await;
    }

    fn live_session(&self, peer: &PublicId) -> Option<Arc<PeerSession>> {
        self.inner
            .sessions
            .get(peer)
            .map(|s| Arc::clone(&s))
            .filter(|s| s.state() != SessionState::Closed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Signaling handlers
// ═══════════════════════════════════════════════════════════════════════════

impl Client {
    pub(crate) async fn on_offer(&self, message: ControlMessage) {
        let remote = message.client_id.clone();
        let Descriptor { sdp } = match message.payload() {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("Bad offer from {}: {}", remote.short(), e);
                return;
            }
        };
        let session = match self.ensure_session(&remote) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Cannot create session with {}: {}", remote.short(), e);
                return;
            }
        };

        let _guard = session.signaling.lock().await;
        // Both sides offered: the lower id keeps its offer
        if session.offerer.load(Ordering::SeqCst)
            && session.state() == SessionState::Signaling
            && self.public_id() < &remote
        {
            tracing::debug!("Ignoring glare offer from {}", remote.short());
            return;
        }
        session.offerer.store(false, Ordering::SeqCst);
        session.set_state(SessionState::Signaling);

        let answer = match session.link.accept_offer(&sdp).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!("Failed to accept offer from {}: {}", remote.short(), e);
                return;
            }
        };
        let reply = ControlMessage::new(MessageType::Answer, remote.clone())
            .with_data(&Descriptor { sdp: answer });
        match reply {
            Ok(reply) => {
                if let Err(e) = self.inner.dispatcher.send(reply) {
                    tracing::warn!("Failed to answer {}: {}", remote.short(), e);
                }
            }
            Err(e) => tracing::warn!("Failed to encode answer: {}", e),
        }
    }

    pub(crate) async fn on_answer(&self, message: ControlMessage) {
        let remote = &message.client_id;
        let Some(session) = self.live_session(remote) else {
            tracing::debug!("Answer from {} without a session", remote.short());
            return;
        };
        let result: Result<()> = match message.payload::<Descriptor>() {
            Ok(Descriptor { sdp }) => session.link.accept_answer(&sdp).await.map_err(Into::into),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::debug!("Dropped answer from {}: {}", remote.short(), e);
        }
    }

    pub(crate) async fn on_candidate(&self, message: ControlMessage) {
        let remote = &message.client_id;
        let Some(session) = self.live_session(remote) else {
            tracing::debug!("Candidate from {} without a session", remote.short());
            return;
        };
        let result: Result<()> = match message.payload::<Candidate>() {
            Ok(Candidate { candidate }) => session
                .link
                .add_remote_candidate(&candidate)
                .await
                .map_err(Into::into),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::debug!("Dropped candidate from {}: {}", remote.short(), e);
        }
    }

    async fn forward_candidate(&self, session: &PeerSession, candidate: String) {
        let _guard = session.signaling.lock().await;
        let message = ControlMessage::new(MessageType::IceCandidate, session.remote.clone())
            .with_data(&Candidate { candidate })
            .and_then(|m| self.inner.dispatcher.send(m));
        if let Err(e) = message {
            tracing::warn!("Failed to forward candidate to {}: {}", session.remote.short(), e);
        }
    }

    /// React to a link state change; false once the session is gone
    async fn on_link_state(&self, session: &Arc<PeerSession>, state: LinkState) -> bool {
        match state {
            LinkState::New | LinkState::Connecting => true,
            LinkState::Connected => {
                session.restarts.store(0, Ordering::SeqCst);
                session.set_state(SessionState::Connected);
                tracing::info!("Connected to {}", session.remote.short());
                true
            }
            LinkState::Failed => {
                let attempt = session.restarts.fetch_add(1, Ordering::SeqCst) + 1;
                let max = self.inner.config.transfer.max_restarts;
                if attempt > max {
                    tracing::warn!(
                        "Negotiation with {} failed after {} restarts, giving up",
                        session.remote.short(),
                        max
                    );
                    self.teardown(session).await;
                    return false;
                }
                session.set_state(SessionState::Signaling);
                if session.offerer.load(Ordering::SeqCst) {
                    tracing::info!(
                        "Negotiation with {} failed, restart {}/{}",
                        session.remote.short(),
                        attempt,
                        max
                    );
                    if let Err(e) = self.negotiate(session, true).await {
                        tracing::warn!("Restart with {} failed: {}", session.remote.short(), e);
                        self.teardown(session).await;
                        return false;
                    }
                }
                true
            }
            LinkState::Closed => {
                tracing::debug!("Link to {} closed", session.remote.short());
                self.teardown(session).await;
                false
            }
        }
    }
}

/// Drive one session's link events until it closes
async fn run_session(
    client: Weak<ClientInner>,
    session: Arc<PeerSession>,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = client.upgrade() else { break };
        let client = Client { inner };
        match event {
            LinkEvent::LocalCandidate(candidate) => {
                client.forward_candidate(&session, candidate).await;
            }
            LinkEvent::StateChanged(state) => {
                if !client.on_link_state(&session, state).await {
                    break;
                }
            }
            LinkEvent::IncomingChannel(channel) => {
                let remote = session.remote.clone();
                tokio::spawn(async move { client.receive_file(remote, channel).await });
            }
        }
    }
    tracing::trace!("Session loop for {} ended", session.remote.short());
}
