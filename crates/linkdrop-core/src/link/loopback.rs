//! In-process loopback links.
//!
//! A [`LoopbackNetwork`] connects links created for pairs of public ids
//! inside one process. Negotiation follows the same shape as a real stack:
//! a link connects once it holds both descriptors and a remote candidate of
//! the same negotiation session, and the network pairs it with the matching
//! link on the other side.
//!
//! Data channels count bytes as buffered until the receiving side consumes
//! them, so backpressure is observable. Fault injection:
//! - [`LoopbackNetwork::block`] makes every negotiation between two ids fail
//! - [`LoopbackConfig::drain_delay`] slows down every receiving side

use super::{DataChannel, LinkError, LinkEvent, LinkFactory, LinkResult, LinkState, PeerLink};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use linkdrop_registry::PublicId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, watch};

/// Loopback network behaviour
#[derive(Debug, Clone, Default)]
pub struct LoopbackConfig {
    /// Delay before each received frame is handed to the reader
    pub drain_delay: Duration,
}

type PairKey = (PublicId, PublicId);

fn unordered(a: &PublicId, b: &PublicId) -> PairKey {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct NetworkInner {
    config: LoopbackConfig,
    /// (local, remote) -> most recently created link
    endpoints: DashMap<PairKey, Weak<LoopbackLink>>,
    /// (local, remote) -> session a ready link is waiting to be paired on
    ready: Mutex<HashMap<PairKey, u64>>,
    blocked: DashSet<PairKey>,
    offers: DashMap<PairKey, u32>,
    next_channel: AtomicU64,
    open_channels: AtomicUsize,
    peak_open_channels: AtomicUsize,
    peak_buffered: AtomicUsize,
}

impl NetworkInner {
    fn channel_opened(&self) {
        let open = self.open_channels.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_open_channels.fetch_max(open, Ordering::SeqCst);
    }

    /// Register `link` as ready on `session`; connect it if its counterpart
    /// is ready on the same session.
    fn mark_ready(&self, link: &Arc<LoopbackLink>, session: u64) {
        let key = (link.local.clone(), link.remote.clone());
        let rev = (link.remote.clone(), link.local.clone());

        let matched = {
            let mut ready = lock(&self.ready);
            if ready.get(&rev) == Some(&session) {
                ready.remove(&rev);
                true
            } else {
                ready.insert(key, session);
                false
            }
        };
        if !matched {
            return;
        }

        let Some(peer) = self.endpoints.get(&rev).and_then(|w| w.upgrade()) else {
            return;
        };

        if self.blocked.contains(&unordered(&link.local, &link.remote)) {
            tracing::debug!(
                "Loopback negotiation {} <-> {} blocked",
                link.local.short(),
                link.remote.short()
            );
            link.set_state(LinkState::Failed);
            peer.set_state(LinkState::Failed);
            return;
        }

        *lock(&link.counterpart) = Arc::downgrade(&peer);
        *lock(&peer.counterpart) = Arc::downgrade(link);
        link.set_state(LinkState::Connected);
        peer.set_state(LinkState::Connected);
    }
}

/// In-process network of loopback links
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

impl LoopbackNetwork {
    /// Create a network with default behaviour
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a network with custom behaviour
    #[must_use]
    pub fn with_config(config: LoopbackConfig) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                config,
                ..NetworkInner::default()
            }),
        }
    }

    /// Make every negotiation between `a` and `b` fail
    pub fn block(&self, a: &PublicId, b: &PublicId) {
        self.inner.blocked.insert(unordered(a, b));
    }

    /// Undo [`LoopbackNetwork::block`]
    pub fn unblock(&self, a: &PublicId, b: &PublicId) {
        self.inner.blocked.remove(&unordered(a, b));
    }

    /// Offers (initial and restart) created by `local` towards `remote`
    pub fn offers_created(&self, local: &PublicId, remote: &PublicId) -> u32 {
        self.inner
            .offers
            .get(&(local.clone(), remote.clone()))
            .map_or(0, |n| *n)
    }

    /// Data channels currently open
    pub fn open_channels(&self) -> usize {
        self.inner.open_channels.load(Ordering::SeqCst)
    }

    /// Largest number of simultaneously open data channels seen
    pub fn peak_open_channels(&self) -> usize {
        self.inner.peak_open_channels.load(Ordering::SeqCst)
    }

    /// Largest buffered amount seen on any channel
    pub fn peak_buffered(&self) -> usize {
        self.inner.peak_buffered.load(Ordering::SeqCst)
    }
}

impl LinkFactory for LoopbackNetwork {
    fn create(
        &self,
        local: &PublicId,
        remote: &PublicId,
    ) -> LinkResult<(Arc<dyn PeerLink>, mpsc::UnboundedReceiver<LinkEvent>)> {
        let (events, rx) = mpsc::unbounded_channel();
        let link = Arc::new_cyclic(|me| LoopbackLink {
            me: me.clone(),
            local: local.clone(),
            remote: remote.clone(),
            network: Arc::clone(&self.inner),
            events,
            state: watch::channel(LinkState::New).0,
            negotiation: Mutex::new(Negotiation::default()),
            counterpart: Mutex::new(Weak::new()),
            channels: DashMap::new(),
        });
        self.inner
            .endpoints
            .insert((local.clone(), remote.clone()), Arc::downgrade(&link));
        let link: Arc<dyn PeerLink> = link;
        Ok((link, rx))
    }
}

#[derive(Debug, Default)]
struct Negotiation {
    session: Option<u64>,
    local_described: bool,
    remote_described: bool,
    /// Session of the last remote candidate; may arrive before the offer
    remote_candidate: Option<u64>,
}

impl Negotiation {
    fn ready_session(&self) -> Option<u64> {
        let session = self.session?;
        (self.local_described && self.remote_described && self.remote_candidate == Some(session))
            .then_some(session)
    }
}

struct LoopbackLink {
    me: Weak<LoopbackLink>,
    local: PublicId,
    remote: PublicId,
    network: Arc<NetworkInner>,
    events: mpsc::UnboundedSender<LinkEvent>,
    state: watch::Sender<LinkState>,
    negotiation: Mutex<Negotiation>,
    counterpart: Mutex<Weak<LoopbackLink>>,
    channels: DashMap<u64, Weak<ChannelCore>>,
}

fn parse_session(descriptor: &str, kind: &str) -> LinkResult<u64> {
    descriptor
        .strip_prefix(kind)
        .and_then(|rest| rest.trim().parse().ok())
        .ok_or_else(|| LinkError::Negotiation(format!("malformed {kind}: {descriptor:?}")))
}

impl LoopbackLink {
    fn emit(&self, event: LinkEvent) {
        // Receiver gone means the owning session is being torn down
        let _ = self.events.send(event);
    }

    /// Returns false if the state was unchanged or the link already closed
    fn set_state(&self, new: LinkState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == new || *state == LinkState::Closed {
                false
            } else {
                *state = new;
                true
            }
        });
        if changed {
            self.emit(LinkEvent::StateChanged(new));
        }
        changed
    }

    fn ensure_open(&self) -> LinkResult<()> {
        if *self.state.borrow() == LinkState::Closed {
            Err(LinkError::LinkClosed)
        } else {
            Ok(())
        }
    }

    fn check_ready(&self) {
        let session = lock(&self.negotiation).ready_session();
        if let (Some(session), Some(me)) = (session, self.me.upgrade()) {
            self.network.mark_ready(&me, session);
        }
    }

    fn close_channels(&self) {
        for entry in self.channels.iter() {
            if let Some(core) = entry.value().upgrade() {
                core.close();
            }
        }
        self.channels.clear();
    }

    fn shut(&self) -> bool {
        if !self.set_state(LinkState::Closed) {
            return false;
        }
        self.close_channels();
        self.network
            .endpoints
            .remove_if(&(self.local.clone(), self.remote.clone()), |_, w| {
                std::ptr::eq(w.as_ptr(), self)
            });
        true
    }
}

#[async_trait]
impl PeerLink for LoopbackLink {
    async fn create_offer(&self, restart: bool) -> LinkResult<String> {
        self.ensure_open()?;
        let session = rand::random::<u64>();
        *lock(&self.negotiation) = Negotiation {
            session: Some(session),
            local_described: true,
            ..Negotiation::default()
        };

        *self
            .network
            .offers
            .entry((self.local.clone(), self.remote.clone()))
            .or_insert(0) += 1;
        if restart {
            tracing::debug!("Loopback restart offer {} -> {}", self.local.short(), self.remote.short());
        }

        self.set_state(LinkState::Connecting);
        self.emit(LinkEvent::LocalCandidate(format!("candidate {session}")));
        Ok(format!("offer {session}"))
    }

    async fn accept_offer(&self, offer: &str) -> LinkResult<String> {
        self.ensure_open()?;
        let session = parse_session(offer, "offer")?;
        {
            let mut negotiation = lock(&self.negotiation);
            let early_candidate = negotiation.remote_candidate.filter(|s| *s == session);
            *negotiation = Negotiation {
                session: Some(session),
                local_described: true,
                remote_described: true,
                remote_candidate: early_candidate,
            };
        }

        self.set_state(LinkState::Connecting);
        self.emit(LinkEvent::LocalCandidate(format!("candidate {session}")));
        self.check_ready();
        Ok(format!("answer {session}"))
    }

    async fn accept_answer(&self, answer: &str) -> LinkResult<()> {
        self.ensure_open()?;
        let session = parse_session(answer, "answer")?;
        {
            let mut negotiation = lock(&self.negotiation);
            if negotiation.session != Some(session) {
                return Err(LinkError::Negotiation("answer for a stale offer".to_string()));
            }
            negotiation.remote_described = true;
        }
        self.check_ready();
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &str) -> LinkResult<()> {
        self.ensure_open()?;
        let session = parse_session(candidate, "candidate")?;
        lock(&self.negotiation).remote_candidate = Some(session);
        self.check_ready();
        Ok(())
    }

    async fn open_channel(&self, label: &str) -> LinkResult<Arc<dyn DataChannel>> {
        if *self.state.borrow() != LinkState::Connected {
            return Err(LinkError::NotConnected);
        }
        let peer = lock(&self.counterpart)
            .upgrade()
            .ok_or(LinkError::LinkClosed)?;
        if peer.state() != LinkState::Connected {
            return Err(LinkError::NotConnected);
        }

        let core = Arc::new(ChannelCore::new(Arc::clone(&self.network)));
        let id = self.network.next_channel.fetch_add(1, Ordering::Relaxed);
        let drain_delay = self.network.config.drain_delay;
        let local_end = LoopbackChannel::new(label, Arc::clone(&core), Side::Opener, drain_delay);
        let remote_end = LoopbackChannel::new(label, Arc::clone(&core), Side::Acceptor, drain_delay);

        self.channels.insert(id, Arc::downgrade(&core));
        peer.channels.insert(id, Arc::downgrade(&core));
        self.network.channel_opened();
        peer.emit(LinkEvent::IncomingChannel(Arc::new(remote_end)));

        Ok(Arc::new(local_end))
    }

    fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    async fn close(&self) {
        if !self.shut() {
            return;
        }
        let peer = lock(&self.counterpart).upgrade();
        if let Some(peer) = peer {
            peer.shut();
        }
    }
}

enum Frame {
    Data(Bytes),
    Close,
}

/// One direction of a channel
struct Pipe {
    tx: mpsc::UnboundedSender<Frame>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    buffered: AtomicUsize,
    low_threshold: AtomicUsize,
    low: Notify,
}

impl Pipe {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            buffered: AtomicUsize::new(0),
            low_threshold: AtomicUsize::new(0),
            low: Notify::new(),
        }
    }
}

struct ChannelCore {
    /// Opener -> acceptor
    forward: Pipe,
    /// Acceptor -> opener
    backward: Pipe,
    closed: AtomicBool,
    network: Arc<NetworkInner>,
}

impl ChannelCore {
    fn new(network: Arc<NetworkInner>) -> Self {
        Self {
            forward: Pipe::new(),
            backward: Pipe::new(),
            closed: AtomicBool::new(false),
            network,
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.forward.tx.send(Frame::Close);
        let _ = self.backward.tx.send(Frame::Close);
        self.forward.low.notify_waiters();
        self.backward.low.notify_waiters();
        self.network.open_channels.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Copy)]
enum Side {
    Opener,
    Acceptor,
}

struct LoopbackChannel {
    label: String,
    core: Arc<ChannelCore>,
    side: Side,
    finished: AtomicBool,
    drain_delay: Duration,
}

impl LoopbackChannel {
    fn new(label: &str, core: Arc<ChannelCore>, side: Side, drain_delay: Duration) -> Self {
        Self {
            label: label.to_string(),
            core,
            side,
            finished: AtomicBool::new(false),
            drain_delay,
        }
    }

    fn outgoing(&self) -> &Pipe {
        match self.side {
            Side::Opener => &self.core.forward,
            Side::Acceptor => &self.core.backward,
        }
    }

    fn incoming(&self) -> &Pipe {
        match self.side {
            Side::Opener => &self.core.backward,
            Side::Acceptor => &self.core.forward,
        }
    }
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, data: Bytes) -> LinkResult<()> {
        if self.core.closed.load(Ordering::SeqCst) {
            return Err(LinkError::ChannelClosed);
        }
        let pipe = self.outgoing();
        let buffered = pipe.buffered.fetch_add(data.len(), Ordering::SeqCst) + data.len();
        self.core
            .network
            .peak_buffered
            .fetch_max(buffered, Ordering::SeqCst);
        pipe.tx
            .send(Frame::Data(data))
            .map_err(|_| LinkError::ChannelClosed)
    }

    fn buffered_amount(&self) -> usize {
        self.outgoing().buffered.load(Ordering::SeqCst)
    }

    fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        let pipe = self.outgoing();
        pipe.low_threshold.store(threshold, Ordering::SeqCst);
        pipe.low.notify_waiters();
    }

    async fn wait_buffered_low(&self) -> LinkResult<()> {
        let pipe = self.outgoing();
        loop {
            let notified = pipe.low.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.core.closed.load(Ordering::SeqCst) {
                return Err(LinkError::ChannelClosed);
            }
            if pipe.buffered.load(Ordering::SeqCst) <= pipe.low_threshold.load(Ordering::SeqCst) {
                return Ok(());
            }
            notified.await;
        }
    }

    async fn recv(&self) -> Option<Bytes> {
        if self.finished.load(Ordering::SeqCst) {
            return None;
        }
        let pipe = self.incoming();
        let mut rx = pipe.rx.lock().await;
        if !self.drain_delay.is_zero() {
            tokio::time::sleep(self.drain_delay).await;
        }

        match rx.recv().await {
            Some(Frame::Data(data)) => {
                let remaining = pipe.buffered.fetch_sub(data.len(), Ordering::SeqCst) - data.len();
                if remaining <= pipe.low_threshold.load(Ordering::SeqCst) {
                    pipe.low.notify_waiters();
                }
                Some(data)
            }
            Some(Frame::Close) | None => {
                self.finished.store(true, Ordering::SeqCst);
                None
            }
        }
    }

    async fn close(&self) {
        self.core.close();
    }

    fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Endpoint {
        link: Arc<dyn PeerLink>,
        events: mpsc::UnboundedReceiver<LinkEvent>,
    }

    fn create(net: &LoopbackNetwork, local: &str, remote: &str) -> Endpoint {
        let (link, events) = net
            .create(&PublicId::new(local), &PublicId::new(remote))
            .unwrap();
        Endpoint { link, events }
    }

    fn candidates(side: &mut Endpoint) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(event) = side.events.try_recv() {
            if let LinkEvent::LocalCandidate(c) = event {
                out.push(c);
            }
        }
        out
    }

    async fn negotiate(a: &mut Endpoint, b: &mut Endpoint, restart: bool) {
        let offer = a.link.create_offer(restart).await.unwrap();
        let answer = b.link.accept_offer(&offer).await.unwrap();
        a.link.accept_answer(&answer).await.unwrap();
        for c in candidates(a) {
            b.link.add_remote_candidate(&c).await.unwrap();
        }
        for c in candidates(b) {
            a.link.add_remote_candidate(&c).await.unwrap();
        }
    }

    async fn incoming_channel(side: &mut Endpoint) -> Arc<dyn DataChannel> {
        loop {
            match side.events.recv().await.unwrap() {
                LinkEvent::IncomingChannel(ch) => return ch,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_negotiation_connects() {
        let net = LoopbackNetwork::new();
        let mut a = create(&net, "a", "b");
        let mut b = create(&net, "b", "a");

        negotiate(&mut a, &mut b, false).await;
        assert_eq!(a.link.state(), LinkState::Connected);
        assert_eq!(b.link.state(), LinkState::Connected);
        assert_eq!(net.offers_created(&PublicId::new("a"), &PublicId::new("b")), 1);
    }

    #[tokio::test]
    async fn test_candidate_before_offer() {
        let net = LoopbackNetwork::new();
        let mut a = create(&net, "a", "b");
        let mut b = create(&net, "b", "a");

        let offer = a.link.create_offer(false).await.unwrap();
        for c in candidates(&mut a) {
            b.link.add_remote_candidate(&c).await.unwrap();
        }
        let answer = b.link.accept_offer(&offer).await.unwrap();
        a.link.accept_answer(&answer).await.unwrap();
        for c in candidates(&mut b) {
            a.link.add_remote_candidate(&c).await.unwrap();
        }
        assert_eq!(a.link.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn test_blocked_pair_fails_then_recovers() {
        let net = LoopbackNetwork::new();
        let (ida, idb) = (PublicId::new("a"), PublicId::new("b"));
        net.block(&ida, &idb);
        let mut a = create(&net, "a", "b");
        let mut b = create(&net, "b", "a");

        negotiate(&mut a, &mut b, false).await;
        assert_eq!(a.link.state(), LinkState::Failed);
        assert_eq!(b.link.state(), LinkState::Failed);
        assert!(a.link.open_channel("x").await.is_err());

        net.unblock(&ida, &idb);
        negotiate(&mut a, &mut b, true).await;
        assert_eq!(a.link.state(), LinkState::Connected);
        assert_eq!(net.offers_created(&ida, &idb), 2);
    }

    #[tokio::test]
    async fn test_stale_answer_rejected() {
        let net = LoopbackNetwork::new();
        let a = create(&net, "a", "b");
        let b = create(&net, "b", "a");

        let old_offer = a.link.create_offer(false).await.unwrap();
        let old_answer = b.link.accept_offer(&old_offer).await.unwrap();
        a.link.create_offer(true).await.unwrap();
        assert!(matches!(
            a.link.accept_answer(&old_answer).await,
            Err(LinkError::Negotiation(_))
        ));
    }

    #[tokio::test]
    async fn test_channel_delivery_and_close() {
        let net = LoopbackNetwork::new();
        let mut a = create(&net, "a", "b");
        let mut b = create(&net, "b", "a");
        negotiate(&mut a, &mut b, false).await;

        let tx = a.link.open_channel("file-transfer:x").await.unwrap();
        let rx = incoming_channel(&mut b).await;
        assert_eq!(rx.label(), "file-transfer:x");
        assert_eq!(net.open_channels(), 1);

        tx.send(Bytes::from_static(b"one")).await.unwrap();
        tx.send(Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(tx.buffered_amount(), 6);
        tx.close().await;

        assert_eq!(rx.recv().await.as_deref(), Some(&b"one"[..]));
        assert_eq!(rx.recv().await.as_deref(), Some(&b"two"[..]));
        assert_eq!(rx.recv().await, None);
        assert_eq!(rx.recv().await, None);
        assert_eq!(tx.buffered_amount(), 0);
        assert_eq!(net.open_channels(), 0);
        assert!(matches!(
            tx.send(Bytes::from_static(b"late")).await,
            Err(LinkError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_low_watermark_wakes_sender() {
        let net = LoopbackNetwork::new();
        let mut a = create(&net, "a", "b");
        let mut b = create(&net, "b", "a");
        negotiate(&mut a, &mut b, false).await;

        let tx = a.link.open_channel("c").await.unwrap();
        let rx = incoming_channel(&mut b).await;
        tx.set_buffered_amount_low_threshold(4);
        for _ in 0..4 {
            tx.send(Bytes::from_static(b"xxxx")).await.unwrap();
        }

        let waiter = {
            let tx = Arc::clone(&tx);
            tokio::spawn(async move { tx.wait_buffered_low().await })
        };
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
        waiter.await.unwrap().unwrap();
        assert!(tx.buffered_amount() <= 4);
        assert_eq!(net.peak_buffered(), 16);
    }

    #[tokio::test]
    async fn test_wait_low_fails_on_remote_close() {
        let net = LoopbackNetwork::new();
        let mut a = create(&net, "a", "b");
        let mut b = create(&net, "b", "a");
        negotiate(&mut a, &mut b, false).await;

        let tx = a.link.open_channel("c").await.unwrap();
        let rx = incoming_channel(&mut b).await;
        tx.send(Bytes::from_static(b"pending")).await.unwrap();

        let waiter = {
            let tx = Arc::clone(&tx);
            tokio::spawn(async move { tx.wait_buffered_low().await })
        };
        rx.close().await;
        assert_eq!(waiter.await.unwrap(), Err(LinkError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_link_close_reaches_counterpart() {
        let net = LoopbackNetwork::new();
        let mut a = create(&net, "a", "b");
        let mut b = create(&net, "b", "a");
        negotiate(&mut a, &mut b, false).await;
        let tx = a.link.open_channel("c").await.unwrap();

        b.link.close().await;
        assert_eq!(a.link.state(), LinkState::Closed);
        assert!(tx.is_closed());

        let mut saw_closed = false;
        while let Ok(event) = a.events.try_recv() {
            if matches!(event, LinkEvent::StateChanged(LinkState::Closed)) {
                saw_closed = true;
            }
        }
        assert!(saw_closed);
    }
}
