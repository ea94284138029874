//! Message dispatcher.
//!
//! Typed send/receive bus over the relay:
//! - [`Dispatcher::send`] queues a message for an outbound task and returns
//!   immediately; delivery never happens inline.
//! - [`Dispatcher::handle`] registers an ordered middleware chain ending in
//!   a handler for one message type. A middleware returning
//!   [`ControlFlow::Break`] drops the message silently.
//! - [`Dispatcher::wait_for`] and [`Dispatcher::request`] are single-shot
//!   correlated waits. Each waiter is keyed by a unique id and deregisters
//!   itself when resolved, timed out or dropped.
//!
//! Inbound messages are processed one at a time in arrival order. Handlers
//! run on the inbound task, so they must not wait for further inbound
//! messages themselves; anything long-running is spawned.

use crate::error::{ClientError, Result};
use crate::protocol::{ControlMessage, MessageType};
use crate::relay::{RelayInbox, RelayPublisher};
use async_trait::async_trait;
use dashmap::DashMap;
use linkdrop_registry::PublicId;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// A step in a handler chain
pub trait Middleware: Send + Sync {
    /// Inspect a message; `Break` stops the chain without a reply.
    fn process(&self, message: &ControlMessage) -> ControlFlow<()>;
}

impl<F> Middleware for F
where
    F: Fn(&ControlMessage) -> ControlFlow<()> + Send + Sync,
{
    fn process(&self, message: &ControlMessage) -> ControlFlow<()> {
        self(message)
    }
}

/// The final step of a handler chain
#[async_trait]
pub trait Handler: Send + Sync {
    /// Act on a message that passed every middleware
    async fn call(&self, message: ControlMessage);
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(ControlMessage) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn call(&self, message: ControlMessage) {
        self(message).await;
    }
}

struct Chain {
    middleware: Vec<Arc<dyn Middleware>>,
    handler: Box<dyn Handler>,
}

impl Chain {
    async fn run(&self, message: ControlMessage) {
        for step in &self.middleware {
            if step.process(&message).is_break() {
                tracing::trace!(
                    "Dropped {} from {} in middleware",
                    message.kind,
                    message.client_id.short()
                );
                return;
            }
        }
        self.handler.call(message).await;
    }
}

type Predicate = Box<dyn Fn(&ControlMessage) -> bool + Send + Sync>;

struct Waiter {
    kind: MessageType,
    predicate: Predicate,
    tx: oneshot::Sender<ControlMessage>,
}

struct DispatcherInner {
    local_id: PublicId,
    outbound: mpsc::UnboundedSender<ControlMessage>,
    chains: DashMap<MessageType, Vec<Arc<Chain>>>,
    waiters: DashMap<u64, Waiter>,
    next_waiter: AtomicU64,
    subscribers: broadcast::Sender<ControlMessage>,
    shutdown: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Typed message bus for one client
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Create a dispatcher whose outbound messages are handed to the
    /// returned receiver.
    ///
    /// `capacity` bounds the global subscriber buffer.
    pub fn new(
        local_id: PublicId,
        capacity: usize,
    ) -> (Self, mpsc::UnboundedReceiver<ControlMessage>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let inner = DispatcherInner {
            local_id,
            outbound,
            chains: DashMap::new(),
            waiters: DashMap::new(),
            next_waiter: AtomicU64::new(0),
            subscribers: broadcast::channel(capacity.max(1)).0,
            shutdown: watch::channel(false).0,
            tasks: tokio::sync::Mutex::new(Vec::new()),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            outbound_rx,
        )
    }

    /// Wire the dispatcher to a relay subscription.
    ///
    /// Spawns one task publishing the queued messages of `outbound` (the
    /// receiver returned by [`Dispatcher::new`]) and one task feeding
    /// inbound messages to [`Dispatcher::receive`]. Handlers should be
    /// registered before attaching so no early message goes unhandled.
    pub async fn attach(
        &self,
        mut outbound: mpsc::UnboundedReceiver<ControlMessage>,
        publisher: Arc<dyn RelayPublisher>,
        mut inbox: RelayInbox,
    ) {
        let mut stop = self.inner.shutdown.subscribe();
        let send_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = outbound.recv() => {
                        let Some(message) = message else { break };
                        let kind = message.kind;
                        if let Err(e) = publisher.publish(message).await {
                            tracing::warn!("Failed to publish {}: {}", kind, e);
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
            publisher.close().await;
        });

        let mut stop = self.inner.shutdown.subscribe();
        let receiver = self.clone();
        let receive_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = inbox.recv() => {
                        let Some(message) = message else { break };
                        receiver.receive(message).await;
                    }
                    _ = stop.changed() => break,
                }
            }
        });

        self.inner
            .tasks
            .lock()
            .await
            .extend([send_task, receive_task]);
    }

    /// Public id of the owning client
    pub fn local_id(&self) -> &PublicId {
        &self.inner.local_id
    }

    /// Queue a message for delivery.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Channel`] after shutdown.
    pub fn send(&self, message: ControlMessage) -> Result<()> {
        tracing::trace!("Queued {} for {}", message.kind, message.client_id.short());
        self.inner
            .outbound
            .send(message)
            .map_err(|_| ClientError::channel("dispatcher stopped"))
    }

    /// Register a middleware chain and handler for one message type.
    ///
    /// Several chains may be registered for the same type; each sees every
    /// message of that type, in registration order.
    pub fn handle<H>(&self, kind: MessageType, middleware: Vec<Arc<dyn Middleware>>, handler: H)
    where
        H: Handler + 'static,
    {
        let chain = Arc::new(Chain {
            middleware,
            handler: Box::new(handler),
        });
        self.inner.chains.entry(kind).or_default().push(chain);
    }

    /// Register a correlated waiter without waiting yet.
    ///
    /// The waiter is live from the moment this returns, so a reply cannot
    /// slip in between registration and the first poll.
    pub fn register<P>(&self, kind: MessageType, predicate: P) -> PendingReply
    where
        P: Fn(&ControlMessage) -> bool + Send + Sync + 'static,
    {
        let id = self.inner.next_waiter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.waiters.insert(
            id,
            Waiter {
                kind,
                predicate: Box::new(predicate),
                tx,
            },
        );
        PendingReply {
            kind,
            rx,
            _guard: WaiterGuard {
                inner: Arc::clone(&self.inner),
                id,
            },
        }
    }

    /// Wait for the first message of `kind` matching `predicate`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Timeout`] if nothing matched in time.
    pub async fn wait_for<P>(
        &self,
        kind: MessageType,
        predicate: P,
        timeout: Duration,
    ) -> Result<ControlMessage>
    where
        P: Fn(&ControlMessage) -> bool + Send + Sync + 'static,
    {
        self.register(kind, predicate).wait(timeout).await
    }

    /// Send `message` and wait for a correlated reply.
    ///
    /// The waiter is registered before the message is queued.
    pub async fn request<P>(
        &self,
        message: ControlMessage,
        reply: MessageType,
        predicate: P,
        timeout: Duration,
    ) -> Result<ControlMessage>
    where
        P: Fn(&ControlMessage) -> bool + Send + Sync + 'static,
    {
        let pending = self.register(reply, predicate);
        self.send(message)?;
        pending.wait(timeout).await
    }

    /// Receive every inbound message (before any filtering)
    pub fn subscribe(&self) -> broadcast::Receiver<ControlMessage> {
        self.inner.subscribers.subscribe()
    }

    /// Fan an inbound message out to subscribers, waiters and handlers.
    pub async fn receive(&self, message: ControlMessage) {
        tracing::trace!(
            "Received {} from {}",
            message.kind,
            message.client_id.short()
        );
        // No subscribers is fine
        let _ = self.inner.subscribers.send(message.clone());
        self.resolve_waiter(&message);

        let chains = self
            .inner
            .chains
            .get(&message.kind)
            .map(|chains| chains.value().clone())
            .unwrap_or_default();
        for chain in chains {
            chain.run(message.clone()).await;
        }
    }

    fn resolve_waiter(&self, message: &ControlMessage) {
        let matched = self
            .inner
            .waiters
            .iter()
            .filter(|w| w.kind == message.kind && (w.predicate)(message))
            .map(|w| *w.key())
            .min();

        if let Some((_, waiter)) = matched.and_then(|id| self.inner.waiters.remove(&id)) {
            // Receiver gone means the wait was abandoned
            let _ = waiter.tx.send(message.clone());
        }
    }

    /// Number of registered, unresolved waiters
    pub fn pending_waiters(&self) -> usize {
        self.inner.waiters.len()
    }

    /// Stop the relay tasks and drop every chain and waiter.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        self.inner.chains.clear();
        self.inner.waiters.clear();

        let tasks: Vec<_> = self.inner.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Dispatcher task ended abnormally: {}", e);
            }
        }
    }
}

struct WaiterGuard {
    inner: Arc<DispatcherInner>,
    id: u64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.inner.waiters.remove(&self.id);
    }
}

/// A registered correlated waiter
pub struct PendingReply {
    kind: MessageType,
    rx: oneshot::Receiver<ControlMessage>,
    _guard: WaiterGuard,
}

impl PendingReply {
    /// Wait for the matching message.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Timeout`] when nothing matched within `timeout`
    /// - [`ClientError::Channel`] when the dispatcher shut down
    pub async fn wait(self, timeout: Duration) -> Result<ControlMessage> {
        let kind = self.kind;
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(ClientError::channel("dispatcher stopped")),
            Err(_) => Err(ClientError::Timeout(format!("waiting for {kind}").into())),
        }
    }
}
