//! In-process test network for integration testing
//!
//! Provides a reusable infrastructure for multi-client scenarios:
//! - One registry, relay and loopback link network shared by all clients
//! - Linked client pairs
//! - Event collection helpers
//!
//! # Example
//!
//! ```no_run
//! use linkdrop_integration_tests::fixtures::TestNet;
//!
//! #[tokio::test]
//! async fn test_basic_transfer() {
//!     let net = TestNet::new();
//!     let (alice, bob) = net.linked_pair().await;
//!     // ... offer files from alice to bob ...
//! }
//! ```

use bytes::Bytes;
use linkdrop_core::client::{
    Client, ClientConfig, ClientEvent, Collaborators, Direction, MemoryProfileStore, ProfileStore,
    TransferEvent,
};
use linkdrop_core::link::{LoopbackConfig, LoopbackNetwork};
use linkdrop_core::LocalRelay;
use linkdrop_files::{FileReader, FileStore, MemoryFileStore};
use linkdrop_registry::{LinkRegistry, MemoryRegistryStore, RegistryConfig};
use rand::{Rng, SeedableRng};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// How long helpers wait before declaring a scenario stuck
pub const PATIENCE: Duration = Duration::from_secs(10);

/// Shared collaborators for a set of clients
pub struct TestNet {
    pub registry: Arc<LinkRegistry>,
    pub relay: Arc<LocalRelay>,
    pub network: Arc<LoopbackNetwork>,
}

impl Default for TestNet {
    fn default() -> Self {
        Self::new()
    }
}

impl TestNet {
    /// Create a network with default loopback behaviour
    pub fn new() -> Self {
        Self::with_loopback(LoopbackConfig::default())
    }

    /// Create a network with custom loopback behaviour
    pub fn with_loopback(config: LoopbackConfig) -> Self {
        let registry = Arc::new(LinkRegistry::new(
            Arc::new(MemoryRegistryStore::new()),
            RegistryConfig::default(),
        ));
        Self {
            relay: Arc::new(LocalRelay::new(Arc::clone(&registry))),
            registry,
            network: Arc::new(LoopbackNetwork::with_config(config)),
        }
    }

    /// Client configuration with test-friendly timeouts
    pub fn config(name: &str) -> ClientConfig {
        let mut config = ClientConfig {
            display_name: Some(name.to_string()),
            ..ClientConfig::default()
        };
        config.dispatch.response_timeout = Duration::from_millis(500);
        config.transfer.open_timeout = Duration::from_secs(3);
        config.transfer.idle_timeout = Duration::from_secs(3);
        config
    }

    /// Create a client with in-memory storage
    pub async fn client(&self, name: &str) -> Client {
        self.client_with(
            Self::config(name),
            Arc::new(MemoryFileStore::new()),
            Arc::new(MemoryProfileStore::new()),
        )
        .await
    }

    /// Create a client from explicit parts
    pub async fn client_with(
        &self,
        config: ClientConfig,
        files: Arc<dyn FileStore>,
        profiles: Arc<dyn ProfileStore>,
    ) -> Client {
        let collaborators = Collaborators {
            registry: Arc::clone(&self.registry),
            relay: self.relay.clone(),
            links: self.network.clone(),
            files,
            profiles,
        };
        Client::setup(collaborators, config)
            .await
            .expect("client setup failed")
    }

    /// Handshake `a` with `b`, `a` issuing the code; returns once both sides
    /// trust each other
    pub async fn link(&self, a: &Client, b: &Client) {
        let code = a.create_link_code().await.expect("issue link code");
        b.connect(code.as_str()).await.expect("handshake");
        assert!(
            wait_until(move || async move { a.is_trusted(b.public_id()) }).await,
            "issuer never recorded the initiator"
        );
    }

    /// Two default clients that trust each other
    pub async fn linked_pair(&self) -> (Client, Client) {
        let alice = self.client("alice").await;
        let bob = self.client("bob").await;
        self.link(&alice, &bob).await;
        (alice, bob)
    }
}

/// Poll `condition` until it holds or [`PATIENCE`] runs out
pub async fn wait_until<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + PATIENCE;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Next event satisfying `predicate`, skipping lag notices; `None` after
/// `within`
pub async fn next_matching<P>(
    events: &mut broadcast::Receiver<ClientEvent>,
    within: Duration,
    mut predicate: P,
) -> Option<ClientEvent>
where
    P: FnMut(&ClientEvent) -> bool,
{
    tokio::time::timeout(within, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Collect `count` terminal transfer events in `direction`
pub async fn finished(
    events: &mut broadcast::Receiver<ClientEvent>,
    direction: Direction,
    count: usize,
) -> Vec<TransferEvent> {
    let mut done = Vec::with_capacity(count);
    while done.len() < count {
        let event = next_matching(events, PATIENCE, |event| {
            matches!(event, ClientEvent::Transfer(t) if t.direction == direction && t.is_terminal())
        })
        .await;
        match event {
            Some(ClientEvent::Transfer(t)) => done.push(t),
            _ => panic!("only {} of {} transfers finished", done.len(), count),
        }
    }
    done
}

/// Deterministic pseudo-random bytes
pub fn payload(len: usize, seed: u64) -> Bytes {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill(&mut data[..]);
    Bytes::from(data)
}

/// Content of the committed entry named `name`, if any
pub async fn stored(store: &Arc<dyn FileStore>, name: &str) -> Option<Vec<u8>> {
    let records = store.list().await.expect("list store");
    let record = records.into_iter().find(|r| r.name == name)?;
    let mut reader = FileReader::open(Arc::clone(store), record.id)
        .await
        .expect("open entry");
    Some(reader.read_to_end().await.expect("read entry"))
}

/// Install a test subscriber honoring `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
