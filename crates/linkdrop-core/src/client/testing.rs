//! Fixtures for client unit tests

use super::client::{Client, Collaborators};
use super::config::ClientConfig;
use super::events::ClientEvent;
use super::profile::MemoryProfileStore;
use crate::link::loopback::LoopbackNetwork;
use crate::relay::LocalRelay;
use linkdrop_files::MemoryFileStore;
use linkdrop_registry::{LinkRegistry, MemoryRegistryStore, RegistryConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// One registry, relay and loopback network shared by several clients
pub(crate) struct TestPeers {
    pub(crate) registry: Arc<LinkRegistry>,
    pub(crate) relay: Arc<LocalRelay>,
    pub(crate) network: Arc<LoopbackNetwork>,
}

impl TestPeers {
    pub(crate) async fn new() -> Self {
        let registry = Arc::new(LinkRegistry::new(
            Arc::new(MemoryRegistryStore::new()),
            RegistryConfig::default(),
        ));
        Self {
            relay: Arc::new(LocalRelay::new(Arc::clone(&registry))),
            registry,
            network: Arc::new(LoopbackNetwork::new()),
        }
    }

    pub(crate) fn config(name: &str) -> ClientConfig {
        let mut config = ClientConfig {
            display_name: Some(name.to_string()),
            ..ClientConfig::default()
        };
        config.dispatch.response_timeout = Duration::from_millis(500);
        config
    }

    pub(crate) async fn client(&self, name: &str) -> Client {
        self.client_with(Self::config(name)).await
    }

    pub(crate) async fn client_with(&self, config: ClientConfig) -> Client {
        let collaborators = Collaborators {
            registry: Arc::clone(&self.registry),
            relay: self.relay.clone(),
            links: self.network.clone(),
            files: Arc::new(MemoryFileStore::new()),
            profiles: Arc::new(MemoryProfileStore::new()),
        };
        Client::setup(collaborators, config).await.unwrap()
    }

    /// Handshake `a` with `b`, `a` issuing the code
    pub(crate) async fn link(&self, a: &Client, b: &Client) {
        let code = a.create_link_code().await.unwrap();
        b.connect(code.as_str()).await.unwrap();
        // a records b once it has answered
        for _ in 0..50 {
            if a.is_trusted(b.public_id()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never trusted {}", a.name(), b.name());
    }
}

/// Next event, skipping lag notices
pub(crate) async fn next_event(events: &mut broadcast::Receiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) => return event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for an event")
}
