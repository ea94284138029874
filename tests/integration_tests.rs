//! End-to-end scenarios over the in-process relay and loopback links.

use linkdrop_core::client::{
    ClientEvent, Direction, JsonProfileStore, MemoryProfileStore, SessionState, TransferStatus,
    parse_share_path,
};
use linkdrop_files::{FileStore, LocalFile, MemoryFileStore};
use linkdrop_integration_tests::fixtures::{
    PATIENCE, TestNet, finished, init_tracing, next_matching, payload, stored, wait_until,
};
use std::sync::Arc;
use std::time::Duration;

fn text_file(name: &str, len: usize, seed: u64) -> LocalFile {
    LocalFile::from_bytes(name, "text/plain", payload(len, seed))
}

// ============================================================================
// Handshake & Trust
// ============================================================================

#[tokio::test]
async fn test_link_code_handshake_single_use() {
    init_tracing();
    let net = TestNet::new();
    let alice = net.client("alice").await;
    let bob = net.client("bob").await;
    let carol = net.client("carol").await;

    let code = alice.create_link_code().await.unwrap();
    let peer = bob.connect(code.as_str()).await.unwrap();
    assert_eq!(&peer.public_id, alice.public_id());
    assert_eq!(peer.name, "alice");
    let (a, b) = (&alice, &bob);
    assert!(wait_until(move || async move { a.is_trusted(b.public_id()) }).await);
    assert_eq!(alice.peers()[0].name, "bob");

    // The code was consumed by bob's resolution
    let err = carol.connect(code.as_str()).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(carol.peers().is_empty());
    assert!(!alice.is_trusted(carol.public_id()));
}

#[tokio::test]
async fn test_expired_link_code_not_found() {
    let net = TestNet::new();
    let alice = net.client("alice").await;
    let bob = net.client("bob").await;

    let code = net
        .registry
        .issue_link_code_with_ttl(alice.public_id(), Duration::from_millis(20))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert!(bob.connect(code.as_str()).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_handshake_times_out_without_responder() {
    let net = TestNet::new();
    let alice = net.client("alice").await;
    let bob = net.client("bob").await;

    // Bound in the registry, but alice never armed the code locally
    let code = net.registry.issue_link_code(alice.public_id()).await.unwrap();
    let err = bob.connect(code.as_str()).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(!bob.is_trusted(alice.public_id()));
    assert!(!alice.is_trusted(bob.public_id()));
}

#[tokio::test]
async fn test_disconnect_is_asymmetric_until_notified() {
    let net = TestNet::new();
    let (alice, bob) = net.linked_pair().await;

    // Silent local removal
    alice.disconnect(bob.public_id(), false).await.unwrap();
    assert!(!alice.is_trusted(bob.public_id()));
    assert!(bob.is_trusted(alice.public_id()));

    // Bob's requests no longer pass alice's gate
    let err = bob.identify(alice.public_id(), None).await.unwrap_err();
    assert!(err.is_timeout());

    // The notification still passes bob's gate because bob trusts alice
    let mut bob_events = bob.subscribe();
    alice.disconnect(bob.public_id(), true).await.unwrap();
    let event = next_matching(&mut bob_events, PATIENCE, |e| {
        matches!(e, ClientEvent::PeerDisconnected(_))
    })
    .await;
    assert!(event.is_some());
    assert!(!bob.is_trusted(alice.public_id()));
}

#[tokio::test]
async fn test_rename_is_local_only() {
    let net = TestNet::new();
    let (alice, bob) = net.linked_pair().await;

    alice
        .rename_peer(bob.public_id(), Some("work laptop".into()))
        .await
        .unwrap();
    assert_eq!(alice.peers()[0].display_name(), "work laptop");
    assert_eq!(bob.identify(alice.public_id(), None).await.unwrap(), "alice");
    assert_eq!(bob.peers()[0].display_name(), "alice");
}

#[tokio::test]
async fn test_profile_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("alice/profile.json");
    let net = TestNet::new();

    let alice = net
        .client_with(
            TestNet::config("alice"),
            Arc::new(MemoryFileStore::new()),
            Arc::new(JsonProfileStore::new(&path)),
        )
        .await;
    let bob = net.client("bob").await;
    let mut alice_events = alice.subscribe();
    net.link(&alice, &bob).await;
    // Emitted once the new peer is persisted
    let connected = next_matching(&mut alice_events, PATIENCE, |e| {
        matches!(e, ClientEvent::PeerConnected(_))
    })
    .await;
    assert!(connected.is_some());
    let id = alice.public_id().clone();
    alice.shutdown().await;

    let mut config = TestNet::config("alice");
    config.display_name = None;
    let restarted = net
        .client_with(
            config,
            Arc::new(MemoryFileStore::new()),
            Arc::new(JsonProfileStore::new(&path)),
        )
        .await;
    assert_eq!(restarted.public_id(), &id);
    assert_eq!(restarted.name(), "alice");
    assert!(restarted.is_trusted(bob.public_id()));

    // Still reachable under the old identity
    assert_eq!(bob.identify(&id, None).await.unwrap(), "alice");
}

// ============================================================================
// Authentication Gate
// ============================================================================

#[tokio::test]
async fn test_untrusted_requests_are_ignored() {
    let net = TestNet::new();
    let alice = net.client("alice").await;
    let mallory = net.client("mallory").await;
    let mut alice_events = alice.subscribe();
    alice.share_files([text_file("secret.txt", 100, 1)]);

    assert!(
        mallory
            .list_remote_files(alice.public_id(), None)
            .await
            .unwrap_err()
            .is_timeout()
    );
    assert!(
        mallory
            .list_remote_files(alice.public_id(), Some("bogus".into()))
            .await
            .unwrap_err()
            .is_timeout()
    );

    mallory
        .offer_files(alice.public_id(), vec![text_file("junk.bin", 10, 2)])
        .unwrap();
    let offered = next_matching(&mut alice_events, Duration::from_millis(300), |e| {
        matches!(e, ClientEvent::FilesOffered { .. })
    })
    .await;
    assert!(offered.is_none());
    assert_eq!(alice.shared_files().len(), 1);
}

#[tokio::test]
async fn test_concurrent_waits_resolve_independently() {
    let net = TestNet::new();
    let alice = net.client("alice").await;
    let bob = net.client("bob").await;
    let carol = net.client("carol").await;
    net.link(&bob, &alice).await;
    net.link(&carol, &alice).await;
    bob.share_files([text_file("from-bob.txt", 10, 1)]);
    carol.share_files([text_file("from-carol.txt", 10, 2)]);

    let (from_bob, from_carol) = tokio::join!(
        alice.list_remote_files(bob.public_id(), None),
        alice.list_remote_files(carol.public_id(), None),
    );
    assert_eq!(from_bob.unwrap()[0].name, "from-bob.txt");
    assert_eq!(from_carol.unwrap()[0].name, "from-carol.txt");
}

// ============================================================================
// Transfers
// ============================================================================

#[tokio::test]
async fn test_push_transfer_stores_files() {
    init_tracing();
    let net = TestNet::new();
    let (alice, bob) = net.linked_pair().await;
    let mut bob_events = bob.subscribe();
    let mut alice_events = alice.subscribe();

    let small = payload(1000, 1);
    let large = payload(300 * 1024 + 7, 2);
    alice
        .offer_files(
            bob.public_id(),
            vec![
                LocalFile::from_bytes("small.txt", "text/plain", small.clone()),
                LocalFile::from_bytes("large.bin", "application/octet-stream", large.clone()),
            ],
        )
        .unwrap();

    let received = finished(&mut bob_events, Direction::Receive, 2).await;
    for event in &received {
        assert!(
            matches!(event.status, TransferStatus::Completed { file_id: Some(_) }),
            "{event:?}"
        );
        assert_eq!(&event.peer, alice.public_id());
    }
    let sent = finished(&mut alice_events, Direction::Send, 2).await;
    assert!(sent.iter().all(|e| e.status == TransferStatus::Completed { file_id: None }));

    let store = bob.file_store();
    assert_eq!(stored(store, "small.txt").await.unwrap(), small.to_vec());
    assert_eq!(stored(store, "large.bin").await.unwrap(), large.to_vec());

    let records = store.list().await.unwrap();
    let large_record = records.iter().find(|r| r.name == "large.bin").unwrap();
    assert_eq!(large_record.size, large.len() as u64);
    assert_eq!(large_record.mime_type, "application/octet-stream");
    assert_eq!(large_record.owner, alice.public_id().to_string());

    // Sent files are no longer offered
    assert!(alice.shared_files().is_empty());
    assert_eq!(alice.session_state(bob.public_id()), SessionState::Connected);
    assert!(alice.active_transfers().is_empty());
    assert_eq!(bob.pending_transfers(), 0);
}

#[tokio::test]
async fn test_empty_file_transfers() {
    let net = TestNet::new();
    let (alice, bob) = net.linked_pair().await;
    let mut bob_events = bob.subscribe();

    alice
        .offer_files(bob.public_id(), vec![text_file("empty.txt", 0, 0)])
        .unwrap();
    let done = finished(&mut bob_events, Direction::Receive, 1).await;
    assert!(matches!(done[0].status, TransferStatus::Completed { .. }));
    assert_eq!(stored(bob.file_store(), "empty.txt").await.unwrap(), Vec::<u8>::new());
}

#[tokio::test]
async fn test_partial_acceptance() {
    let net = TestNet::new();
    let alice = net.client("alice").await;
    let mut config = TestNet::config("bob");
    config.transfer.auto_accept = false;
    let bob = net
        .client_with(
            config,
            Arc::new(MemoryFileStore::new()),
            Arc::new(MemoryProfileStore::new()),
        )
        .await;
    net.link(&alice, &bob).await;
    let mut bob_events = bob.subscribe();

    alice
        .offer_files(
            bob.public_id(),
            vec![
                text_file("a.txt", 10, 1),
                text_file("b.txt", 20, 2),
                text_file("c.txt", 30, 3),
            ],
        )
        .unwrap();

    let offered = next_matching(&mut bob_events, PATIENCE, |e| {
        matches!(e, ClientEvent::FilesOffered { .. })
    })
    .await;
    let Some(ClientEvent::FilesOffered { peer, files }) = offered else {
        panic!("no offer received");
    };
    assert_eq!(&peer, alice.public_id());
    assert_eq!(files.len(), 3);

    bob.accept_files(&peer, &["b.txt".to_string()]).await.unwrap();
    let done = finished(&mut bob_events, Direction::Receive, 1).await;
    assert_eq!(done[0].file, "b.txt");

    let names: Vec<_> = bob
        .file_store()
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, ["b.txt"]);
    let alice_ref = &alice;
    assert!(wait_until(move || async move { alice_ref.shared_files().len() == 2 }).await);
    let still_shared: Vec<_> = alice.shared_files().into_iter().map(|f| f.name).collect();
    assert_eq!(still_shared, ["a.txt", "c.txt"]);
}

#[tokio::test]
async fn test_request_unknown_file_not_found() {
    let net = TestNet::new();
    let (alice, bob) = net.linked_pair().await;

    let err = bob
        .request_files(alice.public_id(), &["nope.txt".to_string()], None, false)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(bob.request_files(alice.public_id(), &[], None, false).await.is_err());
    assert_eq!(bob.pending_transfers(), 0);
}

#[tokio::test]
async fn test_share_path_pull_transfer() {
    let net = TestNet::new();
    let alice = net.client("alice").await;
    let carol = net.client("carol").await;
    let data = payload(50_000, 9);
    alice.share_files([
        LocalFile::from_bytes("photo.jpg", "image/jpeg", data.clone()),
        text_file("notes.txt", 10, 3),
    ]);

    let path = alice.share_path();
    let (owner, code) = parse_share_path(&path).unwrap();
    assert_eq!(&owner, alice.public_id());

    let listed = carol
        .list_remote_files(&owner, Some(code.clone()))
        .await
        .unwrap();
    let names: Vec<_> = listed.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, ["notes.txt", "photo.jpg"]);

    let mut carol_events = carol.subscribe();
    carol
        .request_files(&owner, &["photo.jpg".to_string()], Some(code), false)
        .await
        .unwrap();
    let done = finished(&mut carol_events, Direction::Receive, 1).await;
    assert!(matches!(done[0].status, TransferStatus::Completed { .. }));
    assert_eq!(stored(carol.file_store(), "photo.jpg").await.unwrap(), data.to_vec());

    // A share code never establishes trust
    assert!(!alice.is_trusted(carol.public_id()));
    assert!(alice.revoke_share_path(&path));
}

#[tokio::test]
async fn test_refresh_renegotiates_link() {
    let net = TestNet::new();
    let (alice, bob) = net.linked_pair().await;
    let mut bob_events = bob.subscribe();

    alice.share_files([text_file("one.txt", 100, 1), text_file("two.txt", 100, 2)]);
    bob.list_remote_files(alice.public_id(), None).await.unwrap();

    bob.request_files(alice.public_id(), &["one.txt".to_string()], None, false)
        .await
        .unwrap();
    finished(&mut bob_events, Direction::Receive, 1).await;
    let offers = net.network.offers_created(alice.public_id(), bob.public_id());
    assert_eq!(offers, 1);

    bob.request_files(alice.public_id(), &["two.txt".to_string()], None, true)
        .await
        .unwrap();
    let done = finished(&mut bob_events, Direction::Receive, 1).await;
    assert!(matches!(done[0].status, TransferStatus::Completed { .. }));
    assert_eq!(
        net.network.offers_created(alice.public_id(), bob.public_id()),
        offers + 1
    );
}

#[tokio::test]
async fn test_shutdown_stops_client() {
    let net = TestNet::new();
    let (alice, bob) = net.linked_pair().await;
    alice.shutdown().await;
    assert!(!alice.is_running());

    assert!(alice.offer_files(bob.public_id(), vec![text_file("x", 1, 1)]).is_err());
    assert!(bob.identify(alice.public_id(), None).await.unwrap_err().is_timeout());
}
