//! Identity key changes and trust decisions.
//!
//! A replaced key is persisted, reported once and archives the sessions with
//! the account's other devices. Sending then needs the change acknowledged.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use sigil_core::{
    Direction, EventKind, GLOBAL_ZONE, StoreError, StoreEvent, TrustError, VerifiedStatus,
};
use sigil_harness::{
    SimStore, bootstrap_store,
    fixtures::{identity_key, open_session, peer, service, session_address},
};

fn record_events(store: &SimStore) -> (Arc<Mutex<Vec<StoreEvent>>>, sigil_core::Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscription = store.subscribe(EventKind::KeyChange, {
        let seen = seen.clone();
        move |event| seen.lock().unwrap().push(event.clone())
    });
    (seen, subscription)
}

async fn open_devices(store: &SimStore, peer_id: &str, devices: u32) {
    for device in 1..=devices {
        let address = session_address(peer_id, device);
        store.store_session(&address, open_session(&identity_key(2), device), &GLOBAL_ZONE)
            .await
            .unwrap();
    }
}

async fn is_open(store: &SimStore, peer_id: &str, device: u32) -> bool {
    store
        .load_session(&session_address(peer_id, device), &GLOBAL_ZONE)
        .await
        .unwrap()
        .is_some_and(|record| record.has_current_state())
}

fn trust_error(result: Result<(), StoreError>) -> Option<TrustError> {
    match result {
        Ok(()) => None,
        Err(StoreError::Trust { reason, .. }) => Some(reason),
        Err(err) => panic!("unexpected error: {err}"),
    }
}

#[tokio::test]
async fn key_change_archives_siblings_and_fires_once() {
    let store = bootstrap_store(1);
    let (events, _subscription) = record_events(&store);
    open_devices(&store, "alice", 3).await;

    let first = identity_key(2).public_key();
    assert!(!store.save_identity(&peer("alice", 1), &first, false, &GLOBAL_ZONE).await.unwrap());
    assert!(events.lock().unwrap().is_empty(), "first key is not a change");

    let second = identity_key(3).public_key();
    assert!(store.save_identity(&peer("alice", 1), &second, false, &GLOBAL_ZONE).await.unwrap());

    assert_eq!(
        *events.lock().unwrap(),
        vec![StoreEvent::KeyChange { service_id: service("alice"), reason: "save_identity" }]
    );
    assert!(is_open(&store, "alice", 1).await, "device that presented the key stays open");
    assert!(!is_open(&store, "alice", 2).await);
    assert!(!is_open(&store, "alice", 3).await);
    assert_eq!(store.load_identity_key(&service("alice")).unwrap(), Some(second));

    assert!(!store.save_identity(&peer("alice", 2), &second, false, &GLOBAL_ZONE).await.unwrap());
    assert_eq!(events.lock().unwrap().len(), 1, "same key again is not a change");
}

#[tokio::test]
async fn verified_becomes_unverified_on_change() {
    let store = bootstrap_store(2);
    let alice = service("alice");
    let bob = service("bob");

    for name in ["alice", "bob"] {
        let key = identity_key(2).public_key();
        store.save_identity(&peer(name, 1), &key, false, &GLOBAL_ZONE).await.unwrap();
    }
    store.set_verified(&alice, VerifiedStatus::Verified).unwrap();

    for name in ["alice", "bob"] {
        let key = identity_key(3).public_key();
        assert!(store.save_identity(&peer(name, 1), &key, false, &GLOBAL_ZONE).await.unwrap());
    }

    assert_eq!(store.get_verified(&alice).unwrap(), VerifiedStatus::Unverified);
    assert_eq!(store.get_verified(&bob).unwrap(), VerifiedStatus::Default);
    assert!(store.is_untrusted(&alice).unwrap());
}

#[tokio::test]
async fn recent_change_needs_approval_to_send() {
    let store = bootstrap_store(3);
    let alice = service("alice");
    let (old, new) = (identity_key(2).public_key(), identity_key(3).public_key());
    store.save_identity(&peer("alice", 1), &old, false, &GLOBAL_ZONE).await.unwrap();
    assert_eq!(trust_error(store.check_trusted_for_sending(&alice, &old)), None);

    store.save_identity(&peer("alice", 1), &new, false, &GLOBAL_ZONE).await.unwrap();

    assert_eq!(
        trust_error(store.check_trusted_for_sending(&alice, &old)),
        Some(TrustError::KeyMismatch)
    );
    assert_eq!(
        trust_error(store.check_trusted_for_sending(&alice, &new)),
        Some(TrustError::ApprovalRequired)
    );
    assert!(store.is_untrusted(&alice).unwrap());
    assert!(store.is_trusted_identity(&alice, &new, Direction::Receiving).unwrap());
    assert!(!store.is_trusted_identity(&alice, &new, Direction::Sending).unwrap());

    store.set_approval(&alice, true).unwrap();
    assert_eq!(trust_error(store.check_trusted_for_sending(&alice, &new)), None);
}

#[tokio::test]
async fn approval_window_expires() {
    let store = bootstrap_store(4);
    let alice = service("alice");
    let (old, new) = (identity_key(2).public_key(), identity_key(3).public_key());
    store.save_identity(&peer("alice", 1), &old, false, &GLOBAL_ZONE).await.unwrap();
    store.save_identity(&peer("alice", 1), &new, false, &GLOBAL_ZONE).await.unwrap();
    assert!(store.is_untrusted(&alice).unwrap());

    store.env().advance(store.config().approval_window + Duration::from_secs(1));

    assert!(!store.is_untrusted(&alice).unwrap());
    assert_eq!(trust_error(store.check_trusted_for_sending(&alice, &new)), None);
}

#[tokio::test]
async fn unverified_blocks_sending() {
    let store = bootstrap_store(5);
    let alice = service("alice");
    let key = identity_key(2).public_key();
    store.save_identity(&peer("alice", 1), &key, false, &GLOBAL_ZONE).await.unwrap();

    store.set_verified(&alice, VerifiedStatus::Unverified).unwrap();

    assert_eq!(
        trust_error(store.check_trusted_for_sending(&alice, &key)),
        Some(TrustError::Unverified)
    );
    assert!(store.is_untrusted(&alice).unwrap());
}

#[tokio::test]
async fn own_account_key_change_is_ignored() {
    let store = bootstrap_store(6);
    let (events, _subscription) = record_events(&store);
    let me = service("me");
    let ours = identity_key(1).public_key();
    store.save_identity(&peer("me", 2), &ours, false, &GLOBAL_ZONE).await.unwrap();

    let other = identity_key(9).public_key();
    assert!(!store.save_identity(&peer("me", 2), &other, false, &GLOBAL_ZONE).await.unwrap());

    assert_eq!(store.load_identity_key(&me).unwrap(), Some(ours));
    assert!(events.lock().unwrap().is_empty());
    assert!(store.is_trusted_identity(&me, &ours, Direction::Sending).unwrap());
    assert!(!store.is_trusted_identity(&me, &other, Direction::Receiving).unwrap());
}

#[tokio::test]
async fn verified_sync_with_new_key_archives_every_session() {
    let store = bootstrap_store(7);
    let (events, _subscription) = record_events(&store);
    let alice = service("alice");
    open_devices(&store, "alice", 2).await;
    let old = identity_key(2).public_key();
    store.save_identity(&peer("alice", 1), &old, false, &GLOBAL_ZONE).await.unwrap();

    let new = identity_key(3).public_key();
    let changed =
        store.process_verified_message(&alice, VerifiedStatus::Verified, &new).await.unwrap();

    assert!(changed);
    assert_eq!(store.get_verified(&alice).unwrap(), VerifiedStatus::Verified);
    assert_eq!(store.load_identity_key(&alice).unwrap(), Some(new));
    assert!(!is_open(&store, "alice", 1).await);
    assert!(!is_open(&store, "alice", 2).await);
    assert_eq!(
        *events.lock().unwrap(),
        vec![StoreEvent::KeyChange { service_id: alice, reason: "verified" }]
    );
}

#[tokio::test]
async fn default_sync_for_unknown_account_is_ignored() {
    let store = bootstrap_store(8);
    let alice = service("alice");
    let key = identity_key(2).public_key();

    let changed =
        store.process_verified_message(&alice, VerifiedStatus::Default, &key).await.unwrap();

    assert!(!changed);
    assert!(store.get_identity_record(&alice).unwrap().is_none());
}

#[tokio::test]
async fn unverified_sync_with_same_key_only_changes_status() {
    let store = bootstrap_store(9);
    let alice = service("alice");
    open_devices(&store, "alice", 1).await;
    let key = identity_key(2).public_key();
    store.save_identity(&peer("alice", 1), &key, false, &GLOBAL_ZONE).await.unwrap();
    store.set_verified(&alice, VerifiedStatus::Verified).unwrap();

    let changed =
        store.process_unverified_message(&alice, VerifiedStatus::Unverified, &key).await.unwrap();

    assert!(!changed);
    assert_eq!(store.get_verified(&alice).unwrap(), VerifiedStatus::Unverified);
    assert!(is_open(&store, "alice", 1).await, "status change keeps sessions");
}

#[tokio::test]
async fn status_queries_need_a_record() {
    let store = bootstrap_store(10);
    let carol = service("carol");

    assert!(store.get_verified(&carol).unwrap_err().is_not_found());
    assert!(store.is_untrusted(&carol).unwrap_err().is_not_found());
    assert!(store.set_verified(&carol, VerifiedStatus::Verified).unwrap_err().is_not_found());
    let key = identity_key(4).public_key();
    assert_eq!(trust_error(store.check_trusted_for_sending(&carol, &key)), None);
}

#[tokio::test]
async fn removing_identity_drops_sessions() {
    let store = bootstrap_store(11);
    let alice = service("alice");
    open_devices(&store, "alice", 2).await;
    let key = identity_key(2).public_key();
    store.save_identity(&peer("alice", 1), &key, false, &GLOBAL_ZONE).await.unwrap();

    store.remove_identity_key(&alice).await.unwrap();

    assert!(store.get_identity_record(&alice).unwrap().is_none());
    assert!(!store.has_session_with(&alice));
}
