//! Zone coordination through the store.
//!
//! A zone is the unit of atomicity: while one zone is active, operations in
//! another zone wait, and re-entrant calls in the same zone run inline.

use std::{sync::Arc, time::Duration};

use sigil_core::{GLOBAL_ZONE, Zone, ZoneOptions};
use sigil_harness::{
    bootstrap_store,
    fixtures::{identity_key, open_session, session_address},
};
use tokio::sync::Notify;

#[tokio::test]
async fn other_zone_waits_for_active_zone() {
    let store = Arc::new(bootstrap_store(1));
    let alice = session_address("alice", 1);
    let decrypt = Zone::new("decrypt", ZoneOptions::batch_all());
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let holder = tokio::spawn({
        let store = store.clone();
        let alice = alice.clone();
        let (entered, release) = (entered.clone(), release.clone());
        async move {
            store
                .with_zone(&decrypt, "decrypt", || async {
                    store.store_session(&alice, open_session(&identity_key(2), 7), &decrypt).await?;
                    entered.notify_one();
                    release.notified().await;
                    Ok(())
                })
                .await
        }
    });
    entered.notified().await;

    let reader = tokio::spawn({
        let store = store.clone();
        let alice = alice.clone();
        async move { store.load_session(&alice, &GLOBAL_ZONE).await }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!reader.is_finished(), "global zone must wait for the decrypt zone");
    assert_eq!(store.zone_depth(), 1);

    release.notify_one();
    holder.await.unwrap().unwrap();

    let loaded = reader.await.unwrap().unwrap();
    assert!(loaded.is_some(), "reader sees the committed session");
    assert_eq!(store.zone_depth(), 0);
}

#[tokio::test]
async fn reentrant_calls_share_the_zone() {
    let store = bootstrap_store(2);
    let alice = session_address("alice", 1);
    let zone = Zone::new("send", ZoneOptions::batch_all());

    store
        .with_zone(&zone, "outer", || async {
            assert_eq!(store.zone_depth(), 1);
            store
                .with_zone(&zone, "inner", || async {
                    assert_eq!(store.zone_depth(), 2);
                    store.store_session(&alice, open_session(&identity_key(2), 7), &zone).await
                })
                .await?;
            assert_eq!(store.zone_depth(), 1);
            assert_eq!(store.stats().sessions, 0, "inner exit does not commit");
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(store.zone_depth(), 0);
    assert_eq!(store.stats().sessions, 1);
    assert!(store.current_zone().is_none());
}

#[tokio::test]
async fn same_zone_callers_run_together() {
    let store = Arc::new(bootstrap_store(3));
    let zone = Zone::new("send", ZoneOptions::batch_all());
    let both_inside = Arc::new(tokio::sync::Barrier::new(2));

    let tasks: Vec<_> = (1..=2)
        .map(|device| {
            let store = store.clone();
            let zone = zone.clone();
            let both_inside = both_inside.clone();
            tokio::spawn(async move {
                store
                    .with_zone(&zone, "send", || async {
                        // Deadlocks unless both callers are admitted at once.
                        both_inside.wait().await;
                        let address = session_address("alice", device);
                        let record = open_session(&identity_key(2), 7);
                        store.store_session(&address, record, &zone).await
                    })
                    .await
            })
        })
        .collect();

    for task in tasks {
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
    }
    assert_eq!(store.stats().sessions, 2);
}
