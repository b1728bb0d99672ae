//! Per-peer job queues as seen through the store.
//!
//! Runs on paused tokio time, so sleeps inside jobs cost nothing and the job
//! timeout fires deterministically.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use sigil_core::{GLOBAL_ZONE, MemoryStorage, StoreConfig, StoreError};
use sigil_harness::{
    SimEnv, bootstrap_store, bootstrap_store_with,
    fixtures::{identity_key, open_session, peer, session_address},
};
use tokio::sync::Notify;

#[tokio::test(start_paused = true)]
async fn jobs_for_one_device_run_in_submission_order() {
    let store = Arc::new(bootstrap_store(1));
    let alice = session_address("alice", 1);
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut tasks = Vec::new();
    for index in 0..5u64 {
        let (store, alice, order) = (store.clone(), alice.clone(), order.clone());
        tasks.push(tokio::spawn(async move {
            store
                .enqueue_session_job(&alice, &GLOBAL_ZONE, || async {
                    // Earlier jobs sleep longer; order must still hold.
                    tokio::time::sleep(Duration::from_millis(50 - index * 10)).await;
                    order.lock().unwrap().push(index);
                    Ok(())
                })
                .await
        }));
        tokio::task::yield_now().await;
    }

    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn different_devices_run_concurrently() {
    let store = Arc::new(bootstrap_store(2));
    let first_running = Arc::new(Notify::new());

    let waiter = tokio::spawn({
        let store = store.clone();
        let first_running = first_running.clone();
        async move {
            store
                .enqueue_session_job(&session_address("alice", 1), &GLOBAL_ZONE, || async {
                    first_running.notified().await;
                    Ok(())
                })
                .await
        }
    });
    tokio::task::yield_now().await;

    store
        .enqueue_session_job(&session_address("alice", 2), &GLOBAL_ZONE, || async {
            first_running.notify_one();
            Ok(())
        })
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn slow_job_times_out_and_releases_the_device() {
    let config = StoreConfig { job_timeout: Duration::from_secs(60), ..StoreConfig::default() };
    let store = bootstrap_store_with(SimEnv::with_seed(3), MemoryStorage::new(), config);
    let alice = session_address("alice", 1);

    let result = store
        .enqueue_session_job(&alice, &GLOBAL_ZONE, || async {
            tokio::time::sleep(Duration::from_secs(61)).await;
            Ok(())
        })
        .await;

    match result {
        Err(StoreError::Timeout { queue, after }) => {
            assert_eq!(queue, alice.to_string());
            assert_eq!(after, Duration::from_secs(60));
        },
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(store.zone_depth(), 0);

    let value = store.enqueue_session_job(&alice, &GLOBAL_ZONE, || async { Ok(7) }).await;
    assert_eq!(value.unwrap(), 7);
}

#[tokio::test]
async fn nested_job_for_same_device_runs_inline() {
    let store = bootstrap_store(4);
    let alice = session_address("alice", 1);

    let stored = tokio::time::timeout(
        Duration::from_secs(5),
        store.enqueue_session_job(&alice, &GLOBAL_ZONE, || async {
            store.store_session(&alice, open_session(&identity_key(2), 3), &GLOBAL_ZONE).await?;
            // Same device as the running job.
            store.archive_session(&alice, &GLOBAL_ZONE).await?;
            store.load_session(&alice, &GLOBAL_ZONE).await
        }),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(stored.is_some_and(|record| !record.has_current_state()));
}

#[tokio::test(start_paused = true)]
async fn sibling_archives_from_two_device_jobs_both_finish() {
    let config = StoreConfig { job_timeout: Duration::from_secs(1), ..StoreConfig::default() };
    let store = bootstrap_store_with(SimEnv::with_seed(6), MemoryStorage::new(), config);
    for device in 1..=3 {
        let record = open_session(&identity_key(2), device);
        store.store_session(&session_address("alice", device), record, &GLOBAL_ZONE).await.unwrap();
    }

    let archive_siblings = |device: u32| {
        let store = &store;
        async move {
            store
                .enqueue_session_job(&session_address("alice", device), &GLOBAL_ZONE, || async {
                    // Both jobs hold their own device before reaching for the other's.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    store.archive_sibling_sessions(&peer("alice", device), &GLOBAL_ZONE).await
                })
                .await
        }
    };
    let (first, second) = tokio::join!(archive_siblings(1), archive_siblings(2));

    first.unwrap();
    second.unwrap();
    for device in 1..=3 {
        let record = store
            .load_session(&session_address("alice", device), &GLOBAL_ZONE)
            .await
            .unwrap()
            .unwrap();
        assert!(!record.has_current_state(), "alice.{device} archived");
    }
}

#[tokio::test(start_paused = true)]
async fn sender_key_jobs_are_serialized_per_key() {
    let store = Arc::new(bootstrap_store(5));
    let running = Arc::new(Mutex::new(0usize));
    let peak = Arc::new(Mutex::new(0usize));

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let (store, running, peak) = (store.clone(), running.clone(), peak.clone());
            tokio::spawn(async move {
                store
                    .enqueue_sender_key_job("alice.1::dist", &GLOBAL_ZONE, || async {
                        {
                            let mut now = running.lock().unwrap();
                            *now += 1;
                            let mut max = peak.lock().unwrap();
                            *max = (*max).max(*now);
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        *running.lock().unwrap() -= 1;
                        Ok(())
                    })
                    .await
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(*peak.lock().unwrap(), 1);
}
