//! Model-based testing of the store.
//!
//! Random operation sequences run against a store and a reference model; the
//! visible session state must agree after every step.

use proptest::prelude::*;
use sigil_harness::{SessionModel, StoreOp, apply, bootstrap_store, check};

fn op_strategy() -> impl Strategy<Value = StoreOp> {
    let slot = || 0u8..6;
    prop_oneof![
        3 => (slot(), slot()).prop_map(|(peer, device)| StoreOp::StoreSession { peer, device }),
        3 => (slot(), slot(), any::<bool>())
            .prop_map(|(peer, device, fail)| StoreOp::BatchedDecrypt { peer, device, fail }),
        2 => (slot(), slot()).prop_map(|(peer, device)| StoreOp::ArchiveSession { peer, device }),
        1 => slot().prop_map(|peer| StoreOp::ArchiveAllSessions { peer }),
        1 => (slot(), slot()).prop_map(|(peer, device)| StoreOp::RemoveSession { peer, device }),
        1 => slot().prop_map(|peer| StoreOp::RemoveAllSessions { peer }),
        2 => (slot(), slot(), any::<u8>())
            .prop_map(|(peer, device, key)| StoreOp::SaveIdentity { peer, device, key }),
        1 => (slot(), any::<bool>())
            .prop_map(|(peer, verified)| StoreOp::SetVerified { peer, verified }),
        2 => (slot(), slot(), any::<bool>())
            .prop_map(|(peer, device, delivered)| StoreOp::LightReset { peer, device, delivered }),
        1 => (0u8..=90).prop_map(|minutes| StoreOp::AdvanceClock { minutes }),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_store_matches_model(
        seed in any::<u64>(),
        ops in prop::collection::vec(op_strategy(), 1..60),
    ) {
        runtime().block_on(async {
            let store = bootstrap_store(seed);
            let mut model = SessionModel::default();

            for (step, op) in ops.iter().enumerate() {
                apply(&store, &mut model, op)
                    .await
                    .map_err(|err| TestCaseError::fail(format!("step {step} {op:?}: {err}")))?;
                check(&store, &model)
                    .await
                    .map_err(|err| TestCaseError::fail(format!("step {step} {op:?}: {err}")))?;
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}

#[tokio::test]
async fn key_change_then_reset_sequence() {
    let store = bootstrap_store(7);
    let mut model = SessionModel::default();
    let ops = [
        StoreOp::StoreSession { peer: 0, device: 0 },
        StoreOp::StoreSession { peer: 0, device: 1 },
        StoreOp::SaveIdentity { peer: 0, device: 0, key: 0 },
        StoreOp::SaveIdentity { peer: 0, device: 0, key: 1 },
        StoreOp::LightReset { peer: 0, device: 0, delivered: false },
        StoreOp::LightReset { peer: 0, device: 0, delivered: true },
        StoreOp::BatchedDecrypt { peer: 1, device: 0, fail: true },
        StoreOp::BatchedDecrypt { peer: 1, device: 1, fail: false },
    ];

    for op in &ops {
        apply(&store, &mut model, op).await.unwrap();
        check(&store, &model).await.unwrap();
    }

    assert_eq!(
        model.sessions(),
        vec![("alice", 1, false), ("alice", 2, false), ("bob", 2, true)]
    );
    assert_eq!(model.envelope_count(), 1);
}
