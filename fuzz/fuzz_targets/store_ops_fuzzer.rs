//! Fuzz target for store operation sequences
//!
//! Applies arbitrary operation sequences to a store and a reference model,
//! checking they agree after every step.
//!
//! # Invariants
//!
//! - Operations NEVER panic and never return unexpected errors
//! - Zone depth returns to zero after every operation
//! - Open and archived sessions match the model
//! - Failed batched zones leave no session or envelope behind

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use sigil_harness::{SessionModel, StoreOp, apply, bootstrap_store, check};

#[derive(Debug, Arbitrary)]
struct Scenario {
    seed: u64,
    ops: Vec<StoreOp>,
}

fuzz_target!(|scenario: Scenario| {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime builds");

    runtime.block_on(async {
        let store = bootstrap_store(scenario.seed);
        let mut model = SessionModel::default();

        for op in scenario.ops.iter().take(64) {
            apply(&store, &mut model, op).await.expect("operation succeeds");
            if let Err(mismatch) = check(&store, &model).await {
                panic!("{op:?}: {mismatch}");
            }
        }
    });
});
