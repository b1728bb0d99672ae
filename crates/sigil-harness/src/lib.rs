//! Deterministic simulation harness for Sigil protocol store testing.
//!
//! [`SimEnv`] replaces the system clock and RNG with a seeded, manually
//! advanced environment so every store run is reproducible from its seed.
//!
//! # Model-Based Testing
//!
//! The `ops` module generates [`StoreOp`] sequences and applies them to both a
//! real store and a [`SessionModel`]; after each operation the two must agree
//! on which sessions exist, which are open, and how many envelopes are
//! queued.
//!
//! # Fixtures
//!
//! The `fixtures` module builds identities, sessions, legacy records and a
//! bootstrapped store, plus a [`ScriptedSender`] for light reset tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod ops;
pub mod sim_env;

pub use fixtures::{ScriptedSender, SimStore, bootstrap_store, bootstrap_store_with};
pub use ops::{SessionModel, StoreOp, apply, check};
pub use sim_env::{SIM_EPOCH_MS, SimEnv};
