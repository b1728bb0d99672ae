//! Sigil protocol store.
//!
//! Persists and serves the state of end-to-end encrypted messaging: peer
//! identity keys, pairwise sessions, pre-keys, signed pre-keys, group sender
//! keys and envelopes awaiting decryption. Coordinates overlapping async
//! operations (decrypt, send, key rotation, session reset) so that each one
//! sees and commits a consistent view.
//!
//! # Architecture
//!
//! ```text
//!  caller ──► ProtocolStore
//!               │
//!               ├── ZoneCoordinator   one active zone, staged writes
//!               ├── JobQueues         FIFO per peer device / sender key
//!               ├── RecordCache       raw rows hydrated on first use
//!               ├── EventBus          key change, pre-key removal, wipe
//!               └── Storage           memory, redb, or chaos-injecting
//! ```
//!
//! # Components
//!
//! - [`ProtocolStore`]: Every store operation, generic over
//!   [`Environment`] and [`Storage`]
//! - [`Zone`]: Transaction scope; [`GLOBAL_ZONE`] commits immediately
//! - [`identity`]: Trust rules for peer identity keys (pure functions)
//! - [`sender_key_info`]: Group sender key distribution planning
//! - [`SystemEnv`]: Production environment (system clock, OS randomness)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod env;
mod error;
pub mod events;
pub mod identity;
pub mod ids;
pub mod queue;
pub mod records;
pub mod sender_key_info;
pub mod storage;
mod store;
mod system_env;
pub mod zone;

pub use config::StoreConfig;
pub use env::Environment;
pub use error::{StoreError, TrustError};
pub use events::{EventBus, EventKind, StoreEvent, Subscription};
pub use identity::{Direction, IdentityKeyRecord, VerifiedStatus};
pub use ids::{Address, DeviceId, DistributionId, QualifiedAddress, ServiceId};
pub use sender_key_info::{DeviceDiff, DistributionPlan, ResetReason};
pub use storage::{ChaoticStorage, MemoryStorage, RedbStorage, Storage, StorageError};
pub use store::{
    LightResetOutcome, MAX_KEY_ID, NullMessageSender, OpenDevice, OpenDevices, ProtocolStore,
    SignedPreKey, StoreStats,
};
pub use system_env::SystemEnv;
pub use zone::{GLOBAL_ZONE, Zone, ZoneOptions};
