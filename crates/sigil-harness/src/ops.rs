//! Operations for model-based store testing.
//!
//! Operations are generated by proptest or the fuzzer and applied to both a
//! [`ProtocolStore`] and a [`SessionModel`]. The model only tracks which
//! sessions exist and whether each is open, which is everything the zone,
//! queue and identity rules can change.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use arbitrary::Arbitrary;
use sigil_core::{
    Environment, GLOBAL_ZONE, LightResetOutcome, MemoryStorage, ProtocolStore, StoreError, VerifiedStatus,
    Zone, ZoneOptions,
};
use tracing::debug;

use crate::{
    SimEnv,
    fixtures::{
        ScriptedSender, envelope, identity_key, me, open_session, peer, service, session_address,
    },
};

/// Peers are drawn from a small fixed set.
const PEERS: [&str; 3] = ["alice", "bob", "carol"];

/// Devices per peer.
const DEVICES: u8 = 2;

/// Peer selector (reduced modulo the peer count).
pub type PeerSlot = u8;

/// Device selector (reduced modulo the device count).
pub type DeviceSlot = u8;

/// Operations that can be applied to the store.
#[derive(Debug, Clone, Arbitrary)]
pub enum StoreOp {
    /// Save an open session, outside any batching zone.
    StoreSession {
        /// Peer
        peer: PeerSlot,
        /// Device
        device: DeviceSlot,
    },

    /// Decrypt-style zone: save an open session and an envelope together.
    BatchedDecrypt {
        /// Peer
        peer: PeerSlot,
        /// Device
        device: DeviceSlot,
        /// Whether the zone body fails after staging
        fail: bool,
    },

    /// Archive one session.
    ArchiveSession {
        /// Peer
        peer: PeerSlot,
        /// Device
        device: DeviceSlot,
    },

    /// Archive every session with a peer.
    ArchiveAllSessions {
        /// Peer
        peer: PeerSlot,
    },

    /// Hard delete one session.
    RemoveSession {
        /// Peer
        peer: PeerSlot,
        /// Device
        device: DeviceSlot,
    },

    /// Hard delete every session with a peer.
    RemoveAllSessions {
        /// Peer
        peer: PeerSlot,
    },

    /// Record an identity key seen from a peer device.
    SaveIdentity {
        /// Peer
        peer: PeerSlot,
        /// Device the key was seen on
        device: DeviceSlot,
        /// Which of a few keys
        key: u8,
    },

    /// Mark a peer verified or unverified.
    SetVerified {
        /// Peer
        peer: PeerSlot,
        /// Whether to verify
        verified: bool,
    },

    /// Light session reset with a null message that succeeds or fails.
    LightReset {
        /// Peer
        peer: PeerSlot,
        /// Device
        device: DeviceSlot,
        /// Whether the null message is delivered
        delivered: bool,
    },

    /// Move the wall clock forward.
    AdvanceClock {
        /// Minutes to advance
        minutes: u8,
    },
}

/// Reference state: every known session and whether it is open.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionModel {
    sessions: BTreeMap<(usize, u32), bool>,
    identities: BTreeMap<usize, u8>,
    envelopes: BTreeSet<String>,
    next_envelope: u64,
}

impl SessionModel {
    /// Sessions as `(peer, device, open)`.
    pub fn sessions(&self) -> Vec<(&'static str, u32, bool)> {
        self.sessions.iter().map(|(&(p, d), &open)| (PEERS[p], d, open)).collect()
    }

    /// Number of envelopes the model expects on disk.
    pub fn envelope_count(&self) -> usize {
        self.envelopes.len()
    }

    fn archive(&mut self, peer: usize, device: u32) {
        if let Some(open) = self.sessions.get_mut(&(peer, device)) {
            *open = false;
        }
    }

    fn archive_peer(&mut self, peer: usize, except: Option<u32>) {
        for ((p, d), open) in &mut self.sessions {
            if *p == peer && Some(*d) != except {
                *open = false;
            }
        }
    }
}

fn peer_index(slot: PeerSlot) -> usize {
    usize::from(slot) % PEERS.len()
}

fn device_id(slot: DeviceSlot) -> u32 {
    u32::from(slot % DEVICES) + 1
}

/// Apply `op` to the store and the model.
///
/// # Errors
///
/// Returns store errors other than the injected failure of
/// [`StoreOp::BatchedDecrypt`].
pub async fn apply(
    store: &ProtocolStore<SimEnv, MemoryStorage>,
    model: &mut SessionModel,
    op: &StoreOp,
) -> Result<(), StoreError> {
    debug!(?op, "applying store operation");
    match *op {
        StoreOp::StoreSession { peer: p, device } => {
            let (p, d) = (peer_index(p), device_id(device));
            let address = session_address(PEERS[p], d);
            store.store_session(&address, open_session(&identity_key(10), d), &GLOBAL_ZONE).await?;
            model.sessions.insert((p, d), true);
        },

        StoreOp::BatchedDecrypt { peer: p, device, fail } => {
            let (p, d) = (peer_index(p), device_id(device));
            let address = session_address(PEERS[p], d);
            let id = format!("envelope-{}", model.next_envelope);
            model.next_envelope += 1;

            let zone = Zone::new("decrypt", ZoneOptions::batch_all());
            let result = store
                .with_zone(&zone, "decrypt", || async {
                    store.store_session(&address, open_session(&identity_key(10), d), &zone).await?;
                    store.add_unprocessed(envelope(&id, store.env().wall_clock_ms()), &zone).await?;
                    if fail {
                        return Err(StoreError::Corruption("undecryptable envelope".into()));
                    }
                    Ok(())
                })
                .await;

            match result {
                Ok(()) => {
                    model.sessions.insert((p, d), true);
                    model.envelopes.insert(id);
                },
                Err(StoreError::Corruption(_)) if fail => {},
                Err(err) => return Err(err),
            }
        },

        StoreOp::ArchiveSession { peer: p, device } => {
            let (p, d) = (peer_index(p), device_id(device));
            store.archive_session(&session_address(PEERS[p], d), &GLOBAL_ZONE).await?;
            model.archive(p, d);
        },

        StoreOp::ArchiveAllSessions { peer: p } => {
            let p = peer_index(p);
            store.archive_all_sessions(&service(PEERS[p]), &GLOBAL_ZONE).await?;
            model.archive_peer(p, None);
        },

        StoreOp::RemoveSession { peer: p, device } => {
            let (p, d) = (peer_index(p), device_id(device));
            store.remove_session(&session_address(PEERS[p], d)).await?;
            model.sessions.remove(&(p, d));
        },

        StoreOp::RemoveAllSessions { peer: p } => {
            let p = peer_index(p);
            store.remove_sessions_by_service_id(&service(PEERS[p])).await?;
            model.sessions.retain(|&(peer, _), _| peer != p);
        },

        StoreOp::SaveIdentity { peer: p, device, key } => {
            let (p, d) = (peer_index(p), device_id(device));
            let key = 20 + key % 3;
            let public_key = identity_key(key).public_key();
            let changed =
                store.save_identity(&peer(PEERS[p], d), &public_key, false, &GLOBAL_ZONE).await?;

            let expected = model.identities.get(&p).is_some_and(|&previous| previous != key);
            assert_eq!(changed, expected, "key change detection for {}", PEERS[p]);
            if changed {
                model.archive_peer(p, Some(d));
            }
            model.identities.insert(p, key);
        },

        StoreOp::SetVerified { peer: p, verified } => {
            let p = peer_index(p);
            let status =
                if verified { VerifiedStatus::Verified } else { VerifiedStatus::Unverified };
            match store.set_verified(&service(PEERS[p]), status) {
                Ok(()) => {},
                Err(err) if err.is_not_found() => {
                    assert!(!model.identities.contains_key(&p));
                },
                Err(err) => return Err(err),
            }
        },

        StoreOp::LightReset { peer: p, device, delivered } => {
            let (p, d) = (peer_index(p), device_id(device));
            let sender = ScriptedSender::scripted([delivered]);
            let outcome = store.light_session_reset(&session_address(PEERS[p], d), &sender).await?;
            match outcome {
                LightResetOutcome::Skipped { .. } => assert!(sender.sent().is_empty()),
                LightResetOutcome::Reset | LightResetOutcome::Failed { .. } => {
                    assert_eq!(sender.sent(), vec![service(PEERS[p])]);
                    model.archive(p, d);
                },
            }
        },

        StoreOp::AdvanceClock { minutes } => {
            store.env().advance(Duration::from_secs(u64::from(minutes) * 60));
        },
    }
    Ok(())
}

/// Compare the store with the model.
///
/// # Errors
///
/// Returns a description of the first mismatch.
pub async fn check(
    store: &ProtocolStore<SimEnv, MemoryStorage>,
    model: &SessionModel,
) -> Result<(), String> {
    if store.zone_depth() != 0 {
        return Err(format!("zone depth {} after operation", store.zone_depth()));
    }

    for (p, name) in PEERS.iter().enumerate() {
        for d in 1..=u32::from(DEVICES) {
            let address = session_address(name, d);
            let actual = store
                .load_session(&address, &GLOBAL_ZONE)
                .await
                .map_err(|err| format!("load {address}: {err}"))?
                .map(|record| record.has_current_state());
            let expected = model.sessions.get(&(p, d)).copied();
            if actual != expected {
                return Err(format!("{address}: store {actual:?}, model {expected:?}"));
            }
        }
    }

    let envelopes = store.get_unprocessed_count().map_err(|err| err.to_string())?;
    if envelopes != model.envelope_count() {
        return Err(format!("{envelopes} envelopes, model has {}", model.envelope_count()));
    }

    let open = store
        .get_open_devices(&me(), &PEERS.map(service), &GLOBAL_ZONE)
        .await
        .map_err(|err| err.to_string())?;
    let expected_open = model.sessions.values().filter(|open| **open).count();
    if open.devices.len() != expected_open {
        return Err(format!("{} open devices, model has {expected_open}", open.devices.len()));
    }
    Ok(())
}
