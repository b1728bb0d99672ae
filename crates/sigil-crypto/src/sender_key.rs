//! Group sender key state.
//!
//! A sender key record holds the chain states one sending device uses for a
//! single group distribution. New states are pushed to the front; only the
//! most recent [`MAX_SENDER_KEY_STATES`] are kept.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::{ChainKey, CryptoError, MessageKey, PublicKey, chain::expand};

/// States kept per sender key record.
pub const MAX_SENDER_KEY_STATES: usize = 5;

/// Label binding sender chain derivation
const SENDER_KEY_LABEL: &[u8] = b"sigilSenderKeyV1";

/// One generation of a sender's chain for a distribution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyState {
    key_id: u32,
    chain: ChainKey,
    signing_key: PublicKey,
}

impl SenderKeyState {
    /// Build a state whose chain is derived from `seed`.
    pub fn from_seed(key_id: u32, seed: &[u8; 32], signing_key: PublicKey) -> Self {
        let [chain] = expand::<1>(seed, SENDER_KEY_LABEL);
        Self { key_id, chain: ChainKey::new(chain, 0), signing_key }
    }

    /// Identifier of this state within the distribution.
    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    /// Key that authenticates messages on this chain.
    pub fn signing_key(&self) -> &PublicKey {
        &self.signing_key
    }

    /// Current chain position.
    pub fn iteration(&self) -> u32 {
        self.chain.index()
    }

    /// Step the chain.
    pub fn next_message_key(&mut self) -> Result<MessageKey, CryptoError> {
        self.chain.step()
    }
}

/// All known states for one (sender device, distribution) pair.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyRecord {
    states: VecDeque<SenderKeyState>,
}

impl SenderKeyRecord {
    /// Record containing a single state.
    pub fn new(state: SenderKeyState) -> Self {
        let mut record = Self::default();
        record.add_state(state);
        record
    }

    /// Whether any state is present.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Push a new state, dropping the oldest past the limit.
    pub fn add_state(&mut self, state: SenderKeyState) {
        self.states.retain(|existing| existing.key_id != state.key_id);
        self.states.push_front(state);
        self.states.truncate(MAX_SENDER_KEY_STATES);
    }

    /// Most recent state.
    pub fn current_state(&self) -> Option<&SenderKeyState> {
        self.states.front()
    }

    /// Mutable most recent state.
    pub fn current_state_mut(&mut self) -> Option<&mut SenderKeyState> {
        self.states.front_mut()
    }

    /// State with the given key id.
    pub fn state_for(&mut self, key_id: u32) -> Option<&mut SenderKeyState> {
        self.states.iter_mut().find(|state| state.key_id == key_id)
    }

    /// Encode to CBOR.
    pub fn serialize(&self) -> Result<Vec<u8>, CryptoError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| CryptoError::Serialization(e.to_string()))?;
        Ok(bytes)
    }

    /// Decode from CBOR.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, CryptoError> {
        let record: Self =
            ciborium::from_reader(bytes).map_err(|e| CryptoError::Serialization(e.to_string()))?;
        if record.states.len() > MAX_SENDER_KEY_STATES {
            return Err(CryptoError::Serialization(format!(
                "{} sender key states exceeds limit of {MAX_SENDER_KEY_STATES}",
                record.states.len()
            )));
        }
        Ok(record)
    }
}
