//! Pairwise session state.
//!
//! A [`SessionRecord`] holds at most one current [`SessionState`] plus a
//! bounded list of archived states. Archiving clears the current state so no
//! new messages are encrypted with it, while the archived chains still
//! decrypt messages that were already in flight.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{
    ChainKey, CryptoError, MessageKey, PublicKey,
    chain::expand,
};

/// Protocol version written into new session states.
pub const SESSION_PROTOCOL_VERSION: u8 = 3;

/// Archived states kept per record; older ones are dropped.
pub const MAX_ARCHIVED_STATES: usize = 40;

/// Label binding session key expansion
const SESSION_LABEL: &[u8] = b"sigilSessionV1";

/// Inputs for a freshly negotiated session.
///
/// `shared_secret` is the agreed secret from the key exchange. Both sides
/// pass the same secret; `initiator` decides which derived chain sends.
#[derive(Clone)]
pub struct SessionParams {
    /// Our identity public key
    pub local_identity: PublicKey,
    /// The peer's identity public key
    pub remote_identity: PublicKey,
    /// Our registration id
    pub local_registration_id: u32,
    /// The peer's registration id
    pub remote_registration_id: u32,
    /// Secret agreed during the handshake
    pub shared_secret: [u8; 32],
    /// Whether we started the handshake
    pub initiator: bool,
}

impl Drop for SessionParams {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
    }
}

/// One ratchet state between us and a single peer device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    version: u8,
    local_identity: PublicKey,
    remote_identity: PublicKey,
    local_registration_id: u32,
    remote_registration_id: u32,
    root_key: [u8; 32],
    sending_chain: ChainKey,
    receiving_chain: Option<ChainKey>,
    previous_counter: u32,
}

impl SessionState {
    /// Derive a new state from handshake output.
    pub fn initialize(params: &SessionParams) -> Self {
        let [root_key, chain_a, chain_b] = expand::<3>(&params.shared_secret, SESSION_LABEL);
        let (sending, receiving) =
            if params.initiator { (chain_a, chain_b) } else { (chain_b, chain_a) };

        Self {
            version: SESSION_PROTOCOL_VERSION,
            local_identity: params.local_identity,
            remote_identity: params.remote_identity,
            local_registration_id: params.local_registration_id,
            remote_registration_id: params.remote_registration_id,
            root_key,
            sending_chain: ChainKey::new(sending, 0),
            receiving_chain: Some(ChainKey::new(receiving, 0)),
            previous_counter: 0,
        }
    }

    /// Assemble a state from already-derived parts.
    ///
    /// Used when converting older record layouts.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        local_identity: PublicKey,
        remote_identity: PublicKey,
        local_registration_id: u32,
        remote_registration_id: u32,
        root_key: [u8; 32],
        sending_chain: ChainKey,
        receiving_chain: Option<ChainKey>,
        previous_counter: u32,
    ) -> Self {
        Self {
            version: SESSION_PROTOCOL_VERSION,
            local_identity,
            remote_identity,
            local_registration_id,
            remote_registration_id,
            root_key,
            sending_chain,
            receiving_chain,
            previous_counter,
        }
    }

    /// Protocol version of this state.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Our identity key at the time the session was established.
    pub fn local_identity(&self) -> &PublicKey {
        &self.local_identity
    }

    /// The peer's identity key.
    pub fn remote_identity(&self) -> &PublicKey {
        &self.remote_identity
    }

    /// Our registration id.
    pub fn local_registration_id(&self) -> u32 {
        self.local_registration_id
    }

    /// The peer's registration id.
    pub fn remote_registration_id(&self) -> u32 {
        self.remote_registration_id
    }

    /// Number of messages sent on the previous sending chain.
    pub fn previous_counter(&self) -> u32 {
        self.previous_counter
    }

    /// Position of the sending chain.
    pub fn sending_index(&self) -> u32 {
        self.sending_chain.index()
    }

    /// Step the sending chain, returning the key for the next outgoing message.
    pub fn next_sending_key(&mut self) -> Result<MessageKey, CryptoError> {
        self.sending_chain.step()
    }

    /// Step the receiving chain, returning the key for the next incoming message.
    pub fn next_receiving_key(&mut self) -> Result<MessageKey, CryptoError> {
        match self.receiving_chain.as_mut() {
            Some(chain) => chain.step(),
            None => Err(CryptoError::NoCurrentState),
        }
    }
}

impl Drop for SessionState {
    fn drop(&mut self) {
        self.root_key.zeroize();
    }
}

/// Current and archived session states for one peer device.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    current: Option<SessionState>,
    previous: VecDeque<SessionState>,
}

impl SessionRecord {
    /// Record whose current state is `state`.
    pub fn new(state: SessionState) -> Self {
        Self { current: Some(state), previous: VecDeque::new() }
    }

    /// Record with no states at all.
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn from_states(
        current: Option<SessionState>,
        previous: impl IntoIterator<Item = SessionState>,
    ) -> Self {
        let mut previous: VecDeque<_> = previous.into_iter().collect();
        previous.truncate(MAX_ARCHIVED_STATES);
        Self { current, previous }
    }

    /// Whether the record can be used to encrypt new messages.
    pub fn has_current_state(&self) -> bool {
        self.current.is_some()
    }

    /// Current state, if any.
    pub fn current_state(&self) -> Option<&SessionState> {
        self.current.as_ref()
    }

    /// Mutable current state for ratchet steps.
    pub fn current_state_mut(&mut self) -> Option<&mut SessionState> {
        self.current.as_mut()
    }

    /// Archived states, most recent first.
    pub fn previous_states(&self) -> impl Iterator<Item = &SessionState> {
        self.previous.iter()
    }

    /// Move the current state to the front of the archive.
    ///
    /// No-op when there is no current state.
    pub fn archive_current_state(&mut self) {
        if let Some(state) = self.current.take() {
            self.previous.push_front(state);
            self.previous.truncate(MAX_ARCHIVED_STATES);
        }
    }

    /// Archive the current state and install `state` as current.
    pub fn promote_state(&mut self, state: SessionState) {
        self.archive_current_state();
        self.current = Some(state);
    }

    /// Registration id of the peer for the current state.
    pub fn remote_registration_id(&self) -> Option<u32> {
        self.current.as_ref().map(SessionState::remote_registration_id)
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
        if record.previous.len() > MAX_ARCHIVED_STATES {
            return Err(CryptoError::Serialization(format!(
                "{} archived states exceeds limit of {MAX_ARCHIVED_STATES}",
                record.previous.len()
            )));
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyPair;

    fn params(initiator: bool) -> SessionParams {
        let alice = KeyPair::from_seed(&[1u8; 32]).public_key();
        let bob = KeyPair::from_seed(&[2u8; 32]).public_key();
        let (local, remote) = if initiator { (alice, bob) } else { (bob, alice) };
        SessionParams {
            local_identity: local,
            remote_identity: remote,
            local_registration_id: if initiator { 11 } else { 22 },
            remote_registration_id: if initiator { 22 } else { 11 },
            shared_secret: [42u8; 32],
            initiator,
        }
    }

    #[test]
    fn both_sides_agree_on_message_keys() {
        let mut alice = SessionState::initialize(&params(true));
        let mut bob = SessionState::initialize(&params(false));

        for _ in 0..3 {
            let sent = alice.next_sending_key().unwrap();
            let received = bob.next_receiving_key().unwrap();
            assert_eq!(sent.key(), received.key());
            assert_eq!(sent.index(), received.index());
        }
    }

    #[test]
    fn archive_clears_current_state() {
        let mut record = SessionRecord::new(SessionState::initialize(&params(true)));
        assert!(record.has_current_state());
        assert_eq!(record.remote_registration_id(), Some(22));

        record.archive_current_state();

        assert!(!record.has_current_state());
        assert_eq!(record.previous_states().count(), 1);
        assert_eq!(record.remote_registration_id(), None);
    }

    #[test]
    fn archive_without_current_state_is_noop() {
        let mut record = SessionRecord::empty();
        record.archive_current_state();
        assert_eq!(record, SessionRecord::empty());
    }

    #[test]
    fn archive_is_bounded() {
        let mut record = SessionRecord::empty();
        for _ in 0..(MAX_ARCHIVED_STATES + 5) {
            record.promote_state(SessionState::initialize(&params(true)));
        }
        record.archive_current_state();
        assert_eq!(record.previous_states().count(), MAX_ARCHIVED_STATES);
    }

    #[test]
    fn serialization_preserves_ratchet_position() {
        let mut record = SessionRecord::new(SessionState::initialize(&params(true)));
        if let Some(state) = record.current_state_mut() {
            state.next_sending_key().unwrap();
        }

        let decoded = SessionRecord::deserialize(&record.serialize().unwrap()).unwrap();

        assert_eq!(decoded, record);
        assert_eq!(decoded.current_state().map(SessionState::sending_index), Some(1));
    }

    #[test]
    fn deserialize_rejects_garbage() {
        assert!(matches!(
            SessionRecord::deserialize(&[0xff, 0x00, 0x13]),
            Err(CryptoError::Serialization(_))
        ));
    }
}
