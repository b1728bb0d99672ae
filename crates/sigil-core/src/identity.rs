//! Identity trust and verification rules.
//!
//! Pure decisions over an [`IdentityKeyRecord`]; the store applies them. Time
//! is passed in as wall clock milliseconds.
//!
//! # Invariants
//!
//! - A changed key never keeps `Verified`: it becomes `Unverified` if the old
//!   key was `Verified` or `Unverified`, else `Default`
//! - Sending requires matching keys, a status other than `Unverified`, and no
//!   outstanding approval for a recent key change

use std::time::Duration;

use sigil_crypto::PublicKey;

use crate::{
    StoreError, TrustError,
    cache::Hydrate,
    ids::ServiceId,
    records::StoredIdentityKey,
};

/// Verification status of a peer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VerifiedStatus {
    /// Never verified
    Default = 0,
    /// User verified the safety number
    Verified = 1,
    /// User explicitly marked the identity unverified
    Unverified = 2,
}

impl TryFrom<u8> for VerifiedStatus {
    type Error = StoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Default),
            1 => Ok(Self::Verified),
            2 => Ok(Self::Unverified),
            other => Err(StoreError::Corruption(format!("invalid verified status {other}"))),
        }
    }
}

impl From<VerifiedStatus> for u8 {
    fn from(status: VerifiedStatus) -> Self {
        status as u8
    }
}

/// Direction of a message guarded by the identity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Encrypting to the peer
    Sending,
    /// Decrypting from the peer
    Receiving,
}

/// Hydrated identity key of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityKeyRecord {
    /// Peer account
    pub service_id: ServiceId,
    /// Peer identity key
    pub public_key: PublicKey,
    /// First key ever seen for this peer
    pub first_use: bool,
    /// Wall clock time (ms) the key was saved
    pub timestamp: u64,
    /// Verification status
    pub verified: VerifiedStatus,
    /// User acknowledged the latest key change
    pub nonblocking_approval: bool,
}

impl IdentityKeyRecord {
    /// Persisted form.
    pub fn to_stored(&self) -> StoredIdentityKey {
        StoredIdentityKey {
            id: self.service_id.clone(),
            public_key: self.public_key.as_bytes().to_vec(),
            first_use: self.first_use,
            timestamp: self.timestamp,
            verified: self.verified.into(),
            nonblocking_approval: self.nonblocking_approval,
        }
    }
}

impl Hydrate for IdentityKeyRecord {
    type Raw = StoredIdentityKey;

    fn hydrate(raw: &StoredIdentityKey) -> Result<Self, StoreError> {
        let public_key = PublicKey::from_slice(&raw.public_key).map_err(|e| {
            StoreError::Corruption(format!("identity key for {}: {e}", raw.id))
        })?;
        Ok(Self {
            service_id: raw.id.clone(),
            public_key,
            first_use: raw.first_use,
            timestamp: raw.timestamp,
            verified: VerifiedStatus::try_from(raw.verified)?,
            nonblocking_approval: raw.nonblocking_approval,
        })
    }
}

/// Whether a recent key change still needs the user's acknowledgement.
pub fn requires_nonblocking_approval(
    record: &IdentityKeyRecord,
    now_ms: u64,
    window: Duration,
) -> bool {
    let recent = now_ms.saturating_sub(record.timestamp) < window.as_millis() as u64;
    !record.first_use && recent && !record.nonblocking_approval
}

/// Sending gate.
///
/// No record means nothing to contradict, so sending is allowed.
pub fn check_trusted_for_sending(
    record: Option<&IdentityKeyRecord>,
    public_key: &PublicKey,
    now_ms: u64,
    window: Duration,
) -> Result<(), TrustError> {
    let Some(record) = record else {
        return Ok(());
    };
    if !record.public_key.ct_eq(public_key) {
        return Err(TrustError::KeyMismatch);
    }
    if record.verified == VerifiedStatus::Unverified {
        return Err(TrustError::Unverified);
    }
    if requires_nonblocking_approval(record, now_ms, window) {
        return Err(TrustError::ApprovalRequired);
    }
    Ok(())
}

/// Status a peer gets when its key changes.
pub fn status_after_key_change(previous: VerifiedStatus) -> VerifiedStatus {
    match previous {
        VerifiedStatus::Verified | VerifiedStatus::Unverified => VerifiedStatus::Unverified,
        VerifiedStatus::Default => VerifiedStatus::Default,
    }
}

/// What to do with a verification sync message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    /// Leave the record alone
    Ignore,
    /// Keep the key, change only the status
    SetStatus(VerifiedStatus),
    /// Replace the record with the incoming key and status
    Overwrite {
        /// A different key was replaced; archive sessions and report it
        key_changed: bool,
    },
}

/// Plan for a "verified" sync message from a linked device.
pub fn plan_verified_message(
    existing: Option<&IdentityKeyRecord>,
    status: VerifiedStatus,
    public_key: &PublicKey,
) -> SyncAction {
    let same_key = existing.is_some_and(|record| record.public_key.ct_eq(public_key));

    match existing {
        None if status == VerifiedStatus::Default => SyncAction::Ignore,
        Some(record)
            if same_key
                && record.verified != VerifiedStatus::Default
                && status == VerifiedStatus::Default =>
        {
            SyncAction::SetStatus(status)
        },
        _ if status == VerifiedStatus::Verified
            && (!same_key
                || existing.is_some_and(|record| record.verified != VerifiedStatus::Verified)) =>
        {
            SyncAction::Overwrite { key_changed: existing.is_some() && !same_key }
        },
        _ => SyncAction::Ignore,
    }
}

/// Plan for an "unverified" sync message from a linked device.
pub fn plan_unverified_message(
    existing: Option<&IdentityKeyRecord>,
    status: VerifiedStatus,
    public_key: &PublicKey,
) -> SyncAction {
    let same_key = existing.is_some_and(|record| record.public_key.ct_eq(public_key));

    match existing {
        Some(record) if same_key && record.verified != VerifiedStatus::Unverified => {
            SyncAction::SetStatus(status)
        },
        Some(_) if same_key => SyncAction::Ignore,
        Some(_) => SyncAction::Overwrite { key_changed: true },
        None => SyncAction::Overwrite { key_changed: false },
    }
}

#[cfg(test)]
mod tests {
    use sigil_crypto::KeyPair;

    use super::*;

    const WINDOW: Duration = Duration::from_secs(5);

    fn key(seed: u8) -> PublicKey {
        KeyPair::from_seed(&[seed; 32]).public_key()
    }

    fn record(seed: u8, verified: VerifiedStatus) -> IdentityKeyRecord {
        IdentityKeyRecord {
            service_id: ServiceId::new("alice").unwrap(),
            public_key: key(seed),
            first_use: false,
            timestamp: 1_000,
            verified,
            nonblocking_approval: false,
        }
    }

    #[test]
    fn unknown_verified_value_is_corruption() {
        assert!(matches!(VerifiedStatus::try_from(3), Err(StoreError::Corruption(_))));
        let mut raw = record(1, VerifiedStatus::Default).to_stored();
        raw.verified = 9;
        assert!(IdentityKeyRecord::hydrate(&raw).unwrap_err().is_fatal());
    }

    #[test]
    fn short_public_key_is_corruption() {
        let mut raw = record(1, VerifiedStatus::Default).to_stored();
        raw.public_key.pop();
        assert!(matches!(IdentityKeyRecord::hydrate(&raw), Err(StoreError::Corruption(_))));
    }

    #[test]
    fn approval_needed_only_inside_window() {
        let r = record(1, VerifiedStatus::Default);
        assert!(requires_nonblocking_approval(&r, 1_000 + 4_999, WINDOW));
        assert!(!requires_nonblocking_approval(&r, 1_000 + 5_000, WINDOW));

        let first = IdentityKeyRecord { first_use: true, ..r.clone() };
        assert!(!requires_nonblocking_approval(&first, 1_001, WINDOW));

        let approved = IdentityKeyRecord { nonblocking_approval: true, ..r };
        assert!(!requires_nonblocking_approval(&approved, 1_001, WINDOW));
    }

    #[test]
    fn sending_gates() {
        let now = 100_000;
        let ok = record(1, VerifiedStatus::Verified);
        assert_eq!(check_trusted_for_sending(Some(&ok), &key(1), now, WINDOW), Ok(()));
        assert_eq!(
            check_trusted_for_sending(Some(&ok), &key(2), now, WINDOW),
            Err(TrustError::KeyMismatch)
        );
        assert_eq!(
            check_trusted_for_sending(
                Some(&record(1, VerifiedStatus::Unverified)),
                &key(1),
                now,
                WINDOW
            ),
            Err(TrustError::Unverified)
        );
        assert_eq!(
            check_trusted_for_sending(Some(&ok), &key(1), 1_500, WINDOW),
            Err(TrustError::ApprovalRequired)
        );
        assert_eq!(check_trusted_for_sending(None, &key(1), now, WINDOW), Ok(()));
    }

    #[test]
    fn key_change_status() {
        assert_eq!(status_after_key_change(VerifiedStatus::Verified), VerifiedStatus::Unverified);
        assert_eq!(
            status_after_key_change(VerifiedStatus::Unverified),
            VerifiedStatus::Unverified
        );
        assert_eq!(status_after_key_change(VerifiedStatus::Default), VerifiedStatus::Default);
    }

    #[test]
    fn verified_message_plans() {
        let default = record(1, VerifiedStatus::Default);
        let verified = record(1, VerifiedStatus::Verified);

        assert_eq!(
            plan_verified_message(None, VerifiedStatus::Default, &key(1)),
            SyncAction::Ignore
        );
        assert_eq!(
            plan_verified_message(Some(&verified), VerifiedStatus::Default, &key(1)),
            SyncAction::SetStatus(VerifiedStatus::Default)
        );
        assert_eq!(
            plan_verified_message(Some(&default), VerifiedStatus::Verified, &key(1)),
            SyncAction::Overwrite { key_changed: false }
        );
        assert_eq!(
            plan_verified_message(Some(&verified), VerifiedStatus::Verified, &key(2)),
            SyncAction::Overwrite { key_changed: true }
        );
        assert_eq!(
            plan_verified_message(None, VerifiedStatus::Verified, &key(1)),
            SyncAction::Overwrite { key_changed: false }
        );
        assert_eq!(
            plan_verified_message(Some(&verified), VerifiedStatus::Verified, &key(1)),
            SyncAction::Ignore
        );
    }

    #[test]
    fn unverified_message_plans() {
        let verified = record(1, VerifiedStatus::Verified);
        let unverified = record(1, VerifiedStatus::Unverified);

        assert_eq!(
            plan_unverified_message(Some(&verified), VerifiedStatus::Unverified, &key(1)),
            SyncAction::SetStatus(VerifiedStatus::Unverified)
        );
        assert_eq!(
            plan_unverified_message(Some(&unverified), VerifiedStatus::Unverified, &key(1)),
            SyncAction::Ignore
        );
        assert_eq!(
            plan_unverified_message(Some(&verified), VerifiedStatus::Unverified, &key(2)),
            SyncAction::Overwrite { key_changed: true }
        );
        assert_eq!(
            plan_unverified_message(None, VerifiedStatus::Unverified, &key(2)),
            SyncAction::Overwrite { key_changed: false }
        );
    }
}
