//! Identifiers and composite record keys.
//!
//! Queue keys and record ids are derived from these types only, so every call
//! site names the same session the same way.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::StoreError;

/// Account identifier of a peer or of one of our own identities.
///
/// ASCII alphanumerics, `-` and `_` only, so that `.` and `:` stay free as
/// separators in composite keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceId(String);

impl ServiceId {
    /// Validate and wrap an identifier.
    pub fn new(id: impl Into<String>) -> Result<Self, StoreError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid {
            return Err(StoreError::InvalidAddress(format!("invalid service id {id:?}")));
        }
        Ok(Self(id))
    }

    /// Identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ServiceId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ServiceId {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ServiceId> for String {
    fn from(id: ServiceId) -> Self {
        id.0
    }
}

/// Device number within an account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A peer device: `service_id.device_id`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    /// Peer account
    pub service_id: ServiceId,
    /// Peer device
    pub device_id: DeviceId,
}

impl Address {
    /// Combine an account and device.
    pub fn new(service_id: ServiceId, device_id: DeviceId) -> Self {
        Self { service_id, device_id }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service_id, self.device_id)
    }
}

impl FromStr for Address {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (service_id, device_id) = s
            .rsplit_once('.')
            .ok_or_else(|| StoreError::InvalidAddress(format!("missing device in {s:?}")))?;
        let device_id = device_id
            .parse()
            .map_err(|_| StoreError::InvalidAddress(format!("invalid device in {s:?}")))?;
        Ok(Self { service_id: service_id.parse()?, device_id: DeviceId(device_id) })
    }
}

/// A peer device as seen by one of our identities: `our:service_id.device_id`.
///
/// The display form is both the session record id and the session queue key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedAddress {
    /// Which of our identities owns the session
    pub our_service_id: ServiceId,
    /// Peer device
    pub address: Address,
}

impl QualifiedAddress {
    /// Scope `address` to `our_service_id`.
    pub fn new(our_service_id: ServiceId, address: Address) -> Self {
        Self { our_service_id, address }
    }

    /// Peer account.
    pub fn service_id(&self) -> &ServiceId {
        &self.address.service_id
    }

    /// Peer device.
    pub fn device_id(&self) -> DeviceId {
        self.address.device_id
    }
}

impl fmt::Display for QualifiedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.our_service_id, self.address)
    }
}

impl FromStr for QualifiedAddress {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ours, address) = s
            .split_once(':')
            .ok_or_else(|| StoreError::InvalidAddress(format!("missing identity in {s:?}")))?;
        Ok(Self { our_service_id: ours.parse()?, address: address.parse()? })
    }
}

/// Group distribution identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DistributionId(pub u128);

impl fmt::Display for DistributionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Record id and queue key of a sender key: `our:sender.device--distribution`.
pub fn sender_key_id(sender: &QualifiedAddress, distribution_id: DistributionId) -> String {
    format!("{sender}--{distribution_id}")
}

/// Record id of a pre-key or signed pre-key: `our:key_id`.
pub fn pre_key_id(our_service_id: &ServiceId, key_id: u32) -> String {
    format!("{our_service_id}:{key_id}")
}
