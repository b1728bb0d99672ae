//! Group sender key distribution bookkeeping.
//!
//! Decides, before a group send, whether our sender key must be created,
//! reset, handed to new devices, or can be used as is. The decision is pure;
//! the store applies it through [`crate::ProtocolStore::update_sender_key_info`]
//! and [`crate::ProtocolStore::reset_sender_key`].

use std::time::Duration;

use crate::records::{GroupSenderKeyInfo, MemberDevice};

/// Difference between the devices holding our sender key and the devices a
/// send is addressed to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDiff {
    /// Addressed devices that do not hold the key yet
    pub new_to_member_devices: Vec<MemberDevice>,
    /// Devices holding the key that are no longer addressed
    pub removed_from_member_devices: Vec<MemberDevice>,
}

/// Compare current key holders with the devices a send targets.
///
/// A device counts as the same only if account, device number and
/// registration id all match; a re-registered device needs the key again. A
/// partial send (to a subset of members) never reports removals.
pub fn analyze_sender_key_devices(
    member_devices: &[MemberDevice],
    devices_for_send: &[MemberDevice],
    is_partial_send: bool,
) -> DeviceDiff {
    let new_to_member_devices = devices_for_send
        .iter()
        .filter(|device| !member_devices.contains(device))
        .cloned()
        .collect();

    let removed_from_member_devices = if is_partial_send {
        Vec::new()
    } else {
        member_devices
            .iter()
            .filter(|device| !devices_for_send.contains(device))
            .cloned()
            .collect()
    };

    DeviceDiff { new_to_member_devices, removed_from_member_devices }
}

/// Why an existing sender key must be replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// Key is older than the allowed age
    Expired,
    /// Devices that held the key left the group
    MembersRemoved,
}

/// What to do with our sender key before a group send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistributionPlan {
    /// No key yet; create one and distribute to every addressed device
    Create,
    /// Drop the key and start over
    Reset(ResetReason),
    /// Send the existing key to these devices first
    Distribute(Vec<MemberDevice>),
    /// Every addressed device already holds the key
    UpToDate,
}

/// Plan sender key handling for a send to `devices_for_send`.
pub fn plan_sender_key_distribution(
    info: Option<&GroupSenderKeyInfo>,
    devices_for_send: &[MemberDevice],
    is_partial_send: bool,
    now_ms: u64,
    max_age: Duration,
) -> DistributionPlan {
    let Some(info) = info else {
        return DistributionPlan::Create;
    };

    if now_ms.saturating_sub(info.created_at) >= max_age.as_millis() as u64 {
        return DistributionPlan::Reset(ResetReason::Expired);
    }

    let diff = analyze_sender_key_devices(&info.member_devices, devices_for_send, is_partial_send);
    if !diff.removed_from_member_devices.is_empty() {
        return DistributionPlan::Reset(ResetReason::MembersRemoved);
    }
    if !diff.new_to_member_devices.is_empty() {
        return DistributionPlan::Distribute(diff.new_to_member_devices);
    }
    DistributionPlan::UpToDate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{DeviceId, DistributionId, ServiceId};

    const DAY_MS: u64 = 24 * 60 * 60 * 1000;
    const MAX_AGE: Duration = Duration::from_secs(90 * 24 * 60 * 60);

    fn device(who: &str, id: u32, registration_id: u32) -> MemberDevice {
        MemberDevice { id: DeviceId(id), identifier: ServiceId::new(who).unwrap(), registration_id }
    }

    fn info(members: Vec<MemberDevice>) -> GroupSenderKeyInfo {
        GroupSenderKeyInfo {
            created_at: 0,
            distribution_id: DistributionId(1),
            member_devices: members,
        }
    }

    #[test]
    fn new_and_removed_devices() {
        let members = [device("alice", 1, 10), device("bob", 1, 20)];
        let targets = [device("alice", 1, 10), device("carol", 2, 30)];

        let diff = analyze_sender_key_devices(&members, &targets, false);
        assert_eq!(diff.new_to_member_devices, vec![device("carol", 2, 30)]);
        assert_eq!(diff.removed_from_member_devices, vec![device("bob", 1, 20)]);

        let partial = analyze_sender_key_devices(&members, &targets, true);
        assert!(partial.removed_from_member_devices.is_empty());
    }

    #[test]
    fn re_registered_device_is_new() {
        let members = [device("alice", 1, 10)];
        let targets = [device("alice", 1, 11)];

        let diff = analyze_sender_key_devices(&members, &targets, true);
        assert_eq!(diff.new_to_member_devices, targets.to_vec());
    }

    #[test]
    fn plans() {
        let members = vec![device("alice", 1, 10)];
        let current = info(members.clone());

        assert_eq!(
            plan_sender_key_distribution(None, &members, false, 0, MAX_AGE),
            DistributionPlan::Create
        );
        assert_eq!(
            plan_sender_key_distribution(Some(&current), &members, false, 90 * DAY_MS, MAX_AGE),
            DistributionPlan::Reset(ResetReason::Expired)
        );
        assert_eq!(
            plan_sender_key_distribution(Some(&current), &[], false, DAY_MS, MAX_AGE),
            DistributionPlan::Reset(ResetReason::MembersRemoved)
        );
        assert_eq!(
            plan_sender_key_distribution(
                Some(&current),
                &[device("alice", 1, 10), device("bob", 2, 20)],
                false,
                DAY_MS,
                MAX_AGE
            ),
            DistributionPlan::Distribute(vec![device("bob", 2, 20)])
        );
        assert_eq!(
            plan_sender_key_distribution(Some(&current), &members, false, DAY_MS, MAX_AGE),
            DistributionPlan::UpToDate
        );
    }
}
