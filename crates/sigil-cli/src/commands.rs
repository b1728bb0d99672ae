//! Subcommands and their output.

use std::io::Write;

use clap::{Subcommand, ValueEnum};
use sigil_core::{
    Environment, GLOBAL_ZONE, IdentityKeyRecord, ProtocolStore, QualifiedAddress, ServiceId,
    Storage, StoreError, VerifiedStatus,
    records::{StoredSession, StoredUnprocessed},
};
use thiserror::Error;

/// Failures surfaced to the operator.
#[derive(Debug, Error)]
pub enum CliError {
    /// Store operation failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Writing output failed
    #[error("write output: {0}")]
    Io(#[from] std::io::Error),
}

/// Verification status as typed on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Status {
    /// Never verified
    Default,
    /// Safety number verified
    Verified,
    /// Explicitly unverified
    Unverified,
}

impl From<Status> for VerifiedStatus {
    fn from(status: Status) -> Self {
        match status {
            Status::Default => Self::Default,
            Status::Verified => Self::Verified,
            Status::Unverified => Self::Unverified,
        }
    }
}

/// Store operations.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Record counts per family
    Stats,

    /// List sessions and whether each is open
    Sessions {
        /// Only sessions with this peer
        #[arg(long)]
        peer: Option<ServiceId>,
    },

    /// Show stored peer identities
    Identity {
        /// Only this peer
        service_id: Option<ServiceId>,
    },

    /// Change the verification status of a peer
    SetVerified {
        /// Peer account
        service_id: ServiceId,
        /// New status
        status: Status,
    },

    /// Archive the open session with one device (`ours:peer.device`)
    Archive {
        /// Session address
        address: QualifiedAddress,
    },

    /// Delete every session with a peer
    RemoveSessions {
        /// Peer account
        service_id: ServiceId,
    },

    /// List envelopes waiting to be processed
    Unprocessed,

    /// Delete stored data
    Wipe {
        /// Keep groups, dropping only their sender key bookkeeping
        #[arg(long)]
        configuration_only: bool,
    },
}

fn status_name(status: VerifiedStatus) -> &'static str {
    match status {
        VerifiedStatus::Default => "default",
        VerifiedStatus::Verified => "verified",
        VerifiedStatus::Unverified => "unverified",
    }
}

fn write_identity(out: &mut impl Write, record: &IdentityKeyRecord) -> std::io::Result<()> {
    writeln!(
        out,
        "{}\t{}\t{}\tfirst_use={}\tapproved={}\tsaved_at={}",
        record.service_id,
        hex::encode(record.public_key.as_bytes()),
        status_name(record.verified),
        record.first_use,
        record.nonblocking_approval,
        record.timestamp,
    )
}

/// Run `command` against `store`, writing results to `out`.
pub async fn run<E, S, W>(
    store: &ProtocolStore<E, S>,
    command: Command,
    out: &mut W,
) -> Result<(), CliError>
where
    E: Environment,
    S: Storage,
    W: Write,
{
    match command {
        Command::Stats => {
            let stats = store.stats();
            writeln!(out, "local identities\t{}", stats.local_identities)?;
            writeln!(out, "identity keys\t{}", stats.identity_keys)?;
            writeln!(out, "sessions\t{}", stats.sessions)?;
            writeln!(out, "pre-keys\t{}", stats.pre_keys)?;
            writeln!(out, "signed pre-keys\t{}", stats.signed_pre_keys)?;
            writeln!(out, "sender keys\t{}", stats.sender_keys)?;
            writeln!(out, "unprocessed\t{}", store.get_unprocessed_count()?)?;
        },

        Command::Sessions { peer } => {
            let mut rows = store.storage().get_all::<StoredSession>().map_err(StoreError::from)?;
            rows.retain(|row| peer.as_ref().is_none_or(|peer| row.service_id == *peer));
            rows.sort_by(|a, b| a.id.cmp(&b.id));

            for row in rows {
                let address: QualifiedAddress = row.id.parse()?;
                let state = match store.load_session(&address, &GLOBAL_ZONE).await? {
                    Some(record) if record.has_current_state() => "open",
                    Some(_) => "archived",
                    None => "unreadable",
                };
                writeln!(out, "{address}\t{state}")?;
            }
        },

        Command::Identity { service_id: Some(service_id) } => {
            let record = store
                .get_identity_record(&service_id)?
                .ok_or_else(|| StoreError::NotFound {
                    kind: "identity key",
                    id: service_id.to_string(),
                })?;
            write_identity(out, &record)?;
        },

        Command::Identity { service_id: None } => {
            for record in store.get_all_identity_records()? {
                write_identity(out, &record)?;
            }
        },

        Command::SetVerified { service_id, status } => {
            store.set_verified(&service_id, status.into())?;
            tracing::info!(service_id = %service_id, ?status, "verification status changed");
        },

        Command::Archive { address } => {
            store.archive_session(&address, &GLOBAL_ZONE).await?;
        },

        Command::RemoveSessions { service_id } => {
            store.remove_sessions_by_service_id(&service_id).await?;
        },

        Command::Unprocessed => {
            let mut rows =
                store.storage().get_all::<StoredUnprocessed>().map_err(StoreError::from)?;
            rows.sort_by(|a, b| a.received_at.cmp(&b.received_at).then_with(|| a.id.cmp(&b.id)));

            for row in rows {
                writeln!(
                    out,
                    "{}\treceived_at={}\tattempts={}\tdecrypted={}",
                    row.id,
                    row.received_at,
                    row.attempts,
                    row.decrypted.is_some(),
                )?;
            }
        },

        Command::Wipe { configuration_only: true } => {
            store.remove_all_configuration().await?;
        },

        Command::Wipe { configuration_only: false } => {
            store.remove_all_data().await?;
        },
    }
    Ok(())
}
