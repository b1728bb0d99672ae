//! Sigil store operator tool.
//!
//! # Usage
//!
//! ```bash
//! # Record counts
//! sigil --db store.redb stats
//!
//! # Sessions with one peer, and its identity
//! sigil --db store.redb sessions --peer alice
//! sigil --db store.redb identity alice
//!
//! # Trust and session maintenance
//! sigil --db store.redb set-verified alice verified
//! sigil --db store.redb archive me:alice.2
//! sigil --db store.redb remove-sessions alice
//!
//! # Wipe keys and sessions but keep groups
//! sigil --db store.redb wipe --configuration-only
//! ```

mod commands;

use std::path::PathBuf;

use clap::Parser;
use sigil_core::{ProtocolStore, RedbStorage, StoreConfig, SystemEnv};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::Command;

/// Sigil protocol store tool
#[derive(Parser, Debug)]
#[command(name = "sigil")]
#[command(about = "Inspect and maintain a sigil protocol store")]
#[command(version)]
struct Args {
    /// Path to the store database
    #[arg(long, default_value = "sigil.redb")]
    db: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    tracing::debug!("Opening store at {}", args.db.display());
    let storage = RedbStorage::open(&args.db)?;
    let store = ProtocolStore::open(SystemEnv::new(), storage, StoreConfig::default())?;

    let mut out = std::io::stdout().lock();
    commands::run(&store, args.command, &mut out).await?;

    Ok(())
}
