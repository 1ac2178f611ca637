//! logship - replication service for an append-only transactional object store
//!
//! A single writer (the primary) exposes its transaction log over TCP; one or
//! more read-only secondaries subscribe from a transaction id and continuously
//! receive and apply all subsequent committed transactions. A checkpoint
//! recorder can capture the stream to disk for later replay instead.

mod buffer;
mod checkpoint;
mod config;
mod errors;
mod framing;
mod iterator;
mod primary;
mod secondary;
mod store;
#[cfg(test)]
mod test_replication;
mod tracing_context;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use crate::checkpoint::Recorder;
use crate::config::NodeConfig;
use crate::primary::Primary;
use crate::secondary::Secondary;
use crate::store::{FileStore, Storage};

#[derive(Parser, Debug)]
#[command(
    name = "logship",
    about = "Transaction-log replication: serve a store's commits over TCP and/or apply a primary's stream locally",
    version = "0.1.0"
)]
struct Args {
    /// Store directory (overrides STORE_PATH)
    #[arg(long)]
    store: Option<PathBuf>,

    /// Listen address for secondaries (overrides REPLICATE_TO)
    #[arg(long)]
    replicate_to: Option<String>,

    /// Primary address to replicate from (overrides REPLICATE_FROM)
    #[arg(long)]
    replicate_from: Option<String>,

    /// Checkpoint-log directory (overrides RECORD_TO)
    #[arg(long)]
    record_to: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();

    let args = Args::parse();
    let config = NodeConfig::from_env_with_overrides(
        args.store,
        args.replicate_to,
        args.replicate_from,
        args.record_to,
    )?;

    match run_node(config).await {
        Ok(()) => {
            info!("Replication node shut down cleanly");
            Ok(())
        }
        Err(e) => {
            error!("Replication node failed: {e}");
            Err(e)
        }
    }
}

async fn run_node(config: NodeConfig) -> Result<()> {
    if let Some(record_to) = &config.record_to {
        let addr = config
            .replicate_from
            .clone()
            .expect("validated: RECORD_TO requires REPLICATE_FROM");
        let recorder = Recorder::open(
            addr,
            record_to,
            config.rotate_size,
            config.secondary_options(),
        )?;
        wait_for_shutdown().await;
        recorder.close().await?;
        info!("Recorded through transaction {}", recorder.last_transaction());
        return Ok(());
    }

    let store_path = config
        .store_path
        .clone()
        .expect("validated: STORE_PATH is present");
    let storage: Arc<dyn Storage> = if config.store_blobs {
        Arc::new(FileStore::open_with_blobs(&store_path)?)
    } else {
        Arc::new(FileStore::open(&store_path)?)
    };

    match (&config.replicate_to, &config.replicate_from) {
        (Some(to), None) => {
            let primary = Primary::open(storage, to).await?;
            info!("Serving replication on {}", primary.local_addr());
            wait_for_shutdown().await;
            primary.close().await?;
        }
        (None, Some(from)) => {
            let secondary = Secondary::open(storage, from.clone(), config.secondary_options());
            wait_for_shutdown().await;
            secondary.close().await?;
        }
        (Some(to), Some(from)) => {
            // Cascaded node: apply the upstream's stream locally while
            // serving it onward; commits applied by the secondary flow
            // through the primary wrapper and wake its producers.
            let primary = Primary::open(storage, to).await?;
            let secondary = Secondary::open(
                primary.clone() as Arc<dyn Storage>,
                from.clone(),
                config.secondary_options(),
            );
            wait_for_shutdown().await;
            secondary.close().await?;
            primary.close().await?;
        }
        (None, None) => unreachable!("rejected by configuration validation"),
    }
    Ok(())
}

async fn wait_for_shutdown() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, initiating graceful shutdown"),
        Err(e) => error!("Failed to listen for shutdown signal: {e}"),
    }
}
