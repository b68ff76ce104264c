//! mailferry - IMAP mailbox migration engine
//!
//! Mirrors mailbox state between two mail endpoints: discovers the source
//! folder hierarchy, replicates it at the destination and migrates messages
//! folder by folder in batches, preserving flags and timestamps and never
//! delivering a message twice.
//!
//! ## Module Organization
//!
//! - `backend/`: the mail endpoint abstraction (plus an in-memory twin)
//! - `adapters/`: the real IMAP endpoint over async-imap
//! - `pool`: connection manager - pooling, liveness, backoff
//! - `sync/`: job records, folder replication, message migration, engine
//! - `state/`: the orchestrator owning all active jobs
//! - `events`: lifecycle event bus
//! - `config`: endpoint/job configuration
//! - `error`: crate-wide error type with machine codes

pub mod adapters;
pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod pool;
pub mod state;
pub mod sync;

use std::path::Path;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::adapters::imap::ImapConnector;
use crate::config::AppConfig;
use crate::error::{FerryError, Result};
use crate::state::SyncOrchestrator;
use crate::sync::job::{JobState, SyncJob};

/// Initialize tracing for logging.
///
/// Debug builds default to debug-level logs for this crate; override with
/// the RUST_LOG environment variable.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("mailferry=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Run every migration in the config file to completion.
pub async fn run(config_path: &Path) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    if config.migrations.is_empty() {
        return Err(FerryError::Config("no migrations configured".into()));
    }

    info!("Starting {} migration(s)", config.migrations.len());
    let orchestrator = SyncOrchestrator::new(Arc::new(ImapConnector::new()));

    // Stream lifecycle events into the log while jobs run.
    let events = orchestrator.subscribe();
    let logger = tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            info!(job = %event.job_id(), "{:?}", event);
        }
    });

    let mut job_ids = Vec::new();
    for migration in &config.migrations {
        let mut job = SyncJob::new(
            migration.source.clone(),
            migration.destination.clone(),
            migration.mode,
            migration.folders.clone(),
            migration.options.clone(),
        );
        job.name = migration.name.clone();
        job_ids.push(orchestrator.start_job(job).await?);
    }

    let mut failed = 0u32;
    for job_id in job_ids {
        let snapshot = orchestrator.wait(job_id).await?;
        match snapshot.state {
            JobState::Completed => info!(
                job = %job_id,
                appended = snapshot.stats.appended,
                skipped = snapshot.stats.skipped_duplicates,
                failed = snapshot.stats.failed_messages,
                "Migration completed"
            ),
            state => {
                failed += 1;
                error!(job = %job_id, %state, error = ?snapshot.error, "Migration did not complete");
            }
        }
    }

    orchestrator.shutdown().await;
    logger.abort();

    if failed > 0 {
        return Err(FerryError::Other(format!(
            "{} migration(s) did not complete",
            failed
        )));
    }
    Ok(())
}
