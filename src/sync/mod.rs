//! Sync engine: job records, folder replication, message migration and the
//! per-job run loop that ties them together.

pub mod engine;
pub mod job;
pub mod migrator;
pub mod replicator;
