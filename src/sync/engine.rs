//! Per-job sync engine
//!
//! Runs one job end to end: acquire both connections, replicate the folder
//! hierarchy, count totals, then migrate folder by folder. Control requests
//! are honored cooperatively: pause at folder boundaries, stop/cancel also
//! between batches. Every advance is published through the event bus.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::SyncMode;
use crate::error::{FerryError, Result};
use crate::events::{EventBus, SyncEvent};
use crate::pool::{ConnectionManager, ManagedConnection};
use crate::sync::job::{JobControl, JobError, JobId, JobSnapshot, JobState, SyncJob};
use crate::sync::migrator;
use crate::sync::replicator;

/// Owns one job's record and drives it to a terminal state.
pub struct JobEngine {
    job: RwLock<SyncJob>,
    control: Arc<JobControl>,
    manager: Arc<ConnectionManager>,
    bus: Arc<EventBus>,
}

impl JobEngine {
    pub fn new(job: SyncJob, manager: Arc<ConnectionManager>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            job: RwLock::new(job),
            control: JobControl::new(),
            manager,
            bus,
        })
    }

    pub fn id(&self) -> JobId {
        self.job.read().expect("job lock poisoned").id
    }

    pub fn state(&self) -> JobState {
        self.job.read().expect("job lock poisoned").state
    }

    pub fn control(&self) -> &JobControl {
        &self.control
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.job.read().expect("job lock poisoned").snapshot()
    }

    /// Update the job record and return the fresh snapshot.
    fn update_job<F>(&self, update_fn: F) -> JobSnapshot
    where
        F: FnOnce(&mut SyncJob),
    {
        let mut job = self.job.write().expect("job lock poisoned");
        update_fn(&mut job);
        job.snapshot()
    }

    fn emit(&self, event: SyncEvent) {
        self.bus.emit(event);
    }

    /// Validated transition + matching lifecycle event. Invalid transitions
    /// (e.g. the watchdog force-failed the job meanwhile) are logged, not
    /// escalated.
    fn transition_and_emit(&self, to: JobState) {
        let job_id = self.id();
        let mut transitioned = false;
        let snapshot = self.update_job(|job| {
            match job.transition(to) {
                Ok(()) => transitioned = true,
                Err(e) => warn!(job = %job.id, "Ignoring transition: {}", e),
            }
        });
        if !transitioned {
            return;
        }
        let event = match to {
            JobState::Running => SyncEvent::Running { job_id, snapshot },
            JobState::Paused => SyncEvent::Paused { job_id, snapshot },
            JobState::Completed => SyncEvent::Completed { job_id, snapshot },
            JobState::Failed => SyncEvent::Failed { job_id, snapshot },
            JobState::Stopped | JobState::Cancelled => SyncEvent::Stopped { job_id, snapshot },
            JobState::Pending => return,
        };
        self.emit(event);
    }

    fn fail_job(&self, err: &FerryError, retries: u32) {
        error!(job = %self.id(), code = err.code(), "Job failed: {}", err);
        self.update_job(|job| {
            job.error = Some(JobError::from_error(err, retries));
        });
        self.transition_and_emit(JobState::Failed);
    }

    /// Force the job into `failed` on behalf of the external watchdog.
    /// Rejected once the job is already terminal (or never started).
    pub fn force_fail(&self, reason: &str) -> Result<()> {
        let mut failed = false;
        let job_id = self.id();
        let snapshot = self.update_job(|job| {
            if job.state.can_transition(JobState::Failed) {
                job.error = Some(JobError {
                    message: reason.to_string(),
                    code: "FORCED_FAILURE".to_string(),
                    timestamp: Utc::now(),
                    retries: 0,
                });
                let _ = job.transition(JobState::Failed);
                failed = true;
            }
        });
        if failed {
            // wake a parked or looping worker so it observes the terminal state
            self.control.request_stop();
            self.emit(SyncEvent::Failed { job_id, snapshot });
            Ok(())
        } else {
            Err(FerryError::InvalidState(format!(
                "cannot force-fail job {} in state {}",
                job_id,
                self.state()
            )))
        }
    }

    /// Drive the job to a terminal state.
    pub async fn run(&self) {
        let job_id = self.id();
        info!(job = %job_id, "Starting sync job");

        let snapshot = self.update_job(|job| {
            if let Err(e) = job.transition(JobState::Running) {
                warn!(job = %job.id, "Cannot start: {}", e);
            }
        });
        if snapshot.state != JobState::Running {
            return;
        }
        self.emit(SyncEvent::Started { job_id, snapshot });

        let (source_cfg, dest_cfg, options, mode, requested) = {
            let job = self.job.read().expect("job lock poisoned");
            (
                job.source.clone(),
                job.destination.clone(),
                job.options.clone(),
                job.mode,
                job.folders.clone(),
            )
        };
        let retry_delay = Duration::from_millis(options.retry_delay_ms);

        // Connection-class failures are fatal to the job; the manager has
        // already retried transport errors with backoff.
        let mut source = match self
            .manager
            .connect_with_backoff(&source_cfg, options.retry_attempts, retry_delay)
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                self.fail_job(&e, options.retry_attempts);
                return;
            }
        };
        let mut destination = match self
            .manager
            .connect_with_backoff(&dest_cfg, options.retry_attempts, retry_delay)
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                self.manager.return_to_pool(source).await;
                self.fail_job(&e, options.retry_attempts);
                return;
            }
        };

        self.emit(SyncEvent::Running {
            job_id,
            snapshot: self.snapshot(),
        });

        let outcome = self
            .execute(&mut source, &mut destination, mode, &requested)
            .await;

        self.manager.return_to_pool(source).await;
        self.manager.return_to_pool(destination).await;

        match outcome {
            Ok(()) => {}
            Err(e) => self.fail_job(&e, 0),
        }
    }

    /// The traversal itself. `Err` means a fatal enumeration error; control
    /// requests end the job from inside and return `Ok`.
    async fn execute(
        &self,
        source: &mut ManagedConnection,
        destination: &mut ManagedConnection,
        mode: SyncMode,
        requested: &[String],
    ) -> Result<()> {
        let job_id = self.id();
        let options = {
            let job = self.job.read().expect("job lock poisoned");
            job.options.clone()
        };

        // Phase 1: discover the source hierarchy.
        let mut tree = replicator::discover(source.endpoint.as_mut()).await?;
        if mode == SyncMode::Folder {
            tree = replicator::prune_to_subset(tree, requested);
            for wanted in requested {
                let known = replicator::flatten(&tree)
                    .iter()
                    .any(|n| &n.path == wanted && n.is_selectable());
                if !known {
                    return Err(FerryError::FolderOpen(format!(
                        "requested folder not found at source: {}",
                        wanted
                    )));
                }
            }
        }

        // Phase 2: mirror it at the destination.
        let report = replicator::replicate(destination.endpoint.as_mut(), &tree).await;
        let folders: Vec<String> = replicator::flatten(&tree)
            .iter()
            .filter(|n| n.is_selectable())
            .map(|n| n.path.clone())
            .collect();

        self.update_job(|job| {
            job.stats.folders_created = report.created;
            job.stats.folders_skipped = report.skipped;
            job.stats.folder_errors = report.errors;
            job.progress.errors += report.errors;
            job.progress.folders_total = folders.len() as u32;
            job.last_progress_at = Some(Utc::now());
        });

        // Phase 3: count messages so the completion percentage is
        // message-based and monotone from the start.
        let mut total_messages = 0u64;
        for folder in &folders {
            total_messages += source.endpoint.examine(folder).await? as u64;
        }
        let snapshot = self.update_job(|job| {
            job.progress.messages_total = total_messages;
            job.last_progress_at = Some(Utc::now());
        });
        self.emit(SyncEvent::FoldersDiscovered {
            job_id,
            folders: folders.len() as u32,
            messages: total_messages,
            snapshot,
        });
        info!(
            job = %job_id,
            folders = folders.len(),
            messages = total_messages,
            "Hierarchy replicated, starting migration"
        );

        // Phase 4: migrate folder by folder in discovery order, resuming
        // from the first unprocessed folder after a pause.
        loop {
            let next_index = {
                let job = self.job.read().expect("job lock poisoned");
                job.progress.folders_processed as usize
            };
            let Some(folder) = folders.get(next_index) else {
                break;
            };

            if !self.checkpoint().await {
                return Ok(());
            }

            let outcome = migrator::migrate_folder(
                source.endpoint.as_mut(),
                destination.endpoint.as_mut(),
                folder,
                &options,
                &self.control,
                |batch| {
                    let snapshot = self.update_job(|job| {
                        job.progress.messages_processed += batch.processed;
                        job.progress.errors += batch.failed as u32;
                        job.stats.appended += batch.appended;
                        job.stats.skipped_duplicates += batch.skipped;
                        job.stats.failed_messages += batch.failed;
                        job.last_progress_at = Some(Utc::now());
                    });
                    self.emit(SyncEvent::BatchCompleted {
                        job_id,
                        folder: folder.clone(),
                        batch: batch.batch,
                        snapshot,
                    });
                },
            )
            .await?;

            if outcome.interrupted {
                // stop/cancel landed between batches; the checkpoint below
                // turns it into the terminal state
                if !self.checkpoint().await {
                    return Ok(());
                }
                continue;
            }

            let snapshot = self.update_job(|job| {
                job.progress.folders_processed += 1;
                job.last_progress_at = Some(Utc::now());
            });
            self.emit(SyncEvent::FolderCompleted {
                job_id,
                folder: folder.clone(),
                snapshot,
            });

            if outcome.failed > 0 {
                source.record_error();
                destination.record_error();
            }
            source.touch();
            destination.touch();
        }

        if !self.checkpoint().await {
            return Ok(());
        }
        self.transition_and_emit(JobState::Completed);
        info!(job = %job_id, "Sync job completed");
        Ok(())
    }

    /// Control checkpoint. Returns false once the job has reached (or just
    /// been driven to) a terminal state; parks here while paused.
    async fn checkpoint(&self) -> bool {
        loop {
            if self.state().is_terminal() {
                return false;
            }
            if self.control.cancel_requested() {
                self.transition_and_emit(JobState::Cancelled);
                return false;
            }
            if self.control.stop_requested() {
                self.transition_and_emit(JobState::Stopped);
                return false;
            }
            if self.control.pause_requested() {
                if self.state() == JobState::Running {
                    self.transition_and_emit(JobState::Paused);
                    info!(job = %self.id(), "Job paused at folder boundary");
                }
                self.control.wait_for_wake().await;
                continue;
            }
            if self.state() == JobState::Paused {
                let mut resumed = false;
                let snapshot = self.update_job(|job| {
                    if job.transition(JobState::Running).is_ok() {
                        resumed = true;
                    }
                });
                if resumed {
                    self.emit(SyncEvent::Resumed {
                        job_id: self.id(),
                        snapshot,
                    });
                    info!(job = %self.id(), "Job resumed");
                }
            }
            return true;
        }
    }
}

impl std::fmt::Debug for JobEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobEngine")
            .field("job", &self.id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
