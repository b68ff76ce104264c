//! Sync job records and lifecycle state machine
//!
//! A `SyncJob` is the unit of orchestration: one source endpoint, one
//! destination endpoint, options, counters. Only the orchestrator mutates
//! it; everyone else sees immutable snapshots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::{EndpointConfig, SyncMode, SyncOptions};
use crate::error::FerryError;

/// Job identifier.
pub type JobId = Uuid;

/// Lifecycle state of a sync job.
///
/// `pending -> running -> {paused, completed, failed, cancelled, stopped}`,
/// `paused -> running`; terminal states never transition further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Stopped,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled | JobState::Stopped
        )
    }

    /// Whether the state machine permits `self -> to`.
    pub fn can_transition(self, to: JobState) -> bool {
        use JobState::*;
        match (self, to) {
            (Pending, Running) => true,
            (Pending, Cancelled) => true,
            (Running, Paused) => true,
            (Running, Completed | Failed | Cancelled | Stopped) => true,
            (Paused, Running) => true,
            (Paused, Cancelled | Stopped | Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Paused => "paused",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Progress counters; non-decreasing over the life of a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobProgress {
    pub folders_total: u32,
    pub folders_processed: u32,
    pub messages_total: u64,
    pub messages_processed: u64,
    pub errors: u32,
}

impl JobProgress {
    /// Completion percentage in [0, 100], message-based once totals are
    /// known, folder-based before that.
    pub fn percentage(&self) -> f64 {
        let (done, total) = if self.messages_total > 0 {
            (self.messages_processed as f64, self.messages_total as f64)
        } else if self.folders_total > 0 {
            (self.folders_processed as f64, self.folders_total as f64)
        } else {
            return 0.0;
        };
        ((done / total) * 100.0).clamp(0.0, 100.0)
    }
}

/// Per-message and per-folder outcome counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStats {
    pub folders_created: u32,
    pub folders_skipped: u32,
    pub folder_errors: u32,
    pub appended: u64,
    pub skipped_duplicates: u64,
    pub failed_messages: u64,
}

/// Error record attached to a failed attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    pub code: String,
    pub timestamp: DateTime<Utc>,
    pub retries: u32,
}

impl JobError {
    pub fn from_error(err: &FerryError, retries: u32) -> Self {
        Self {
            message: err.to_string(),
            code: err.code().to_string(),
            timestamp: Utc::now(),
            retries,
        }
    }
}

/// The mutable job record, owned by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: JobId,
    pub name: Option<String>,
    pub source: EndpointConfig,
    pub destination: EndpointConfig,
    pub mode: SyncMode,
    /// Requested folder subset (`folder` mode only)
    pub folders: Vec<String>,
    pub options: SyncOptions,
    pub state: JobState,
    pub progress: JobProgress,
    pub stats: JobStats,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Stamped on every progress advance; the external watchdog compares
    /// this against its own staleness threshold.
    pub last_progress_at: Option<DateTime<Utc>>,
}

impl SyncJob {
    pub fn new(
        source: EndpointConfig,
        destination: EndpointConfig,
        mode: SyncMode,
        folders: Vec<String>,
        options: SyncOptions,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: None,
            source,
            destination,
            mode,
            folders,
            options,
            state: JobState::Pending,
            progress: JobProgress::default(),
            stats: JobStats::default(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_progress_at: None,
        }
    }

    /// Validated state transition.
    pub fn transition(&mut self, to: JobState) -> Result<(), FerryError> {
        if !self.state.can_transition(to) {
            return Err(FerryError::InvalidState(format!(
                "cannot transition job {} from {} to {}",
                self.id, self.state, to
            )));
        }
        self.state = to;
        match to {
            JobState::Running if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            JobState::Completed
            | JobState::Failed
            | JobState::Cancelled
            | JobState::Stopped => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        Ok(())
    }

    /// Immutable view handed to event subscribers and the watchdog.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            state: self.state,
            progress: self.progress.clone(),
            stats: self.stats.clone(),
            percentage: self.progress.percentage(),
            error: self.error.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            last_progress_at: self.last_progress_at,
        }
    }
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub state: JobState,
    pub progress: JobProgress,
    pub stats: JobStats,
    pub percentage: f64,
    pub error: Option<JobError>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_progress_at: Option<DateTime<Utc>>,
}

/// External control requests, polled cooperatively by the engine.
///
/// Pause is honored at folder boundaries; stop and cancel also between
/// batches. The in-flight batch always completes first.
#[derive(Debug, Default)]
pub struct JobControl {
    pause: AtomicBool,
    stop: AtomicBool,
    cancel: AtomicBool,
    wake: Notify,
}

impl JobControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn request_resume(&self) {
        self.pause.store(false, Ordering::SeqCst);
        // notify_one stores a permit, so a wake sent before the worker
        // parks is not lost
        self.wake.notify_one();
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Park until resume/stop/cancel flips a flag.
    pub async fn wait_for_wake(&self) {
        self.wake.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthMethod;

    fn endpoint(host: &str) -> EndpointConfig {
        EndpointConfig {
            host: host.to_string(),
            port: 993,
            tls: true,
            username: "user".to_string(),
            auth: AuthMethod::Password {
                password: "secret".to_string(),
            },
            connect_timeout_secs: 30,
        }
    }

    fn job() -> SyncJob {
        SyncJob::new(
            endpoint("src.example.com"),
            endpoint("dst.example.com"),
            SyncMode::Full,
            vec![],
            SyncOptions::default(),
        )
    }

    #[test]
    fn test_state_machine_paths() {
        use JobState::*;
        assert!(Pending.can_transition(Running));
        assert!(Running.can_transition(Paused));
        assert!(Paused.can_transition(Running));
        assert!(Running.can_transition(Stopped));
        assert!(Paused.can_transition(Stopped));

        // pause only from running, resume only from paused
        assert!(!Pending.can_transition(Paused));
        assert!(!Paused.can_transition(Paused));
        assert!(!Pending.can_transition(Completed));

        // terminal states absorb
        for terminal in [Completed, Failed, Cancelled, Stopped] {
            assert!(terminal.is_terminal());
            for to in [Pending, Running, Paused, Completed, Failed, Cancelled, Stopped] {
                assert!(!terminal.can_transition(to));
            }
        }
    }

    #[test]
    fn test_transition_sets_timestamps() {
        let mut job = job();
        assert!(job.started_at.is_none());
        job.transition(JobState::Running).unwrap();
        assert!(job.started_at.is_some());
        job.transition(JobState::Completed).unwrap();
        assert!(job.completed_at.is_some());

        // terminal: no further transitions
        let err = job.transition(JobState::Running).unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
    }

    #[test]
    fn test_percentage_clamped() {
        let mut progress = JobProgress::default();
        assert_eq!(progress.percentage(), 0.0);

        progress.messages_total = 150;
        progress.messages_processed = 75;
        assert!((progress.percentage() - 50.0).abs() < f64::EPSILON);

        progress.messages_processed = 150;
        assert!((progress.percentage() - 100.0).abs() < f64::EPSILON);

        // never exceeds 100 even if counters drift
        progress.messages_processed = 200;
        assert!((progress.percentage() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_percentage_folder_fallback() {
        let progress = JobProgress {
            folders_total: 4,
            folders_processed: 1,
            ..Default::default()
        };
        assert!((progress.percentage() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_control_flags() {
        let control = JobControl::new();
        assert!(!control.pause_requested());
        control.request_pause();
        assert!(control.pause_requested());
        control.request_resume();
        assert!(!control.pause_requested());
        control.request_stop();
        assert!(control.stop_requested());
    }
}
