//! Lifecycle event delivery
//!
//! Jobs report progress through an explicit `EventBus` rather than a global
//! listener registry. Subscribers get their own channel; a dropped receiver
//! is pruned on the next emit.

use std::sync::Mutex;

use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::sync::job::{JobId, JobSnapshot};

/// Event emitted by the sync subsystem.
///
/// Every variant carries the job identifier and a progress/stat snapshot so
/// the persistence collaborator can store the latest state without extra
/// round trips.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SyncEvent {
    Started {
        job_id: JobId,
        snapshot: JobSnapshot,
    },
    Running {
        job_id: JobId,
        snapshot: JobSnapshot,
    },
    FoldersDiscovered {
        job_id: JobId,
        folders: u32,
        messages: u64,
        snapshot: JobSnapshot,
    },
    FolderCompleted {
        job_id: JobId,
        folder: String,
        snapshot: JobSnapshot,
    },
    BatchCompleted {
        job_id: JobId,
        folder: String,
        batch: u32,
        snapshot: JobSnapshot,
    },
    Paused {
        job_id: JobId,
        snapshot: JobSnapshot,
    },
    Resumed {
        job_id: JobId,
        snapshot: JobSnapshot,
    },
    Stopped {
        job_id: JobId,
        snapshot: JobSnapshot,
    },
    Completed {
        job_id: JobId,
        snapshot: JobSnapshot,
    },
    Failed {
        job_id: JobId,
        snapshot: JobSnapshot,
    },
}

impl SyncEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            SyncEvent::Started { job_id, .. }
            | SyncEvent::Running { job_id, .. }
            | SyncEvent::FoldersDiscovered { job_id, .. }
            | SyncEvent::FolderCompleted { job_id, .. }
            | SyncEvent::BatchCompleted { job_id, .. }
            | SyncEvent::Paused { job_id, .. }
            | SyncEvent::Resumed { job_id, .. }
            | SyncEvent::Stopped { job_id, .. }
            | SyncEvent::Completed { job_id, .. }
            | SyncEvent::Failed { job_id, .. } => *job_id,
        }
    }
}

/// Fan-out channel for lifecycle events.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<SyncEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Receiver<SyncEvent> {
        let (tx, rx) = flume::unbounded();
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .push(tx);
        rx
    }

    /// Deliver an event to every live subscriber.
    pub fn emit(&self, event: SyncEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .expect("event bus lock poisoned");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::job::{JobProgress, JobSnapshot, JobState, JobStats};
    use uuid::Uuid;

    fn snapshot(id: JobId) -> JobSnapshot {
        JobSnapshot {
            id,
            state: JobState::Running,
            progress: JobProgress::default(),
            stats: JobStats::default(),
            percentage: 0.0,
            error: None,
            started_at: None,
            completed_at: None,
            last_progress_at: None,
        }
    }

    #[test]
    fn test_fan_out_to_all_subscribers() {
        let bus = EventBus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();

        let id = Uuid::new_v4();
        bus.emit(SyncEvent::Started {
            job_id: id,
            snapshot: snapshot(id),
        });

        assert_eq!(rx1.recv().unwrap().job_id(), id);
        assert_eq!(rx2.recv().unwrap().job_id(), id);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();
        drop(rx2);

        let id = Uuid::new_v4();
        bus.emit(SyncEvent::Completed {
            job_id: id,
            snapshot: snapshot(id),
        });
        bus.emit(SyncEvent::Completed {
            job_id: id,
            snapshot: snapshot(id),
        });

        assert_eq!(rx1.try_iter().count(), 2);
        assert_eq!(bus.subscribers.lock().unwrap().len(), 1);
    }
}
