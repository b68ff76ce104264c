//! Message migration
//!
//! Moves one folder's messages source -> destination in bounded sequential
//! batches. Duplicate delivery is prevented by searching the destination
//! for each message's Message-ID before appending; a message without a
//! Message-ID can never be deduplicated and is always appended.

use tracing::{debug, info, warn};

use crate::backend::{MailEndpoint, MessageEnvelope, MessageFlag};
use crate::config::SyncOptions;
use crate::error::Result;
use crate::sync::job::JobControl;

/// What happened to one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateOutcome {
    Appended,
    Skipped,
}

/// Counters for one completed batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOutcome {
    pub batch: u32,
    pub processed: u64,
    pub appended: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Counters for one folder's migration.
#[derive(Debug, Clone, Copy, Default)]
pub struct FolderOutcome {
    pub total: u64,
    pub processed: u64,
    pub appended: u64,
    pub skipped: u64,
    pub failed: u64,
    pub batches: u32,
    /// True when a stop/cancel request ended the folder early; the batch
    /// in flight at the time was still completed.
    pub interrupted: bool,
}

/// Migrate every message in `path`, invoking `on_batch` after each batch so
/// the caller can advance progress counters and emit events.
///
/// Failing to open the folder is fatal (enumeration error); failures on
/// individual messages are counted and skipped.
pub async fn migrate_folder(
    source: &mut dyn MailEndpoint,
    destination: &mut dyn MailEndpoint,
    path: &str,
    options: &SyncOptions,
    control: &JobControl,
    mut on_batch: impl FnMut(BatchOutcome) + Send,
) -> Result<FolderOutcome> {
    let total = source.examine(path).await?;
    let mut outcome = FolderOutcome {
        total: total as u64,
        ..Default::default()
    };
    if total == 0 {
        debug!(folder = %path, "Folder is empty, nothing to migrate");
        return Ok(outcome);
    }

    info!(folder = %path, total, batch_size = options.batch_size, "Migrating folder");

    let batch_size = options.batch_size.max(1);
    let mut start = 1u32;
    while start <= total {
        // Cooperative cancellation between batches; pause is handled by the
        // caller at folder boundaries.
        if outcome.batches > 0 && (control.stop_requested() || control.cancel_requested()) {
            outcome.interrupted = true;
            debug!(folder = %path, "Stop requested, leaving folder after current batch");
            break;
        }

        let end = start.saturating_add(batch_size - 1).min(total);
        let mut batch = BatchOutcome {
            batch: outcome.batches + 1,
            ..Default::default()
        };

        match source.fetch_batch(path, start, end).await {
            Ok(envelopes) => {
                for envelope in &envelopes {
                    match migrate_one(destination, path, envelope, options).await {
                        Ok(MigrateOutcome::Appended) => batch.appended += 1,
                        Ok(MigrateOutcome::Skipped) => batch.skipped += 1,
                        Err(e) => {
                            warn!(
                                folder = %path,
                                seq = envelope.seq,
                                "Message migration failed: {}",
                                e
                            );
                            batch.failed += 1;
                        }
                    }
                    batch.processed += 1;
                }
            }
            Err(e) => {
                // The whole range is lost but the job continues.
                warn!(folder = %path, start, end, "Batch fetch failed: {}", e);
                let span = (end - start + 1) as u64;
                batch.failed += span;
                batch.processed += span;
            }
        }

        outcome.processed += batch.processed;
        outcome.appended += batch.appended;
        outcome.skipped += batch.skipped;
        outcome.failed += batch.failed;
        outcome.batches += 1;
        on_batch(batch);

        start = end.saturating_add(1);
    }

    info!(
        folder = %path,
        appended = outcome.appended,
        skipped = outcome.skipped,
        failed = outcome.failed,
        "Folder migration finished"
    );
    Ok(outcome)
}

/// Append one message unless the destination already has it.
pub async fn migrate_one(
    destination: &mut dyn MailEndpoint,
    path: &str,
    envelope: &MessageEnvelope,
    options: &SyncOptions,
) -> Result<MigrateOutcome> {
    if let Some(message_id) = &envelope.message_id {
        if destination.contains_message_id(path, message_id).await? {
            debug!(folder = %path, message_id = %message_id, "Duplicate, skipping");
            return Ok(MigrateOutcome::Skipped);
        }
    }

    let flags: Vec<MessageFlag> = if options.preserve_flags {
        // \Recent is server-managed and cannot be set on APPEND
        envelope
            .flags
            .iter()
            .filter(|f| **f != MessageFlag::Recent)
            .cloned()
            .collect()
    } else {
        Vec::new()
    };
    let internal_date = if options.preserve_dates {
        envelope.internal_date
    } else {
        None
    };

    destination
        .append(path, &envelope.body, &flags, internal_date)
        .await?;
    Ok(MigrateOutcome::Appended)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryEndpoint, MemoryMailbox};
    use chrono::{TimeZone, Utc};

    fn raw(message_id: Option<&str>, subject: &str) -> Vec<u8> {
        let mut body = String::new();
        if let Some(id) = message_id {
            body.push_str(&format!("Message-ID: <{}>\r\n", id));
        }
        body.push_str(&format!(
            "From: sender@example.com\r\nSubject: {}\r\n\r\nbody text\r\n",
            subject
        ));
        body.into_bytes()
    }

    fn seeded_source(count: usize) -> MemoryMailbox {
        let source = MemoryMailbox::new();
        source.add_folder("INBOX");
        for i in 0..count {
            source.add_message(
                "INBOX",
                &raw(Some(&format!("m{}@example.com", i)), "hello"),
                vec![MessageFlag::Seen],
                Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
            );
        }
        source
    }

    fn dest_with_inbox() -> MemoryMailbox {
        let destination = MemoryMailbox::new();
        destination.add_folder("INBOX");
        destination
    }

    async fn run(
        source: &MemoryMailbox,
        destination: &MemoryMailbox,
        options: &SyncOptions,
    ) -> FolderOutcome {
        let mut src = MemoryEndpoint::new(source.clone());
        let mut dst = MemoryEndpoint::new(destination.clone());
        let control = JobControl::new();
        migrate_folder(&mut src, &mut dst, "INBOX", options, &control, |_| {})
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_second_run_appends_nothing() {
        let source = seeded_source(7);
        let destination = dest_with_inbox();
        let options = SyncOptions::default();

        let first = run(&source, &destination, &options).await;
        assert_eq!(first.appended, 7);
        assert_eq!(first.skipped, 0);

        let second = run(&source, &destination, &options).await;
        assert_eq!(second.appended, 0);
        assert_eq!(second.skipped, 7);
        assert_eq!(destination.message_count("INBOX"), 7);
    }

    #[tokio::test]
    async fn test_flags_and_dates_preserved() {
        let source = seeded_source(1);
        let destination = dest_with_inbox();
        let options = SyncOptions::default();

        run(&source, &destination, &options).await;

        let (flags, date) = destination.message_meta("INBOX", 0).unwrap();
        assert_eq!(flags, vec![MessageFlag::Seen]);
        assert_eq!(date, Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_flags_and_dates_dropped_when_disabled() {
        let source = seeded_source(1);
        let destination = dest_with_inbox();
        let options = SyncOptions {
            preserve_flags: false,
            preserve_dates: false,
            ..Default::default()
        };

        run(&source, &destination, &options).await;

        let (flags, date) = destination.message_meta("INBOX", 0).unwrap();
        assert!(flags.is_empty());
        // append time, not the 2024 source date
        assert!(date > Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_missing_message_id_is_never_deduplicated() {
        let source = MemoryMailbox::new();
        source.add_folder("INBOX");
        source.add_message("INBOX", &raw(None, "no id"), vec![], Utc::now());
        let destination = dest_with_inbox();
        let options = SyncOptions::default();

        let first = run(&source, &destination, &options).await;
        let second = run(&source, &destination, &options).await;

        assert_eq!(first.appended, 1);
        assert_eq!(second.appended, 1);
        assert_eq!(second.skipped, 0);
        assert_eq!(destination.message_count("INBOX"), 2);
    }

    #[tokio::test]
    async fn test_batch_partitioning() {
        let source = seeded_source(120);
        let destination = dest_with_inbox();
        let options = SyncOptions::default();

        let mut batch_sizes = Vec::new();
        let mut src = MemoryEndpoint::new(source.clone());
        let mut dst = MemoryEndpoint::new(destination.clone());
        let control = JobControl::new();
        let outcome = migrate_folder(&mut src, &mut dst, "INBOX", &options, &control, |b| {
            batch_sizes.push(b.processed)
        })
        .await
        .unwrap();

        assert_eq!(outcome.batches, 3);
        assert_eq!(batch_sizes, vec![50, 50, 20]);
        assert_eq!(outcome.processed, 120);
    }

    #[tokio::test]
    async fn test_append_failure_does_not_abort_batch() {
        let source = seeded_source(3);
        let destination = dest_with_inbox();
        destination.fail_append("INBOX");
        let options = SyncOptions::default();

        let outcome = run(&source, &destination, &options).await;
        assert_eq!(outcome.failed, 3);
        assert_eq!(outcome.processed, 3);
        assert_eq!(outcome.appended, 0);
    }

    #[tokio::test]
    async fn test_stop_between_batches() {
        let source = seeded_source(120);
        let destination = dest_with_inbox();
        let options = SyncOptions::default();

        let mut src = MemoryEndpoint::new(source.clone());
        let mut dst = MemoryEndpoint::new(destination.clone());
        let control = JobControl::new();
        let control_ref = control.clone();

        let outcome = migrate_folder(&mut src, &mut dst, "INBOX", &options, &control, move |b| {
            if b.batch == 1 {
                control_ref.request_stop();
            }
        })
        .await
        .unwrap();

        // first batch completed, remaining batches never started
        assert!(outcome.interrupted);
        assert_eq!(outcome.batches, 1);
        assert_eq!(outcome.processed, 50);
        assert_eq!(destination.message_count("INBOX"), 50);
    }

    #[tokio::test]
    async fn test_open_failure_is_fatal() {
        let source = MemoryMailbox::new();
        source.add_folder("INBOX");
        source.fail_examine("INBOX");
        let destination = dest_with_inbox();

        let mut src = MemoryEndpoint::new(source.clone());
        let mut dst = MemoryEndpoint::new(destination.clone());
        let control = JobControl::new();
        let err = migrate_folder(
            &mut src,
            &mut dst,
            "INBOX",
            &SyncOptions::default(),
            &control,
            |_| {},
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "FOLDER_OPEN_FAILED");
    }
}
