//! Folder operations: LIST, CREATE, EXAMINE

use async_imap::Session;
use futures::TryStreamExt;
use tracing::debug;

use crate::backend::{CreateOutcome, FolderEntry};
use crate::error::{FerryError, Result};

pub(super) async fn list_folders<S>(session: &mut Session<S>) -> Result<Vec<FolderEntry>>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + std::fmt::Debug + Send,
{
    let names: Vec<_> = session
        .list(Some(""), Some("*"))
        .await
        .map_err(|e| FerryError::FolderList(format!("LIST failed: {}", e)))?
        .try_collect()
        .await
        .map_err(|e| FerryError::FolderList(format!("failed to collect folders: {}", e)))?;

    let entries: Vec<FolderEntry> = names
        .iter()
        .map(|name| FolderEntry {
            name: name.name().to_string(),
            delimiter: name.delimiter().map(|d| d.to_string()),
            attributes: name
                .attributes()
                .iter()
                .map(|a| format!("{:?}", a))
                .collect(),
        })
        .collect();

    debug!("Listed {} IMAP folders", entries.len());
    Ok(entries)
}

/// CREATE, folding the server's "already exists" refusal into a successful
/// idempotent outcome.
pub(super) async fn create_folder<S>(session: &mut Session<S>, path: &str) -> Result<CreateOutcome>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + std::fmt::Debug + Send,
{
    match session.create(path).await {
        Ok(()) => Ok(CreateOutcome::Created),
        Err(e) => {
            let text = e.to_string().to_ascii_lowercase();
            if text.contains("alreadyexists") || text.contains("already exists") {
                debug!(folder = %path, "CREATE: folder already exists");
                Ok(CreateOutcome::AlreadyExists)
            } else {
                Err(FerryError::FolderCreate(format!(
                    "CREATE {} failed: {}",
                    path, e
                )))
            }
        }
    }
}

/// Read-only open; returns the folder's message count.
pub(super) async fn examine<S>(session: &mut Session<S>, path: &str) -> Result<u32>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + std::fmt::Debug + Send,
{
    let mailbox = session
        .examine(path)
        .await
        .map_err(|e| FerryError::FolderOpen(format!("EXAMINE {} failed: {}", path, e)))?;
    Ok(mailbox.exists)
}
