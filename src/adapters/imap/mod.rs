//! IMAP implementation of the mail endpoint abstraction

pub mod connection;
mod folders;
mod messages;

pub use connection::{connect, ImapConnector};

use async_imap::Session;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::backend::{CreateOutcome, FolderEntry, MailEndpoint, MessageEnvelope, MessageFlag};
use crate::error::{FerryError, Result};

/// One authenticated IMAP session. Generic over the underlying stream so
/// TLS and plaintext sessions share the same implementation.
#[derive(Debug)]
pub struct ImapEndpoint<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + std::fmt::Debug + Send,
{
    session: Session<S>,
    /// Folder currently opened with EXAMINE, to avoid re-opening per call.
    examined: Option<String>,
}

impl<S> ImapEndpoint<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + std::fmt::Debug + Send,
{
    pub fn new(session: Session<S>) -> Self {
        Self {
            session,
            examined: None,
        }
    }

    async fn ensure_examined(&mut self, path: &str) -> Result<()> {
        if self.examined.as_deref() != Some(path) {
            folders::examine(&mut self.session, path).await?;
            self.examined = Some(path.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl<S> MailEndpoint for ImapEndpoint<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + std::fmt::Debug + Send + 'static,
{
    async fn list_folders(&mut self) -> Result<Vec<FolderEntry>> {
        folders::list_folders(&mut self.session).await
    }

    async fn create_folder(&mut self, path: &str) -> Result<CreateOutcome> {
        folders::create_folder(&mut self.session, path).await
    }

    async fn examine(&mut self, path: &str) -> Result<u32> {
        let count = folders::examine(&mut self.session, path).await?;
        self.examined = Some(path.to_string());
        Ok(count)
    }

    async fn fetch_batch(
        &mut self,
        path: &str,
        start: u32,
        end: u32,
    ) -> Result<Vec<MessageEnvelope>> {
        self.ensure_examined(path).await?;
        messages::fetch_batch(&mut self.session, path, start, end).await
    }

    async fn contains_message_id(&mut self, path: &str, message_id: &str) -> Result<bool> {
        self.ensure_examined(path).await?;
        messages::search_message_id(&mut self.session, path, message_id).await
    }

    async fn append(
        &mut self,
        path: &str,
        body: &[u8],
        flags: &[MessageFlag],
        internal_date: Option<DateTime<Utc>>,
    ) -> Result<()> {
        messages::append(&mut self.session, path, body, flags, internal_date).await
    }

    async fn noop(&mut self) -> Result<()> {
        self.session
            .noop()
            .await
            .map_err(|e| FerryError::Connection(format!("NOOP failed: {}", e)))
    }

    async fn logout(&mut self) -> Result<()> {
        self.session
            .logout()
            .await
            .map_err(|e| FerryError::Connection(format!("LOGOUT failed: {}", e)))
    }
}
