//! Mail endpoint abstraction
//!
//! The sync engine talks to both endpoints through `MailEndpoint`, one
//! awaitable method per protocol operation. The real implementation lives
//! in `adapters::imap`; `memory` provides an in-process twin for tests and
//! dry runs.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EndpointConfig;
use crate::error::Result;

/// One folder as reported by a directory listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderEntry {
    /// Full hierarchical path as known to the server
    pub name: String,
    /// Hierarchy delimiter, if the server reports one
    pub delimiter: Option<String>,
    /// Protocol attributes, e.g. "NoSelect", "HasChildren"
    pub attributes: Vec<String>,
}

impl FolderEntry {
    /// Folders flagged non-selectable exist only as hierarchy scaffolding;
    /// they are replicated but never opened for migration.
    pub fn is_selectable(&self) -> bool {
        !self.attributes.iter().any(|a| a.contains("NoSelect"))
    }
}

/// Per-message boolean markers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageFlag {
    Seen,
    Answered,
    Flagged,
    Deleted,
    Draft,
    Recent,
    Custom(String),
}

impl MessageFlag {
    /// Wire form, e.g. `\Seen`.
    pub fn as_imap(&self) -> String {
        match self {
            MessageFlag::Seen => "\\Seen".to_string(),
            MessageFlag::Answered => "\\Answered".to_string(),
            MessageFlag::Flagged => "\\Flagged".to_string(),
            MessageFlag::Deleted => "\\Deleted".to_string(),
            MessageFlag::Draft => "\\Draft".to_string(),
            MessageFlag::Recent => "\\Recent".to_string(),
            MessageFlag::Custom(s) => s.clone(),
        }
    }

    pub fn from_imap(raw: &str) -> Self {
        match raw {
            "\\Seen" => MessageFlag::Seen,
            "\\Answered" => MessageFlag::Answered,
            "\\Flagged" => MessageFlag::Flagged,
            "\\Deleted" => MessageFlag::Deleted,
            "\\Draft" => MessageFlag::Draft,
            "\\Recent" => MessageFlag::Recent,
            other => MessageFlag::Custom(other.to_string()),
        }
    }
}

/// One transferable message, alive only for the duration of a batch.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    /// Sequence number within the source folder listing
    pub seq: u32,
    /// Server-assigned unique identifier, when reported
    pub uid: Option<u32>,
    /// Parsed header map in original order
    pub headers: Vec<(String, String)>,
    /// Message-ID header value without angle brackets, if present
    pub message_id: Option<String>,
    pub flags: Vec<MessageFlag>,
    pub internal_date: Option<DateTime<Utc>>,
    /// Raw transferable body (full RFC 822 text)
    pub body: Vec<u8>,
}

impl MessageEnvelope {
    /// Case-insensitive header lookup, first occurrence.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Parse the header block of a raw RFC 822 message into an ordered map.
/// Unparseable input yields an empty map rather than an error; migration
/// only needs headers for bookkeeping, the raw body is what gets moved.
pub fn parse_headers(body: &[u8]) -> Vec<(String, String)> {
    match mailparse::parse_mail(body) {
        Ok(parsed) => parsed
            .headers
            .iter()
            .map(|h| (h.get_key(), h.get_value()))
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Canonical Message-ID form used for duplicate detection: surrounding
/// whitespace and angle brackets stripped. Returns None for empty values.
pub fn normalize_message_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_matches(|c| c == '<' || c == '>').trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Outcome of an idempotent folder create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Protocol surface consumed from each endpoint.
///
/// All operations are blocking network calls exposed as awaitable methods;
/// the engine suspends at each of them.
#[async_trait]
pub trait MailEndpoint: Send + std::fmt::Debug {
    /// Directory listing of every folder on the endpoint.
    async fn list_folders(&mut self) -> Result<Vec<FolderEntry>>;

    /// Create a folder; "already exists" is a successful outcome.
    async fn create_folder(&mut self, path: &str) -> Result<CreateOutcome>;

    /// Open a folder read-only and return its message count.
    async fn examine(&mut self, path: &str) -> Result<u32>;

    /// Fetch headers, flags, identifiers and raw bodies for the inclusive
    /// sequence range `[start, end]`, without marking anything as read.
    async fn fetch_batch(&mut self, path: &str, start: u32, end: u32)
        -> Result<Vec<MessageEnvelope>>;

    /// Whether the folder already holds a message with this Message-ID.
    async fn contains_message_id(&mut self, path: &str, message_id: &str) -> Result<bool>;

    /// Append a raw message with explicit flags and internal date.
    async fn append(
        &mut self,
        path: &str,
        body: &[u8],
        flags: &[MessageFlag],
        internal_date: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Liveness probe for pooled sessions.
    async fn noop(&mut self) -> Result<()>;

    /// Terminate the session. Idempotent; close errors are the caller's to
    /// swallow.
    async fn logout(&mut self) -> Result<()>;
}

/// Dials endpoints; the seam that lets tests swap the protocol out.
#[async_trait]
pub trait EndpointConnector: Send + Sync {
    async fn connect(&self, config: &EndpointConfig) -> Result<Box<dyn MailEndpoint>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_round_trip() {
        for flag in [
            MessageFlag::Seen,
            MessageFlag::Answered,
            MessageFlag::Flagged,
            MessageFlag::Deleted,
            MessageFlag::Draft,
            MessageFlag::Recent,
            MessageFlag::Custom("$Forwarded".to_string()),
        ] {
            assert_eq!(MessageFlag::from_imap(&flag.as_imap()), flag);
        }
    }

    #[test]
    fn test_selectable_attribute() {
        let folder = FolderEntry {
            name: "INBOX".to_string(),
            delimiter: Some("/".to_string()),
            attributes: vec![],
        };
        assert!(folder.is_selectable());

        let scaffold = FolderEntry {
            name: "[Gmail]".to_string(),
            delimiter: Some("/".to_string()),
            attributes: vec!["NoSelect".to_string(), "HasChildren".to_string()],
        };
        assert!(!scaffold.is_selectable());
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let envelope = MessageEnvelope {
            seq: 1,
            uid: Some(10),
            headers: vec![
                ("From".to_string(), "a@example.com".to_string()),
                ("Message-ID".to_string(), "<x@example.com>".to_string()),
            ],
            message_id: Some("x@example.com".to_string()),
            flags: vec![],
            internal_date: None,
            body: b"From: a@example.com\r\n\r\nhi".to_vec(),
        };
        assert_eq!(envelope.header("message-id"), Some("<x@example.com>"));
        assert_eq!(envelope.header("subject"), None);
    }
}
