//! Unified error types for the migration engine
//!
//! Every error carries a human-readable message and maps to a stable
//! machine code so the persistence collaborator can store and expose it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Crate-wide error type.
///
/// All errors are serializable so job records can carry them across the
/// API boundary. Messages should be user-friendly and actionable.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum FerryError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection timed out: {0}")]
    ConnectionTimeout(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Reconnect attempts exhausted: {0}")]
    ReconnectExhausted(String),

    #[error("Folder listing failed: {0}")]
    FolderList(String),

    #[error("Folder open failed: {0}")]
    FolderOpen(String),

    #[error("Folder creation failed: {0}")]
    FolderCreate(String),

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Append failed: {0}")]
    Append(String),

    #[error("Search failed: {0}")]
    Search(String),

    #[error("Invalid job state: {0}")]
    InvalidState(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

impl FerryError {
    /// Stable machine code for this error class.
    pub fn code(&self) -> &'static str {
        match self {
            FerryError::Config(_) => "CONFIG_INVALID",
            FerryError::ConnectionTimeout(_) => "CONNECTION_TIMEOUT",
            FerryError::Auth(_) => "AUTH_FAILED",
            FerryError::Tls(_) => "TLS_FAILED",
            FerryError::Connection(_) => "CONNECTION_FAILED",
            FerryError::ReconnectExhausted(_) => "RECONNECT_EXHAUSTED",
            FerryError::FolderList(_) => "FOLDER_LIST_FAILED",
            FerryError::FolderOpen(_) => "FOLDER_OPEN_FAILED",
            FerryError::FolderCreate(_) => "FOLDER_CREATE_FAILED",
            FerryError::Fetch(_) => "FETCH_FAILED",
            FerryError::Append(_) => "APPEND_FAILED",
            FerryError::Search(_) => "SEARCH_FAILED",
            FerryError::InvalidState(_) => "INVALID_STATE",
            FerryError::JobNotFound(_) => "JOB_NOT_FOUND",
            FerryError::Parse(_) => "PARSE_FAILED",
            FerryError::Io(_) => "IO",
            FerryError::Other(_) => "INTERNAL",
        }
    }

    /// True for errors that are fatal to the connection attempt itself
    /// (as opposed to a single protocol operation).
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            FerryError::ConnectionTimeout(_)
                | FerryError::Auth(_)
                | FerryError::Tls(_)
                | FerryError::Connection(_)
                | FerryError::ReconnectExhausted(_)
        )
    }
}

// Implement From for common error types

impl From<std::io::Error> for FerryError {
    fn from(err: std::io::Error) -> Self {
        FerryError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for FerryError {
    fn from(err: toml::de::Error) -> Self {
        FerryError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for FerryError {
    fn from(err: serde_json::Error) -> Self {
        FerryError::Parse(err.to_string())
    }
}

impl From<String> for FerryError {
    fn from(err: String) -> Self {
        FerryError::Other(err)
    }
}

/// Result type alias using FerryError
pub type Result<T> = std::result::Result<T, FerryError>;
