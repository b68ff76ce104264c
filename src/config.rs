//! Endpoint and job configuration
//!
//! Connection parameters mirror what the account collaborator stores per
//! endpoint; `SyncOptions` enumerates every recognized job option with
//! defaults applied at construction.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::FerryError;

/// How to authenticate against a mail endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum AuthMethod {
    /// Plain credential via the IMAP LOGIN command.
    Password { password: String },
    /// AUTH=LOGIN challenge/response (some providers disable LOGIN).
    Login { password: String },
    /// OAuth-style bearer token via SASL XOAUTH2.
    OAuth2 { access_token: String },
}

/// Connection parameters for one mail endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Server hostname
    pub host: String,

    /// Server port (default: 993 for TLS, 143 otherwise)
    #[serde(default = "default_imap_port")]
    pub port: u16,

    /// Use TLS encryption
    #[serde(default = "default_true")]
    pub tls: bool,

    /// Login / mailbox user
    pub username: String,

    /// Authentication method and credential
    #[serde(flatten)]
    pub auth: AuthMethod,

    /// Connect + handshake + authenticate deadline, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl EndpointConfig {
    /// Identity key used for connection pooling: two configs with the same
    /// key may share pooled sessions, different keys never do.
    pub fn identity(&self) -> PoolKey {
        PoolKey {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
        }
    }
}

/// (host, port, username) identity of a pooled connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// What portion of the mailbox a job covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Every selectable folder.
    Full,
    /// Same traversal as full; duplicate detection makes re-runs cheap.
    Incremental,
    /// Only the folders named in the job request.
    Folder,
}

/// Per-job options, defaults applied at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Messages per fetch/append batch
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Carry the source flag set over on append
    #[serde(default = "default_true")]
    pub preserve_flags: bool,

    /// Carry the source internal date over on append
    #[serde(default = "default_true")]
    pub preserve_dates: bool,

    /// Reconnect attempts on unexpected disconnect
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Base reconnect delay in milliseconds (doubles per attempt)
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            preserve_flags: true,
            preserve_dates: true,
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

/// One migration defined in the application config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Display name for logs
    pub name: Option<String>,

    pub source: EndpointConfig,
    pub destination: EndpointConfig,

    #[serde(default = "default_mode")]
    pub mode: SyncMode,

    /// Folder subset for `folder` mode (full paths)
    #[serde(default)]
    pub folders: Vec<String>,

    #[serde(default)]
    pub options: SyncOptions,
}

/// Application configuration loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub migrations: Vec<MigrationConfig>,
}

impl AppConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, FerryError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| FerryError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: AppConfig = toml::from_str(&raw)?;
        for migration in &config.migrations {
            migration.validate()?;
        }
        Ok(config)
    }
}

impl MigrationConfig {
    pub fn validate(&self) -> Result<(), FerryError> {
        if self.source.host.is_empty() || self.destination.host.is_empty() {
            return Err(FerryError::Config("endpoint host must not be empty".into()));
        }
        if self.mode == SyncMode::Folder && self.folders.is_empty() {
            return Err(FerryError::Config(
                "folder mode requires at least one folder".into(),
            ));
        }
        if self.options.batch_size == 0 {
            return Err(FerryError::Config("batch_size must be positive".into()));
        }
        Ok(())
    }
}

fn default_imap_port() -> u16 {
    993
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_batch_size() -> u32 {
    50
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    1000
}

fn default_mode() -> SyncMode {
    SyncMode::Full
}
