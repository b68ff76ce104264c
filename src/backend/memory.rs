//! In-memory mail endpoint
//!
//! A process-local twin of the real IMAP endpoint: same trait, same
//! semantics, shared interior state so a source and a destination handle
//! can point at the same mailbox. Used by the test suite and available for
//! dry-run validation of a migration plan.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    normalize_message_id, parse_headers, CreateOutcome, EndpointConnector, FolderEntry,
    MailEndpoint, MessageEnvelope, MessageFlag,
};
use crate::config::EndpointConfig;
use crate::error::{FerryError, Result};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    flags: Vec<MessageFlag>,
    internal_date: DateTime<Utc>,
    message_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct StoredFolder {
    attributes: Vec<String>,
    messages: Vec<StoredMessage>,
}

#[derive(Debug, Default)]
struct MailboxState {
    folders: BTreeMap<String, StoredFolder>,
    fail_list: bool,
    fail_noop: bool,
    fail_examine: HashSet<String>,
    fail_create: HashSet<String>,
    fail_append: HashSet<String>,
    fetch_delay: Option<Duration>,
}

/// Shared mailbox contents; cheap to clone, handles see the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryMailbox {
    state: Arc<Mutex<MailboxState>>,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an empty folder.
    pub fn add_folder(&self, path: &str) {
        self.add_folder_with_attributes(path, &[]);
    }

    pub fn add_folder_with_attributes(&self, path: &str, attributes: &[&str]) {
        let mut state = self.lock();
        state.folders.entry(path.to_string()).or_insert(StoredFolder {
            attributes: attributes.iter().map(|a| a.to_string()).collect(),
            messages: Vec::new(),
        });
    }

    /// Seed a message; flags and date mirror what a live server would hold.
    pub fn add_message(
        &self,
        path: &str,
        body: &[u8],
        flags: Vec<MessageFlag>,
        internal_date: DateTime<Utc>,
    ) {
        let message_id = extract_message_id(body);
        let mut state = self.lock();
        state
            .folders
            .entry(path.to_string())
            .or_default()
            .messages
            .push(StoredMessage {
                body: body.to_vec(),
                flags,
                internal_date,
                message_id,
            });
    }

    pub fn folder_names(&self) -> Vec<String> {
        self.lock().folders.keys().cloned().collect()
    }

    pub fn message_count(&self, path: &str) -> usize {
        self.lock()
            .folders
            .get(path)
            .map(|f| f.messages.len())
            .unwrap_or(0)
    }

    /// Flags and internal date of the message at `index`, for assertions.
    pub fn message_meta(
        &self,
        path: &str,
        index: usize,
    ) -> Option<(Vec<MessageFlag>, DateTime<Utc>)> {
        self.lock()
            .folders
            .get(path)
            .and_then(|f| f.messages.get(index))
            .map(|m| (m.flags.clone(), m.internal_date))
    }

    // Failure injection for tests.

    pub fn fail_listing(&self) {
        self.lock().fail_list = true;
    }

    /// Make liveness probes fail, simulating a dead pooled session.
    pub fn fail_noop(&self, fail: bool) {
        self.lock().fail_noop = fail;
    }

    /// Slow fetches down, giving tests a window to land control requests.
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.lock().fetch_delay = Some(delay);
    }

    pub fn fail_examine(&self, path: &str) {
        self.lock().fail_examine.insert(path.to_string());
    }

    pub fn fail_create(&self, path: &str) {
        self.lock().fail_create.insert(path.to_string());
    }

    /// Make appends into `path` fail.
    pub fn fail_append(&self, path: &str) {
        self.lock().fail_append.insert(path.to_string());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MailboxState> {
        self.state.lock().expect("memory mailbox lock poisoned")
    }
}

/// Endpoint handle over a shared `MemoryMailbox`.
#[derive(Debug, Clone)]
pub struct MemoryEndpoint {
    mailbox: MemoryMailbox,
    delimiter: String,
}

impl MemoryEndpoint {
    pub fn new(mailbox: MemoryMailbox) -> Self {
        Self {
            mailbox,
            delimiter: "/".to_string(),
        }
    }
}

#[async_trait]
impl MailEndpoint for MemoryEndpoint {
    async fn list_folders(&mut self) -> Result<Vec<FolderEntry>> {
        let state = self.mailbox.lock();
        if state.fail_list {
            return Err(FerryError::FolderList("listing unavailable".into()));
        }
        Ok(state
            .folders
            .iter()
            .map(|(name, folder)| FolderEntry {
                name: name.clone(),
                delimiter: Some(self.delimiter.clone()),
                attributes: folder.attributes.clone(),
            })
            .collect())
    }

    async fn create_folder(&mut self, path: &str) -> Result<CreateOutcome> {
        let mut state = self.mailbox.lock();
        if state.fail_create.contains(path) {
            return Err(FerryError::FolderCreate(format!(
                "server rejected CREATE {}",
                path
            )));
        }
        if state.folders.contains_key(path) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        state.folders.insert(path.to_string(), StoredFolder::default());
        Ok(CreateOutcome::Created)
    }

    async fn examine(&mut self, path: &str) -> Result<u32> {
        let state = self.mailbox.lock();
        if state.fail_examine.contains(path) {
            return Err(FerryError::FolderOpen(format!("cannot open {}", path)));
        }
        let folder = state
            .folders
            .get(path)
            .ok_or_else(|| FerryError::FolderOpen(format!("no such folder: {}", path)))?;
        Ok(folder.messages.len() as u32)
    }

    async fn fetch_batch(
        &mut self,
        path: &str,
        start: u32,
        end: u32,
    ) -> Result<Vec<MessageEnvelope>> {
        let delay = self.mailbox.lock().fetch_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.mailbox.lock();
        let folder = state
            .folders
            .get(path)
            .ok_or_else(|| FerryError::Fetch(format!("no such folder: {}", path)))?;

        let mut out = Vec::new();
        for seq in start..=end {
            let Some(message) = folder.messages.get((seq - 1) as usize) else {
                break;
            };
            out.push(MessageEnvelope {
                seq,
                uid: Some(seq),
                headers: parse_headers(&message.body),
                message_id: message.message_id.clone(),
                flags: message.flags.clone(),
                internal_date: Some(message.internal_date),
                body: message.body.clone(),
            });
        }
        Ok(out)
    }

    async fn contains_message_id(&mut self, path: &str, message_id: &str) -> Result<bool> {
        let needle = normalize_message_id(message_id);
        let state = self.mailbox.lock();
        let folder = state
            .folders
            .get(path)
            .ok_or_else(|| FerryError::Search(format!("no such folder: {}", path)))?;
        Ok(folder
            .messages
            .iter()
            .any(|m| m.message_id.is_some() && m.message_id == needle))
    }

    async fn append(
        &mut self,
        path: &str,
        body: &[u8],
        flags: &[MessageFlag],
        internal_date: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let message_id = extract_message_id(body);
        let mut state = self.mailbox.lock();
        if state.fail_append.contains(path) {
            return Err(FerryError::Append(format!("append rejected in {}", path)));
        }
        let folder = state
            .folders
            .get_mut(path)
            .ok_or_else(|| FerryError::Append(format!("no such folder: {}", path)))?;
        folder.messages.push(StoredMessage {
            body: body.to_vec(),
            flags: flags.to_vec(),
            internal_date: internal_date.unwrap_or_else(Utc::now),
            message_id,
        });
        Ok(())
    }

    async fn noop(&mut self) -> Result<()> {
        if self.mailbox.lock().fail_noop {
            return Err(FerryError::Connection("session is gone".into()));
        }
        Ok(())
    }

    async fn logout(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Connector that resolves endpoint hosts to in-memory mailboxes.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    mailboxes: Mutex<BTreeMap<String, MemoryMailbox>>,
    reject_auth: Mutex<HashSet<String>>,
    refuse_dial: Mutex<HashSet<String>>,
    dials: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mailbox reachable as `host`.
    pub fn register(&self, host: &str, mailbox: MemoryMailbox) {
        self.mailboxes
            .lock()
            .expect("connector lock poisoned")
            .insert(host.to_string(), mailbox);
    }

    /// Make authentication against `host` fail.
    pub fn reject_auth(&self, host: &str) {
        self.reject_auth
            .lock()
            .expect("connector lock poisoned")
            .insert(host.to_string());
    }

    /// Make dialing `host` fail outright.
    pub fn refuse_dial(&self, host: &str) {
        self.refuse_dial
            .lock()
            .expect("connector lock poisoned")
            .insert(host.to_string());
    }

    /// Number of successful dials, for pool reuse assertions.
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EndpointConnector for MemoryConnector {
    async fn connect(&self, config: &EndpointConfig) -> Result<Box<dyn MailEndpoint>> {
        if self
            .refuse_dial
            .lock()
            .expect("connector lock poisoned")
            .contains(&config.host)
        {
            return Err(FerryError::Connection(format!(
                "connection refused: {}",
                config.host
            )));
        }
        if self
            .reject_auth
            .lock()
            .expect("connector lock poisoned")
            .contains(&config.host)
        {
            return Err(FerryError::Auth(format!(
                "credentials rejected for {}; if the provider requires it, use an \
                 application-specific password",
                config.username
            )));
        }
        let mailbox = self
            .mailboxes
            .lock()
            .expect("connector lock poisoned")
            .get(&config.host)
            .cloned()
            .ok_or_else(|| FerryError::Connection(format!("unknown host: {}", config.host)))?;
        self.dials.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryEndpoint::new(mailbox)))
    }
}

fn extract_message_id(body: &[u8]) -> Option<String> {
    parse_headers(body)
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("Message-ID"))
        .and_then(|(_, v)| normalize_message_id(v))
}
