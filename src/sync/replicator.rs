//! Folder discovery and replication
//!
//! Discovery materializes the source hierarchy as a tree of `FolderNode`s
//! built fresh from a live listing. Replication walks that tree pre-order
//! so a child is never created before its parent, treating "already
//! exists" as success.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{CreateOutcome, FolderEntry, MailEndpoint};
use crate::error::Result;

/// One mailbox folder in the discovered hierarchy. A read-only view of
/// remote state; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderNode {
    /// Leaf name (last path segment)
    pub name: String,
    /// Full hierarchical path
    pub path: String,
    pub delimiter: Option<String>,
    pub attributes: Vec<String>,
    /// False for scaffolding nodes synthesized for unlisted parents
    pub listed: bool,
    pub children: Vec<FolderNode>,
}

impl FolderNode {
    fn placeholder(name: &str, path: &str, delimiter: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            delimiter,
            attributes: Vec::new(),
            listed: false,
            children: Vec::new(),
        }
    }

    /// Whether messages can be migrated out of this folder.
    pub fn is_selectable(&self) -> bool {
        self.listed && !self.attributes.iter().any(|a| a.contains("NoSelect"))
    }
}

/// Outcome counters for one replication pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationReport {
    pub created: u32,
    pub skipped: u32,
    pub errors: u32,
}

/// List the source and assemble the folder tree.
pub async fn discover(endpoint: &mut dyn MailEndpoint) -> Result<Vec<FolderNode>> {
    let entries = endpoint.list_folders().await?;
    info!("Discovered {} folders at source", entries.len());
    Ok(build_tree(entries))
}

/// Assemble trees from a flat listing by splitting each path on its
/// reported hierarchy delimiter. Parents missing from the listing get
/// placeholder nodes so traversal order stays parent-before-children.
pub fn build_tree(mut entries: Vec<FolderEntry>) -> Vec<FolderNode> {
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    let mut roots: Vec<FolderNode> = Vec::new();
    for entry in entries {
        insert_entry(&mut roots, entry);
    }
    roots
}

fn insert_entry(roots: &mut Vec<FolderNode>, entry: FolderEntry) {
    let segments: Vec<String> = match entry.delimiter.as_deref() {
        Some(d) if !d.is_empty() => entry.name.split(d).map(str::to_string).collect(),
        _ => vec![entry.name.clone()],
    };

    let delimiter = entry.delimiter.clone();
    let mut children = roots;
    let mut prefix = String::new();

    for (idx, segment) in segments.iter().enumerate() {
        if !prefix.is_empty() {
            prefix.push_str(delimiter.as_deref().unwrap_or("/"));
        }
        prefix.push_str(segment);

        let position = children.iter().position(|c| c.path == prefix);
        let position = match position {
            Some(p) => p,
            None => {
                children.push(FolderNode::placeholder(segment, &prefix, delimiter.clone()));
                children.len() - 1
            }
        };

        if idx == segments.len() - 1 {
            let node = &mut children[position];
            node.listed = true;
            node.attributes = entry.attributes.clone();
            node.delimiter = entry.delimiter.clone();
            return;
        }
        children = &mut children[position].children;
    }
}

/// Pre-order traversal: every parent before any of its children.
pub fn flatten(nodes: &[FolderNode]) -> Vec<&FolderNode> {
    let mut out = Vec::new();
    for node in nodes {
        out.push(node);
        out.extend(flatten(&node.children));
    }
    out
}

/// Prune the forest to the requested folder subset plus the ancestors
/// needed to reach it. Only exact subset matches stay selectable.
pub fn prune_to_subset(nodes: Vec<FolderNode>, subset: &[String]) -> Vec<FolderNode> {
    nodes
        .into_iter()
        .filter_map(|mut node| {
            node.children = prune_to_subset(std::mem::take(&mut node.children), subset);
            let wanted = subset.iter().any(|s| s == &node.path);
            if wanted {
                Some(node)
            } else if !node.children.is_empty() {
                // ancestor kept only as scaffolding
                node.listed = false;
                Some(node)
            } else {
                None
            }
        })
        .collect()
}

/// Create the discovered hierarchy at the destination, idempotently.
/// Creation failures other than "already exists" are counted and traversal
/// continues with siblings.
pub async fn replicate(
    endpoint: &mut dyn MailEndpoint,
    nodes: &[FolderNode],
) -> ReplicationReport {
    let mut report = ReplicationReport::default();
    for node in flatten(nodes) {
        match endpoint.create_folder(&node.path).await {
            Ok(CreateOutcome::Created) => {
                debug!(folder = %node.path, "Created folder at destination");
                report.created += 1;
            }
            Ok(CreateOutcome::AlreadyExists) => {
                debug!(folder = %node.path, "Folder already exists at destination");
                report.skipped += 1;
            }
            Err(e) => {
                warn!(folder = %node.path, "Folder creation failed: {}", e);
                report.errors += 1;
            }
        }
    }
    info!(
        created = report.created,
        skipped = report.skipped,
        errors = report.errors,
        "Replicated folder hierarchy"
    );
    report
}
