//! Coordination-store adapter interface.
//!
//! The store is modeled as a hierarchical, watchable key-value
//! service. Watches are one-shot: a `watch = true` read must be
//! re-issued after every event to keep observing a node. Transient
//! store errors are retried inside the adapter; `NoNode` and
//! `SessionExpired` surface to the caller.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Node metadata returned alongside reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    /// Store-side modification version of the node's value.
    pub version: i32,
    pub num_children: u32,
    /// Ephemeral nodes have no children and are deleted automatically
    /// when their creator's session ends.
    pub ephemeral: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ChangedValue,
    ChangedChildren,
    Deleted,
    Created,
    SessionExpired,
    Disconnected,
}

/// One store event, delivered in session order to the single watcher
/// sink.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub kind: EventKind,
    /// Absolute path the event refers to. Empty for session-level
    /// events.
    pub path: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no node at {0}")]
    NoNode(String),
    #[error("node already exists at {0}")]
    NodeExists(String),
    #[error("invalid store operation: {0}")]
    Invalid(String),
    #[error("store session expired")]
    SessionExpired,
    #[error("store connection lost: {0}")]
    ConnectionLoss(String),
}

/// The coordination store, reduced to the operations the cache needs.
///
/// Implementations deliver every watch event, in order, to the
/// receiver handed out by `take_events` — there is exactly one
/// watcher sink per session.
#[async_trait]
pub trait StoreAdapter: Send + Sync + 'static {
    /// Create a node. The parent must already exist; ephemeral nodes
    /// cannot have children.
    async fn create(&self, path: &str, data: &[u8], ephemeral: bool) -> Result<(), StoreError>;

    /// Overwrite an existing node's value.
    async fn set(&self, path: &str, data: &[u8]) -> Result<Stat, StoreError>;

    /// Read a node's value and stat, optionally arming a one-shot
    /// value watch.
    async fn get(&self, path: &str, watch: bool) -> Result<(Vec<u8>, Stat), StoreError>;

    /// List a node's child names, optionally arming a one-shot child
    /// watch.
    async fn children(&self, path: &str, watch: bool) -> Result<Vec<String>, StoreError>;

    /// Delete a childless node.
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    async fn exists(&self, path: &str) -> Result<bool, StoreError>;

    /// Take the event receiver. Returns `None` after the first call;
    /// the cache is the only consumer.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<StoreEvent>>;

    /// Open a fresh session after expiry. Watches do not survive.
    async fn reconnect(&self) -> Result<(), StoreError>;

    /// Release the session.
    async fn close(&self);
}

/// Normalize a path: ensure a single leading slash, collapse doubled
/// separators, strip any trailing slash (except for the root).
pub fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    out.push('/');
    for part in path.split('/').filter(|p| !p.is_empty()) {
        if !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(part);
    }
    out
}

/// The parent of a normalized path; `None` at the root.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Join a normalized base with a relative component.
pub fn join_path(base: &str, child: &str) -> String {
    if base == "/" {
        format!("/{child}")
    } else {
        format!("{base}/{child}")
    }
}
