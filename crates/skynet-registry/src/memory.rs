//! In-memory coordination store.
//!
//! Implements the full adapter contract — one-shot watches, ephemeral
//! nodes, session expiry — against a process-local tree. This is the
//! loopback store behind local development and the integration tests;
//! networked backends plug in through the same `StoreAdapter` trait.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::store::{
    join_path, normalize_path, parent_path, EventKind, Stat, StoreAdapter, StoreError, StoreEvent,
};

#[derive(Debug, Default)]
struct Node {
    data: Vec<u8>,
    version: i32,
    ephemeral: bool,
    children: BTreeSet<String>,
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<String, Node>,
    value_watches: BTreeSet<String>,
    child_watches: BTreeSet<String>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<StoreEvent>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<StoreEvent>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        let mut inner = Inner::default();
        inner.nodes.insert("/".to_string(), Node::default());
        Self {
            inner: Mutex::new(inner),
            events,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Simulate session expiry: every ephemeral node is removed, all
    /// watches die, and the sink receives `SessionExpired`.
    pub fn expire_session(&self) {
        let mut inner = self.inner.lock().unwrap();
        let ephemerals: Vec<String> = inner
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral)
            .map(|(path, _)| path.clone())
            .collect();
        for path in ephemerals {
            inner.nodes.remove(&path);
            if let Some(parent) = parent_path(&path) {
                let name = path.rsplit('/').next().unwrap_or_default().to_string();
                if let Some(parent_node) = inner.nodes.get_mut(parent) {
                    parent_node.children.remove(&name);
                }
            }
        }
        inner.value_watches.clear();
        inner.child_watches.clear();
        self.emit(EventKind::SessionExpired, "");
    }

    /// Simulate a transient disconnect notification.
    pub fn disconnect(&self) {
        self.emit(EventKind::Disconnected, "");
    }

    fn emit(&self, kind: EventKind, path: &str) {
        let _ = self.events.send(StoreEvent {
            kind,
            path: path.to_string(),
        });
    }

    fn stat_of(node: &Node) -> Stat {
        Stat {
            version: node.version,
            num_children: node.children.len() as u32,
            ephemeral: node.ephemeral,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    async fn create(&self, path: &str, data: &[u8], ephemeral: bool) -> Result<(), StoreError> {
        let path = normalize_path(path);
        let mut inner = self.inner.lock().unwrap();

        if inner.nodes.contains_key(&path) {
            return Err(StoreError::NodeExists(path));
        }
        let parent = parent_path(&path)
            .ok_or_else(|| StoreError::Invalid("cannot create the root".to_string()))?
            .to_string();
        match inner.nodes.get(&parent) {
            None => return Err(StoreError::NoNode(parent)),
            Some(node) if node.ephemeral => {
                return Err(StoreError::Invalid(format!(
                    "ephemeral node {parent} cannot have children"
                )))
            }
            Some(_) => {}
        }

        let name = path.rsplit('/').next().unwrap_or_default().to_string();
        inner.nodes.insert(
            path.clone(),
            Node {
                data: data.to_vec(),
                version: 0,
                ephemeral,
                children: BTreeSet::new(),
            },
        );
        if let Some(parent_node) = inner.nodes.get_mut(&parent) {
            parent_node.children.insert(name);
        }

        if inner.value_watches.remove(&path) {
            self.emit(EventKind::Created, &path);
        }
        if inner.child_watches.remove(&parent) {
            self.emit(EventKind::ChangedChildren, &parent);
        }
        Ok(())
    }

    async fn set(&self, path: &str, data: &[u8]) -> Result<Stat, StoreError> {
        let path = normalize_path(path);
        let mut inner = self.inner.lock().unwrap();

        let node = inner
            .nodes
            .get_mut(&path)
            .ok_or_else(|| StoreError::NoNode(path.clone()))?;
        node.data = data.to_vec();
        node.version += 1;
        let stat = Self::stat_of(node);

        if inner.value_watches.remove(&path) {
            self.emit(EventKind::ChangedValue, &path);
        }
        Ok(stat)
    }

    async fn get(&self, path: &str, watch: bool) -> Result<(Vec<u8>, Stat), StoreError> {
        let path = normalize_path(path);
        let mut inner = self.inner.lock().unwrap();

        let (data, stat) = {
            let node = inner
                .nodes
                .get(&path)
                .ok_or_else(|| StoreError::NoNode(path.clone()))?;
            (node.data.clone(), Self::stat_of(node))
        };
        if watch {
            inner.value_watches.insert(path);
        }
        Ok((data, stat))
    }

    async fn children(&self, path: &str, watch: bool) -> Result<Vec<String>, StoreError> {
        let path = normalize_path(path);
        let mut inner = self.inner.lock().unwrap();

        let names: Vec<String> = {
            let node = inner
                .nodes
                .get(&path)
                .ok_or_else(|| StoreError::NoNode(path.clone()))?;
            node.children.iter().cloned().collect()
        };
        if watch {
            inner.child_watches.insert(path);
        }
        Ok(names)
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let path = normalize_path(path);
        let mut inner = self.inner.lock().unwrap();

        match inner.nodes.get(&path) {
            None => return Err(StoreError::NoNode(path)),
            Some(node) if !node.children.is_empty() => {
                return Err(StoreError::Invalid(format!("node {path} has children")))
            }
            Some(_) => {}
        }

        inner.nodes.remove(&path);
        let parent = parent_path(&path).unwrap_or("/").to_string();
        let name = path.rsplit('/').next().unwrap_or_default().to_string();
        if let Some(parent_node) = inner.nodes.get_mut(&parent) {
            parent_node.children.remove(&name);
        }

        let value_watched = inner.value_watches.remove(&path);
        let child_watched = inner.child_watches.remove(&path);
        if value_watched || child_watched {
            self.emit(EventKind::Deleted, &path);
        }
        if inner.child_watches.remove(&parent) {
            self.emit(EventKind::ChangedChildren, &parent);
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let path = normalize_path(path);
        Ok(self.inner.lock().unwrap().nodes.contains_key(&path))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<StoreEvent>> {
        self.receiver.lock().unwrap().take()
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.value_watches.clear();
        inner.child_watches.clear();
        Ok(())
    }

    async fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.value_watches.clear();
        inner.child_watches.clear();
    }
}
