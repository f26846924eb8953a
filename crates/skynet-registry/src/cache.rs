//! Watched hierarchical store cache.
//!
//! Mirrors a configured subtree of the coordination store, re-arms
//! the one-shot watches after every event, and fans out created/
//! updated/deleted callbacks to subscribers. All store events for a
//! session are consumed in order by a single watcher task; subscriber
//! callbacks run on that task and must therefore stay short.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::{broadcast, mpsc, Mutex};

use skynet_core::payload::RegistryValue;

use crate::store::{
    join_path, normalize_path, parent_path, EventKind, StoreAdapter, StoreError, StoreEvent,
};

/// Callback for created and updated nodes:
/// `(relative_path, value, version)`.
pub type NodeCallback = Box<dyn Fn(&str, &RegistryValue, i32) + Send + Sync>;
/// Callback for deleted nodes: `(relative_path)`.
pub type DeleteCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Pattern matching every path.
pub const WILDCARD: &str = "*";

#[derive(Debug, Default)]
struct NodeState {
    /// Child names at the time of the last children read; diffed
    /// against the next `ChangedChildren` event.
    children: Vec<String>,
    version: i32,
    ephemeral: bool,
}

#[derive(Default)]
struct Subscriptions {
    created: Vec<(String, NodeCallback)>,
    updated: Vec<(String, NodeCallback)>,
    deleted: Vec<(String, DeleteCallback)>,
}

pub struct TreeCache {
    adapter: Arc<dyn StoreAdapter>,
    /// Absolute, normalized root of the mirrored subtree.
    root: String,
    /// Per-path watch state. Touched only by the watcher task and the
    /// public API.
    nodes: Mutex<HashMap<String, NodeState>>,
    subs: StdMutex<Subscriptions>,
    shutdown: broadcast::Sender<()>,
}

impl TreeCache {
    /// Build a cache without touching the store. Register
    /// subscriptions, then call `start`.
    pub fn new(adapter: Arc<dyn StoreAdapter>, root: &str) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(Self {
            adapter,
            root: normalize_path(root),
            nodes: Mutex::new(HashMap::new()),
            subs: StdMutex::new(Subscriptions::default()),
            shutdown,
        })
    }

    /// `new` followed by `start`, for callers with no bootstrap-time
    /// subscriptions.
    pub async fn open(adapter: Arc<dyn StoreAdapter>, root: &str) -> Result<Arc<Self>, StoreError> {
        let cache = Self::new(adapter, root);
        cache.start().await?;
        Ok(cache)
    }

    /// Create the root if absent, take the event sink, perform the
    /// initial snapshot, and spawn the watcher task.
    pub async fn start(self: &Arc<Self>) -> Result<(), StoreError> {
        self.ensure_root().await?;
        let events = self.adapter.take_events().ok_or_else(|| {
            StoreError::Invalid("store event sink already taken by another cache".to_string())
        })?;
        self.subscribe_subtree(self.root.clone()).await?;

        let cache = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(cache.watch_loop(events, shutdown));
        Ok(())
    }

    // ── Public contract ───────────────────────────────────────────────────────

    /// Single-node read. `None` when the node does not exist.
    pub async fn get(&self, key: &str) -> Result<Option<RegistryValue>, StoreError> {
        match self.adapter.get(&self.absolute(key), false).await {
            Ok((data, _)) => Ok(Some(RegistryValue::decode_bytes(&data))),
            Err(StoreError::NoNode(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write a value, creating missing ancestors with empty values.
    pub async fn put(&self, key: &str, value: &RegistryValue) -> Result<(), StoreError> {
        self.write(key, value, false).await
    }

    /// Like `put`, but the leaf dies with the store session. Only
    /// leaves can be ephemeral; ancestors are created durable.
    pub async fn put_ephemeral(&self, key: &str, value: &RegistryValue) -> Result<(), StoreError> {
        self.write(key, value, true).await
    }

    /// Delete the leaf. With `remove_empty_parents`, walk ancestors
    /// removing each that has no value and no children.
    pub async fn delete(&self, key: &str, remove_empty_parents: bool) -> Result<(), StoreError> {
        let path = self.absolute(key);
        match self.adapter.delete(&path).await {
            Ok(()) | Err(StoreError::NoNode(_)) => {}
            Err(e) => return Err(e),
        }

        if remove_empty_parents {
            let mut current = parent_path(&path).map(str::to_string);
            while let Some(p) = current {
                if p == self.root || p == "/" {
                    break;
                }
                match self.adapter.get(&p, false).await {
                    Ok((data, stat)) if data.is_empty() && stat.num_children == 0 => {
                        match self.adapter.delete(&p).await {
                            Ok(()) | Err(StoreError::NoNode(_)) => {}
                            // A child appeared between the read and the delete.
                            Err(StoreError::Invalid(_)) => break,
                            Err(e) => return Err(e),
                        }
                    }
                    Ok(_) => break,
                    Err(StoreError::NoNode(_)) => {}
                    Err(e) => return Err(e),
                }
                current = parent_path(&p).map(str::to_string);
            }
        }
        Ok(())
    }

    /// Depth-first `(relative_path, value)` pairs under `subpath`,
    /// skipping nodes whose value is empty.
    pub async fn each_pair(
        &self,
        subpath: &str,
    ) -> Result<Vec<(String, RegistryValue)>, StoreError> {
        let base = self.absolute(subpath);
        let mut out = Vec::new();
        let mut stack = vec![base.clone()];

        while let Some(path) = stack.pop() {
            let (data, stat) = match self.adapter.get(&path, false).await {
                Ok(r) => r,
                Err(StoreError::NoNode(_)) => continue,
                Err(e) => return Err(e),
            };
            if !data.is_empty() && path != base {
                let rel = path
                    .strip_prefix(&base)
                    .unwrap_or(&path)
                    .trim_start_matches('/')
                    .to_string();
                out.push((rel, RegistryValue::decode_bytes(&data)));
            }
            if !stat.ephemeral {
                match self.adapter.children(&path, false).await {
                    Ok(children) => {
                        for child in children.iter().rev() {
                            stack.push(join_path(&path, child));
                        }
                    }
                    Err(StoreError::NoNode(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(out)
    }

    /// Subscribe to node creations. `pattern` is an exact relative
    /// path or `"*"`.
    pub fn on_create<F>(&self, pattern: &str, callback: F)
    where
        F: Fn(&str, &RegistryValue, i32) + Send + Sync + 'static,
    {
        self.subs
            .lock()
            .unwrap()
            .created
            .push((pattern.to_string(), Box::new(callback)));
    }

    pub fn on_update<F>(&self, pattern: &str, callback: F)
    where
        F: Fn(&str, &RegistryValue, i32) + Send + Sync + 'static,
    {
        self.subs
            .lock()
            .unwrap()
            .updated
            .push((pattern.to_string(), Box::new(callback)));
    }

    pub fn on_delete<F>(&self, pattern: &str, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.subs
            .lock()
            .unwrap()
            .deleted
            .push((pattern.to_string(), Box::new(callback)));
    }

    /// Release the session and stop the watcher. Subscribers fire no
    /// further callbacks.
    pub async fn close(&self) {
        let _ = self.shutdown.send(());
        self.adapter.close().await;
    }

    // ── Watcher ───────────────────────────────────────────────────────────────

    async fn watch_loop(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<StoreEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::debug!(root = %self.root, "cache watcher shutting down");
                    return;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        tracing::debug!(root = %self.root, "store event sink closed");
                        return;
                    };
                    if event.kind == EventKind::SessionExpired {
                        tracing::warn!(root = %self.root, "store session expired; rebootstrapping");
                        // Bootstrap on its own task so it is not
                        // serialized behind this event loop.
                        let cache = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = cache.rebootstrap().await {
                                tracing::error!(error = %e, "rebootstrap after session expiry failed");
                            }
                        });
                    } else {
                        self.handle_event(event).await;
                    }
                }
            }
        }
    }

    async fn handle_event(&self, event: StoreEvent) {
        match event.kind {
            EventKind::ChangedValue => match self.adapter.get(&event.path, true).await {
                Ok((data, stat)) => {
                    if let Some(state) = self.nodes.lock().await.get_mut(&event.path) {
                        state.version = stat.version;
                    }
                    let rel = self.relative(&event.path);
                    self.fire_updated(&rel, &RegistryValue::decode_bytes(&data), stat.version);
                }
                // Deleted before the re-read; the Deleted event reports it.
                Err(StoreError::NoNode(_)) => {}
                Err(e) => {
                    tracing::warn!(path = %event.path, error = %e, "re-read after value change failed");
                }
            },

            EventKind::ChangedChildren => match self.adapter.children(&event.path, true).await {
                Ok(children) => {
                    let added: Vec<String> = {
                        let mut nodes = self.nodes.lock().await;
                        let state = nodes.entry(event.path.clone()).or_default();
                        let added = children
                            .iter()
                            .filter(|c| !state.children.contains(c))
                            .cloned()
                            .collect();
                        // Departed children are reported through their
                        // own Deleted events, not diffed here.
                        state.children = children;
                        added
                    };
                    for child in added {
                        let path = join_path(&event.path, &child);
                        if let Err(e) = self.subscribe_subtree(path.clone()).await {
                            tracing::warn!(path = %path, error = %e, "failed to subscribe new child");
                        }
                    }
                }
                Err(StoreError::NoNode(_)) => {}
                Err(e) => {
                    tracing::warn!(path = %event.path, error = %e, "children re-read failed");
                }
            },

            EventKind::Deleted => {
                self.nodes.lock().await.remove(&event.path);
                self.fire_deleted(&self.relative(&event.path));
            }

            // A re-appearance is covered by the parent's ChangedChildren.
            EventKind::Created => {}

            EventKind::SessionExpired => unreachable!("handled by the watch loop"),

            EventKind::Disconnected => {
                tracing::warn!(root = %self.root, "store disconnected; watches resume on reconnect");
            }
        }
    }

    /// Depth-first walk installing watches, recording child lists,
    /// and firing `on_create` for every node with a non-empty value.
    /// Used for the initial snapshot, for new children, and for the
    /// post-expiry rebuild.
    async fn subscribe_subtree(&self, base: String) -> Result<(), StoreError> {
        let mut stack = vec![base];
        while let Some(path) = stack.pop() {
            let (data, stat) = match self.adapter.get(&path, true).await {
                Ok(r) => r,
                // Deleted while walking; its parent's diff catches up later.
                Err(StoreError::NoNode(_)) => continue,
                Err(e) => return Err(e),
            };
            if !data.is_empty() {
                let rel = self.relative(&path);
                self.fire_created(&rel, &RegistryValue::decode_bytes(&data), stat.version);
            }
            let children = if stat.ephemeral {
                Vec::new()
            } else {
                match self.adapter.children(&path, true).await {
                    Ok(c) => c,
                    Err(StoreError::NoNode(_)) => Vec::new(),
                    Err(e) => return Err(e),
                }
            };
            for child in children.iter().rev() {
                stack.push(join_path(&path, child));
            }
            self.nodes.lock().await.insert(
                path,
                NodeState {
                    children,
                    version: stat.version,
                    ephemeral: stat.ephemeral,
                },
            );
        }
        Ok(())
    }

    /// Fresh session, fresh snapshot. Subscribers remain; nodes that
    /// vanished while the session was down are reported as deleted.
    async fn rebootstrap(&self) -> Result<(), StoreError> {
        self.adapter.reconnect().await?;
        self.ensure_root().await?;

        let previous: Vec<String> = {
            let mut nodes = self.nodes.lock().await;
            let paths = nodes.keys().cloned().collect();
            nodes.clear();
            paths
        };

        self.subscribe_subtree(self.root.clone()).await?;

        let vanished: Vec<String> = {
            let nodes = self.nodes.lock().await;
            previous
                .into_iter()
                .filter(|p| !nodes.contains_key(p))
                .collect()
        };
        for path in vanished {
            self.fire_deleted(&self.relative(&path));
        }
        Ok(())
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    async fn ensure_root(&self) -> Result<(), StoreError> {
        let mut path = String::new();
        for part in self.root.split('/').filter(|p| !p.is_empty()) {
            path.push('/');
            path.push_str(part);
            match self.adapter.create(&path, b"", false).await {
                Ok(()) | Err(StoreError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn write(
        &self,
        key: &str,
        value: &RegistryValue,
        ephemeral: bool,
    ) -> Result<(), StoreError> {
        let path = self.absolute(key);

        // Create missing ancestors with empty values first.
        if let Some(parent) = parent_path(&path) {
            let mut ancestor = String::new();
            for part in parent.split('/').filter(|p| !p.is_empty()) {
                ancestor.push('/');
                ancestor.push_str(part);
                match self.adapter.create(&ancestor, b"", false).await {
                    Ok(()) | Err(StoreError::NodeExists(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let data = value.encode_bytes();
        match self.adapter.create(&path, &data, ephemeral).await {
            Ok(()) => Ok(()),
            Err(StoreError::NodeExists(_)) => {
                self.adapter.set(&path, &data).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn absolute(&self, key: &str) -> String {
        if key.is_empty() {
            self.root.clone()
        } else {
            normalize_path(&format!("{}/{}", self.root, key))
        }
    }

    fn relative(&self, path: &str) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .trim_start_matches('/')
            .to_string()
    }

    // Specific subscriptions fire before the wildcard, each once, in
    // registration order.
    fn fire_created(&self, rel: &str, value: &RegistryValue, version: i32) {
        let subs = self.subs.lock().unwrap();
        for (_, cb) in subs.created.iter().filter(|(p, _)| p.as_str() == rel && p != WILDCARD) {
            guard(rel, || cb(rel, value, version));
        }
        for (_, cb) in subs.created.iter().filter(|(p, _)| p.as_str() == WILDCARD) {
            guard(rel, || cb(rel, value, version));
        }
    }

    fn fire_updated(&self, rel: &str, value: &RegistryValue, version: i32) {
        let subs = self.subs.lock().unwrap();
        for (_, cb) in subs.updated.iter().filter(|(p, _)| p.as_str() == rel && p != WILDCARD) {
            guard(rel, || cb(rel, value, version));
        }
        for (_, cb) in subs.updated.iter().filter(|(p, _)| p.as_str() == WILDCARD) {
            guard(rel, || cb(rel, value, version));
        }
    }

    fn fire_deleted(&self, rel: &str) {
        let subs = self.subs.lock().unwrap();
        for (_, cb) in subs.deleted.iter().filter(|(p, _)| p.as_str() == rel && p != WILDCARD) {
            guard(rel, || cb(rel));
        }
        for (_, cb) in subs.deleted.iter().filter(|(p, _)| p.as_str() == WILDCARD) {
            guard(rel, || cb(rel));
        }
    }
}

/// Subscriber exceptions never stop the watcher loop.
fn guard<F: FnOnce()>(path: &str, f: F) {
    if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::warn!(path = %path, "subscriber callback panicked; continuing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[tokio::test]
    async fn absolute_and_relative_are_inverses() {
        let cache = TreeCache::new(Arc::new(MemoryStore::new()), "/instances");
        assert_eq!(cache.absolute("abc/registered"), "/instances/abc/registered");
        assert_eq!(cache.relative("/instances/abc/registered"), "abc/registered");
        assert_eq!(cache.absolute(""), "/instances");
        assert_eq!(cache.relative("/instances"), "");
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_poison_the_rest() {
        let cache = TreeCache::new(Arc::new(MemoryStore::new()), "/r");
        let (tx, mut rx) = mpsc::unbounded_channel();
        cache.on_create("a", |_, _, _| panic!("boom"));
        cache.on_create(WILDCARD, move |rel, _, _| {
            let _ = tx.send(rel.to_string());
        });

        cache.fire_created("a", &RegistryValue::Int(1), 0);
        assert_eq!(rx.try_recv().unwrap(), "a");
    }
}
