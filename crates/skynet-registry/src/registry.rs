//! Service registry — instance records in, ranked endpoints out.
//!
//! Instance records live under the cache root as one directory per
//! UUID with leaf attributes `addr`, `name`, `version`, `region`, and
//! `registered` (the atomic publish flag, written last). The registry
//! folds cache callbacks into an indexed lookup keyed
//! `"<name>/<version>/<region>"`, each key holding score groups in
//! descending locality order.

use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;

use skynet_core::error::RpcError;
use skynet_core::payload::{MapKey, RegistryValue};

use crate::cache::{TreeCache, WILDCARD};
use crate::store::{StoreAdapter, StoreError};

/// All endpoints of equal locality score under one registry key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreGroup {
    pub score: u8,
    pub endpoints: Vec<String>,
}

type Index = Arc<DashMap<String, Vec<ScoreGroup>>>;
type Partials = Arc<DashMap<String, PartialInstance>>;
type RemovedHook = Box<dyn FnOnce() + Send + Sync>;
type Hooks = Arc<DashMap<String, Vec<RemovedHook>>>;

/// Attributes observed so far for one UUID. An instance enters the
/// index only when `registered` is true and the rest are present.
#[derive(Debug, Default)]
struct PartialInstance {
    addr: Option<String>,
    name: Option<String>,
    version: Option<String>,
    region: Option<String>,
    registered: bool,
}

impl PartialInstance {
    fn key_and_endpoint(&self) -> Option<(String, String)> {
        let addr = self.addr.as_ref()?;
        let name = self.name.as_ref()?;
        let version = self.version.as_ref()?;
        let region = self.region.as_ref()?;
        Some((format!("{name}/{version}/{region}"), addr.clone()))
    }
}

pub struct ServiceRegistry {
    cache: Arc<TreeCache>,
    local_ip: Ipv4Addr,
    index: Index,
    partials: Partials,
    hooks: Hooks,
}

impl ServiceRegistry {
    /// Build the registry over a fresh cache on `adapter`, subscribe
    /// to instance-record events, and bootstrap.
    pub async fn open(
        adapter: Arc<dyn StoreAdapter>,
        root: &str,
        local_ip: Ipv4Addr,
    ) -> Result<Arc<Self>, StoreError> {
        let cache = TreeCache::new(adapter, root);
        let registry = Arc::new(Self {
            cache: cache.clone(),
            local_ip,
            index: Arc::new(DashMap::new()),
            partials: Arc::new(DashMap::new()),
            hooks: Arc::new(DashMap::new()),
        });

        {
            let index = registry.index.clone();
            let partials = registry.partials.clone();
            let hooks = registry.hooks.clone();
            cache.on_create(WILDCARD, move |rel, value, _| {
                apply_attribute(&index, &partials, &hooks, local_ip, rel, value);
            });
        }
        {
            let index = registry.index.clone();
            let partials = registry.partials.clone();
            let hooks = registry.hooks.clone();
            cache.on_update(WILDCARD, move |rel, value, _| {
                apply_attribute(&index, &partials, &hooks, local_ip, rel, value);
            });
        }
        {
            let index = registry.index.clone();
            let partials = registry.partials.clone();
            let hooks = registry.hooks.clone();
            cache.on_delete(WILDCARD, move |rel| {
                apply_delete(&index, &partials, &hooks, rel);
            });
        }

        cache.start().await?;
        Ok(registry)
    }

    /// Publish one running instance. The `registered` flag is written
    /// last; consumers see nothing until it lands. All attribute
    /// leaves are ephemeral so a dead session withdraws the instance.
    pub async fn register(
        &self,
        name: &str,
        version: &str,
        region: &str,
        host: &str,
        port: u16,
    ) -> Result<(), StoreError> {
        let uuid = instance_uuid(host, port, std::process::id(), name, version);
        let endpoint = format!("{host}:{port}");

        self.cache
            .put_ephemeral(&format!("{uuid}/addr"), &RegistryValue::Str(endpoint.clone()))
            .await?;
        self.cache
            .put_ephemeral(&format!("{uuid}/name"), &RegistryValue::Str(name.to_string()))
            .await?;
        self.cache
            .put_ephemeral(
                &format!("{uuid}/version"),
                &RegistryValue::Str(version.to_string()),
            )
            .await?;
        self.cache
            .put_ephemeral(
                &format!("{uuid}/region"),
                &RegistryValue::Str(region.to_string()),
            )
            .await?;
        self.cache
            .put_ephemeral(&format!("{uuid}/registered"), &RegistryValue::Bool(true))
            .await?;

        // Visible to in-process callers without waiting for the watch
        // event to land.
        let key = format!("{name}/{version}/{region}");
        add_server(&self.index, &key, &endpoint, self.local_ip);

        tracing::info!(%uuid, %endpoint, "instance registered");
        Ok(())
    }

    /// Withdraw an instance: gone from local lookups immediately,
    /// then each attribute and the UUID node removed from the store.
    pub async fn deregister(
        &self,
        name: &str,
        version: &str,
        region: &str,
        host: &str,
        port: u16,
    ) -> Result<(), StoreError> {
        let uuid = instance_uuid(host, port, std::process::id(), name, version);
        let endpoint = format!("{host}:{port}");
        let key = format!("{name}/{version}/{region}");

        remove_server(&self.index, &self.hooks, &key, &endpoint, false);
        self.partials.remove(&uuid);

        // The publish flag comes out first, mirroring write order.
        self.cache
            .delete(&format!("{uuid}/registered"), false)
            .await?;
        for attr in ["addr", "name", "version", "region"] {
            self.cache.delete(&format!("{uuid}/{attr}"), false).await?;
        }
        self.cache.delete(&uuid, false).await?;

        tracing::info!(%uuid, %endpoint, "instance deregistered");
        Ok(())
    }

    /// Endpoints for a tuple, best locality first. A version of `"*"`
    /// resolves to the highest integer version observed for
    /// `(name, region)`.
    pub fn servers_for(
        &self,
        name: &str,
        version: &str,
        region: &str,
    ) -> Result<Vec<String>, RpcError> {
        Ok(self
            .score_groups_for(name, version, region)?
            .into_iter()
            .flat_map(|g| g.endpoints)
            .collect())
    }

    /// The ordered score groups for a tuple. Errors like `servers_for`.
    pub fn score_groups_for(
        &self,
        name: &str,
        version: &str,
        region: &str,
    ) -> Result<Vec<ScoreGroup>, RpcError> {
        let version = self.resolve_version(name, version, region);
        let key = format!("{name}/{version}/{region}");
        match self.index.get(&key) {
            Some(groups) if !groups.is_empty() => Ok(groups.clone()),
            _ => Err(RpcError::ServiceUnavailable {
                name: name.to_string(),
                version,
                region: region.to_string(),
            }),
        }
    }

    /// Uniform random selection among `servers_for`.
    pub fn server_for(&self, name: &str, version: &str, region: &str) -> Result<String, RpcError> {
        let servers = self.servers_for(name, version, region)?;
        let pick = rand::thread_rng().gen_range(0..servers.len());
        Ok(servers[pick].clone())
    }

    /// One-shot callback fired when the store observes `endpoint`
    /// disappear. A graceful `deregister` does not fire it.
    pub fn on_server_removed<F>(&self, endpoint: &str, callback: F)
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        self.hooks
            .entry(endpoint.to_string())
            .or_default()
            .push(Box::new(callback));
    }

    pub fn cache(&self) -> &Arc<TreeCache> {
        &self.cache
    }

    pub async fn close(&self) {
        self.cache.close().await;
    }

    fn resolve_version(&self, name: &str, version: &str, region: &str) -> String {
        if version != "*" {
            return version.to_string();
        }
        let prefix = format!("{name}/");
        let suffix = format!("/{region}");
        let mut best: Option<i64> = None;
        for entry in self.index.iter() {
            if let Some(mid) = entry
                .key()
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(&suffix))
            {
                if !mid.contains('/') {
                    if let Ok(v) = mid.parse::<i64>() {
                        best = Some(best.map_or(v, |b| b.max(v)));
                    }
                }
            }
        }
        match best {
            Some(v) => v.to_string(),
            None => version.to_string(),
        }
    }
}

/// Deterministic instance UUID: `"<ip>:<port>-<pid>-<Name>-<Version>"`.
pub fn instance_uuid(host: &str, port: u16, pid: u32, name: &str, version: &str) -> String {
    format!("{host}:{port}-{pid}-{name}-{version}")
}

/// Dotted-octet prefix match between an endpoint host and the local
/// IPv4: 4 = same host, 3 = same /24, down to 0 for no shared prefix.
/// Non-IPv4 hosts are resolved to IPv4 via DNS at scoring time.
pub fn locality_score(local: Ipv4Addr, host: &str) -> u8 {
    let Some(remote) = resolve_ipv4(host) else {
        return 0;
    };
    local
        .octets()
        .iter()
        .zip(remote.octets().iter())
        .take_while(|(a, b)| a == b)
        .count() as u8
}

fn resolve_ipv4(host: &str) -> Option<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Some(ip);
    }
    (host, 0u16).to_socket_addrs().ok()?.find_map(|addr| match addr {
        SocketAddr::V4(v4) => Some(*v4.ip()),
        SocketAddr::V6(_) => None,
    })
}

// ── Index maintenance ─────────────────────────────────────────────────────────

fn apply_attribute(
    index: &Index,
    partials: &Partials,
    hooks: &Hooks,
    local_ip: Ipv4Addr,
    rel: &str,
    value: &RegistryValue,
) {
    if let Some(record) = FlatRecord::parse(rel) {
        // Compatibility layout: one JSON blob per
        // <name>/<version>/<region>/<host>/<port> path.
        if flat_record_is_registered(value) {
            add_server(index, &record.key(), &record.endpoint(), local_ip);
        } else {
            remove_server(index, hooks, &record.key(), &record.endpoint(), false);
        }
        return;
    }

    let Some((uuid, attr)) = rel.split_once('/') else {
        return;
    };

    let mut entry = partials.entry(uuid.to_string()).or_default();
    match attr {
        "addr" => entry.addr = value.as_str().map(str::to_string),
        "name" => entry.name = value.as_str().map(str::to_string),
        "version" => entry.version = value.as_str().map(str::to_string),
        "region" => entry.region = value.as_str().map(str::to_string),
        "registered" => {
            entry.registered =
                value.as_bool().unwrap_or(false) || value.as_str() == Some("true");
        }
        _ => return,
    }

    if let Some((key, endpoint)) = entry.key_and_endpoint() {
        if entry.registered {
            add_server(index, &key, &endpoint, local_ip);
        } else if attr == "registered" {
            // Explicitly unpublished without deletion.
            remove_server(index, hooks, &key, &endpoint, false);
        }
    }
}

fn apply_delete(index: &Index, partials: &Partials, hooks: &Hooks, rel: &str) {
    if let Some(record) = FlatRecord::parse(rel) {
        remove_server(index, hooks, &record.key(), &record.endpoint(), true);
        return;
    }

    let Some((uuid, attr)) = rel.split_once('/') else {
        return;
    };
    if attr != "registered" {
        return;
    }
    if let Some((_, partial)) = partials.remove(uuid) {
        if let Some((key, endpoint)) = partial.key_and_endpoint() {
            remove_server(index, hooks, &key, &endpoint, true);
            tracing::debug!(%uuid, %endpoint, "instance withdrawn by store deletion");
        }
    }
}

/// The compatibility record layout:
/// `<name>/<version>/<region>/<host>/<port>` holding one JSON blob.
struct FlatRecord<'a> {
    name: &'a str,
    version: &'a str,
    region: &'a str,
    host: &'a str,
    port: &'a str,
}

impl<'a> FlatRecord<'a> {
    fn parse(rel: &'a str) -> Option<Self> {
        let mut parts = rel.split('/');
        let record = Self {
            name: parts.next()?,
            version: parts.next()?,
            region: parts.next()?,
            host: parts.next()?,
            port: parts.next()?,
        };
        if parts.next().is_some() || record.port.parse::<u16>().is_err() {
            return None;
        }
        Some(record)
    }

    fn key(&self) -> String {
        format!("{}/{}/{}", self.name, self.version, self.region)
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A flat record publishes its instance when the blob's `registered`
/// field is true.
fn flat_record_is_registered(value: &RegistryValue) -> bool {
    let RegistryValue::Map(pairs) = value else {
        return false;
    };
    pairs
        .iter()
        .find(|(key, _)| matches!(key, MapKey::Str(k) | MapKey::Sym(k) if k == "registered"))
        .and_then(|(_, v)| v.as_bool())
        .unwrap_or(false)
}

fn add_server(index: &Index, key: &str, endpoint: &str, local_ip: Ipv4Addr) {
    let host = endpoint.split(':').next().unwrap_or(endpoint);
    let score = locality_score(local_ip, host);

    let mut groups = index.entry(key.to_string()).or_default();
    // Re-inserts are idempotent; drop any stale placement first.
    for group in groups.iter_mut() {
        group.endpoints.retain(|e| e != endpoint);
    }
    groups.retain(|g| !g.endpoints.is_empty());

    match groups.iter_mut().find(|g| g.score == score) {
        Some(group) => group.endpoints.push(endpoint.to_string()),
        None => {
            let pos = groups
                .iter()
                .position(|g| g.score < score)
                .unwrap_or(groups.len());
            groups.insert(
                pos,
                ScoreGroup {
                    score,
                    endpoints: vec![endpoint.to_string()],
                },
            );
        }
    }
}

/// Remove an endpoint from its group, the group if emptied, and the
/// key if no groups remain. With `notify`, fire and clear any
/// `on_server_removed` callbacks for the endpoint — but only if the
/// endpoint was actually present.
fn remove_server(index: &Index, hooks: &Hooks, key: &str, endpoint: &str, notify: bool) {
    let mut removed = false;
    if let Some(mut groups) = index.get_mut(key) {
        for group in groups.iter_mut() {
            let before = group.endpoints.len();
            group.endpoints.retain(|e| e != endpoint);
            removed |= group.endpoints.len() != before;
        }
        groups.retain(|g| !g.endpoints.is_empty());
    }
    index.remove_if(key, |_, groups| groups.is_empty());

    if removed && notify {
        if let Some((_, callbacks)) = hooks.remove(endpoint) {
            for callback in callbacks {
                callback();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_index() -> Index {
        Arc::new(DashMap::new())
    }

    #[test]
    fn locality_scores_by_octet_prefix() {
        let local: Ipv4Addr = "192.168.11.0".parse().unwrap();
        assert_eq!(locality_score(local, "192.168.11.0"), 4);
        assert_eq!(locality_score(local, "192.168.11.10"), 3);
        assert_eq!(locality_score(local, "192.168.10.0"), 2);
        assert_eq!(locality_score(local, "192.5.10.0"), 1);
        assert_eq!(locality_score(local, "10.0.11.0"), 0);
    }

    #[test]
    fn groups_stay_sorted_by_descending_score() {
        let index = new_index();
        let local: Ipv4Addr = "192.168.11.0".parse().unwrap();
        add_server(&index, "Echo/1/Test", "10.0.11.0:2000", local);
        add_server(&index, "Echo/1/Test", "192.168.11.0:2000", local);
        add_server(&index, "Echo/1/Test", "192.168.10.0:2000", local);

        let groups = index.get("Echo/1/Test").unwrap();
        let scores: Vec<u8> = groups.iter().map(|g| g.score).collect();
        assert_eq!(scores, vec![4, 2, 0]);
    }

    #[test]
    fn re_adding_an_endpoint_is_idempotent() {
        let index = new_index();
        let local = Ipv4Addr::LOCALHOST;
        add_server(&index, "Echo/1/Test", "127.0.0.1:2000", local);
        add_server(&index, "Echo/1/Test", "127.0.0.1:2000", local);

        let groups = index.get("Echo/1/Test").unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].endpoints, vec!["127.0.0.1:2000"]);
    }

    #[test]
    fn removing_the_last_endpoint_removes_the_key() {
        let index = new_index();
        let hooks: Hooks = Arc::new(DashMap::new());
        let local = Ipv4Addr::LOCALHOST;
        add_server(&index, "Echo/1/Test", "127.0.0.1:2000", local);

        remove_server(&index, &hooks, "Echo/1/Test", "127.0.0.1:2000", false);
        assert!(index.get("Echo/1/Test").is_none());
    }

    #[test]
    fn removal_hooks_fire_only_for_present_endpoints() {
        let index = new_index();
        let hooks: Hooks = Arc::new(DashMap::new());
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let local = Ipv4Addr::LOCALHOST;

        add_server(&index, "Echo/1/Test", "127.0.0.1:2000", local);
        {
            let fired = fired.clone();
            hooks.entry("127.0.0.1:2000".to_string()).or_default().push(
                Box::new(move || {
                    fired.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }),
            );
        }

        // Absent endpoint: no hook fires.
        remove_server(&index, &hooks, "Echo/1/Test", "127.0.0.1:9999", true);
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 0);

        // Present endpoint with notify: fires once, then cleared.
        remove_server(&index, &hooks, "Echo/1/Test", "127.0.0.1:2000", true);
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(hooks.get("127.0.0.1:2000").is_none());
    }

    #[test]
    fn instance_uuid_is_deterministic() {
        assert_eq!(
            instance_uuid("127.0.0.1", 2000, 77, "EchoService", "1"),
            "127.0.0.1:2000-77-EchoService-1"
        );
    }
}
