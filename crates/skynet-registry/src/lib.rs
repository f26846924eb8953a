//! skynet-registry — the discovery half of the Skynet fabric.
//!
//! A `TreeCache` mirrors a subtree of the coordination store in
//! memory, re-arming one-shot watches after every event and fanning
//! out subscriber callbacks. The `ServiceRegistry` sits on top,
//! translating instance-record events into a locality-ranked endpoint
//! lookup. The store itself is reached through the `StoreAdapter`
//! trait; `MemoryStore` is the in-process implementation used for
//! loopback development and tests.

pub mod cache;
pub mod memory;
pub mod registry;
pub mod store;

pub use cache::TreeCache;
pub use memory::MemoryStore;
pub use registry::{instance_uuid, locality_score, ScoreGroup, ServiceRegistry};
pub use store::{EventKind, Stat, StoreAdapter, StoreError, StoreEvent};
