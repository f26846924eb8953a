//! Shared loopback harness: an in-memory store, one registry, and a
//! small echo service with enough methods to exercise the failure
//! paths.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bson::{doc, Document};

use skynet_registry::{MemoryStore, ServiceRegistry};
use skynet_rpc::{ConnectionPool, PoolOptions, ServiceError, ServiceHandler};

pub struct Fabric {
    pub store: Arc<MemoryStore>,
    pub registry: Arc<ServiceRegistry>,
    pub pool: Arc<ConnectionPool>,
}

/// A registry and pool over a fresh in-memory store. Server and
/// client share the registry, the way two processes share the real
/// coordination store.
pub async fn fabric() -> Fabric {
    fabric_with(PoolOptions::default()).await
}

pub async fn fabric_with(pool_opts: PoolOptions) -> Fabric {
    let store = Arc::new(MemoryStore::new());
    let registry = ServiceRegistry::open(store.clone(), "/instances", Ipv4Addr::LOCALHOST)
        .await
        .expect("registry open");
    let pool = ConnectionPool::new(pool_opts);
    Fabric {
        store,
        registry,
        pool,
    }
}

/// Echo service used across the scenarios.
///
/// Methods: `echo` returns its params; `whoami` returns this
/// instance's tag; `sleep` sleeps `seconds` then replies; `fail`
/// raises; `hangup` returns a null reply.
pub struct EchoService {
    pub region: String,
    pub tag: String,
}

impl EchoService {
    pub fn in_region(region: &str) -> Arc<Self> {
        Arc::new(Self {
            region: region.to_string(),
            tag: "echo".to_string(),
        })
    }

    pub fn tagged(region: &str, tag: &str) -> Arc<Self> {
        Arc::new(Self {
            region: region.to_string(),
            tag: tag.to_string(),
        })
    }
}

#[async_trait]
impl ServiceHandler for EchoService {
    fn name(&self) -> &str {
        "EchoService"
    }

    fn version(&self) -> &str {
        "1"
    }

    fn region(&self) -> &str {
        &self.region
    }

    async fn dispatch(
        &self,
        method: &str,
        params: Document,
    ) -> Result<Option<Document>, ServiceError> {
        match method {
            "echo" => Ok(Some(params)),
            "whoami" => Ok(Some(doc! { "tag": &self.tag })),
            "sleep" => {
                let seconds = params.get_f64("seconds").unwrap_or(0.0);
                tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
                Ok(Some(doc! { "slept": seconds }))
            }
            "fail" => Err(ServiceError::new("RuntimeError", "Exception message")),
            "hangup" => Ok(None),
            other => Err(ServiceError::new(
                "NoMethodError",
                format!("undefined method {other:?} for EchoService"),
            )),
        }
    }
}
