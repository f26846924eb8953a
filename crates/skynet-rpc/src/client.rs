//! Client-side service view: resolve, rank, borrow, invoke, fail over.

use std::sync::Arc;

use bson::Document;
use rand::Rng;
use uuid::Uuid;

use skynet_core::error::RpcError;
use skynet_registry::ServiceRegistry;

use crate::pool::{Borrowed, ConnectionPool};

/// Endpoint re-selections after a refused dial before giving up.
const FAILOVER_LIMIT: usize = 3;

/// A client bound to one `(name, version, region)` tuple. Endpoint
/// selection happens per call: highest-scoring group first, uniform
/// random within the group.
pub struct ServiceClient {
    registry: Arc<ServiceRegistry>,
    pool: Arc<ConnectionPool>,
    name: String,
    version: String,
    region: String,
}

impl ServiceClient {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        pool: Arc<ConnectionPool>,
        name: impl Into<String>,
        version: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            pool,
            name: name.into(),
            version: version.into(),
            region: region.into(),
        }
    }

    /// Call a method. Any method name forwards here; there is no
    /// per-method surface to pre-declare.
    pub async fn call(&self, method: &str, params: Document) -> Result<Document, RpcError> {
        self.call_with(method, params, false).await
    }

    /// Like `call`, but a read failure after the request was sent is
    /// retried on a fresh connection. Only for calls the caller
    /// knows the server can safely repeat.
    pub async fn call_idempotent(
        &self,
        method: &str,
        params: Document,
    ) -> Result<Document, RpcError> {
        self.call_with(method, params, true).await
    }

    async fn call_with(
        &self,
        method: &str,
        params: Document,
        idempotent: bool,
    ) -> Result<Document, RpcError> {
        let request_id = Uuid::new_v4().to_string();
        let mut failovers = 0;

        loop {
            let endpoint = self.pick_endpoint()?;
            match self
                .invoke(&endpoint, method, &params, &request_id, idempotent)
                .await
            {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_connection_refused() && failovers < FAILOVER_LIMIT => {
                    failovers += 1;
                    tracing::debug!(
                        endpoint,
                        failovers,
                        "endpoint refused; retrying with a newly selected endpoint"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One attempt against a fixed endpoint. The whole send is
    /// retried once on a fresh connection if the write phase fails;
    /// the read phase is retried only for idempotent calls.
    async fn invoke(
        &self,
        endpoint: &str,
        method: &str,
        params: &Document,
        request_id: &str,
        idempotent: bool,
    ) -> Result<Document, RpcError> {
        let mut attempt: i32 = 0;
        loop {
            let mut conn = match self.pool.borrow(endpoint).await? {
                Borrowed::Ready(conn) => conn,
                Borrowed::Unregistered => return Err(unregistered(endpoint)),
            };

            match conn
                .send_request(&self.name, method, params, request_id, attempt)
                .await
            {
                Ok(()) => match conn.read_response().await {
                    Ok(reply) => {
                        conn.give_back();
                        return Ok(reply);
                    }
                    Err(e) => {
                        conn.discard();
                        if idempotent && e.is_transport() && attempt == 0 {
                            tracing::debug!(
                                endpoint,
                                error = %e,
                                "idempotent call; retrying read phase on a fresh connection"
                            );
                            attempt += 1;
                            continue;
                        }
                        return Err(e);
                    }
                },
                Err(e) if e.is_transport() && attempt == 0 => {
                    conn.discard();
                    tracing::debug!(
                        endpoint,
                        error = %e,
                        "send failed; retrying whole send on a fresh connection"
                    );
                    attempt += 1;
                }
                Err(e) => {
                    conn.discard();
                    return Err(e);
                }
            }
        }
    }

    fn pick_endpoint(&self) -> Result<String, RpcError> {
        let groups = self
            .registry
            .score_groups_for(&self.name, &self.version, &self.region)?;
        let Some(top) = groups.first() else {
            return Err(RpcError::ServiceUnavailable {
                name: self.name.clone(),
                version: self.version.clone(),
                region: self.region.clone(),
            });
        };
        let pick = rand::thread_rng().gen_range(0..top.endpoints.len());
        Ok(top.endpoints[pick].clone())
    }
}

/// An unregistered endpoint behaves like a refused dial: the client
/// re-resolves from the registry and moves on.
fn unregistered(endpoint: &str) -> RpcError {
    RpcError::ConnectionFailure {
        endpoint: endpoint.to_string(),
        attempts: 1,
        source: std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "endpoint no longer registered",
        ),
    }
}
