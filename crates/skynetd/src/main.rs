//! skynetd — runs a pre-configured Skynet server.
//!
//! `SKYNET_CONFIG` names the YAML config file, `SKYNET_ENV` the
//! profile within it. The daemon builds the store adapter named by
//! `registry.backend`, publishes its services, and blocks until
//! interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bson::{doc, Document};

use skynet_core::SkynetConfig;
use skynet_registry::{MemoryStore, ServiceRegistry, StoreAdapter};
use skynet_rpc::{RpcServer, ServerOptions, ServiceError, ServiceHandler};

/// The built-in demonstration service: echoes whatever it is sent.
struct EchoService {
    region: String,
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
            "ping" => Ok(Some(doc! { "pong": true })),
            other => Err(ServiceError::new(
                "NoMethodError",
                format!("undefined method {other:?} for EchoService"),
            )),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = SkynetConfig::load().context("failed to load configuration")?;
    config.warn_unrecognized();

    let adapter: Arc<dyn StoreAdapter> = match config.registry.backend.as_str() {
        "memory" => Arc::new(MemoryStore::new()),
        other => bail!(
            "registry backend {other:?} has no linked transport in this build; \
             set registry.backend to \"memory\""
        ),
    };

    let local_ip = config.resolve_local_ip();
    tracing::info!(
        %local_ip,
        region = %config.region,
        backend = %config.registry.backend,
        "skynetd starting"
    );

    // Handlers are linked statically; the directory the source system
    // scanned for service files is accepted but not read.
    if !config.services_path.is_empty() {
        tracing::info!(services_path = %config.services_path, "services are statically linked");
    }

    let registry = ServiceRegistry::open(adapter, "/instances", local_ip)
        .await
        .context("failed to open service registry")?;

    let server = RpcServer::new(
        registry.clone(),
        ServerOptions {
            host: local_ip,
            port_start: config.server_port,
            read_timeout: Duration::from_secs_f64(config.rpc.read_timeout),
        },
    );
    server
        .register_service(Arc::new(EchoService {
            region: config.region.clone(),
        }))
        .await?;

    let addr = server.start().await?;
    tracing::info!(%addr, "skynetd serving");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("interrupt received; shutting down");

    server.shutdown().await;
    registry.close().await;
    Ok(())
}
