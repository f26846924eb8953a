//! Skynet server: bind, accept, dispatch, withdraw.
//!
//! A single acceptor task spawns one handler task per connection.
//! Handler failures become exception replies; a handler that returns
//! no reply closes its connection. Shutdown deregisters every service
//! before the acceptor stops so peers observe removal cleanly.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::Context;
use bson::Document;
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use skynet_core::error::RpcError;
use skynet_core::wire::{
    self, ClientHandshake, Request, RequestHeader, Response, ResponseHeader, ServiceHandshake,
    FORWARD_SUFFIX,
};
use skynet_registry::ServiceRegistry;

use crate::service::{exception_reply, validate_handler, ServiceHandler};

/// Port increments tried past `port_start` before bind gives up.
const MAX_PORT_PROBES: u16 = 999;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Address published into the registry and bound by the listener.
    pub host: Ipv4Addr,
    /// First port tried; "address in use" increments from here.
    pub port_start: u16,
    /// Bounds every framed read on accepted connections.
    pub read_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::LOCALHOST,
            port_start: 2000,
            read_timeout: Duration::from_secs(60),
        }
    }
}

pub struct RpcServer {
    registry: Arc<ServiceRegistry>,
    opts: ServerOptions,
    handlers: Arc<DashMap<String, Arc<dyn ServiceHandler>>>,
    bound: StdMutex<Option<SocketAddr>>,
    shutdown: broadcast::Sender<()>,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
}

impl RpcServer {
    pub fn new(registry: Arc<ServiceRegistry>, opts: ServerOptions) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(Self {
            registry,
            opts,
            handlers: Arc::new(DashMap::new()),
            bound: StdMutex::new(None),
            shutdown,
            accept_task: StdMutex::new(None),
        })
    }

    /// Validate and add a handler. Before `start`, registration into
    /// the registry is deferred to bind time; afterwards it happens
    /// immediately at the bound address.
    pub async fn register_service(&self, handler: Arc<dyn ServiceHandler>) -> anyhow::Result<()> {
        validate_handler(handler.as_ref())?;
        let name = handler.name().to_string();
        let bound = *self.bound.lock().unwrap();
        self.handlers.insert(name.clone(), handler.clone());

        if let Some(addr) = bound {
            self.registry
                .register(
                    handler.name(),
                    handler.version(),
                    handler.region(),
                    &addr.ip().to_string(),
                    addr.port(),
                )
                .await
                .with_context(|| format!("failed to register service {name}"))?;
        }
        Ok(())
    }

    /// Remove a handler and withdraw its registration.
    pub async fn deregister_service(&self, name: &str) -> anyhow::Result<()> {
        let Some((_, handler)) = self.handlers.remove(name) else {
            return Ok(());
        };
        let bound = *self.bound.lock().unwrap();
        if let Some(addr) = bound {
            self.registry
                .deregister(
                    handler.name(),
                    handler.version(),
                    handler.region(),
                    &addr.ip().to_string(),
                    addr.port(),
                )
                .await
                .with_context(|| format!("failed to deregister service {name}"))?;
        }
        Ok(())
    }

    /// Bind (incrementing the port past conflicts), publish every
    /// known service at the bound address, and spawn the acceptor.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<SocketAddr> {
        let mut port = self.opts.port_start;
        let listener = loop {
            match TcpListener::bind((self.opts.host, port)).await {
                Ok(listener) => break listener,
                Err(e)
                    if e.kind() == std::io::ErrorKind::AddrInUse
                        && port < self.opts.port_start.saturating_add(MAX_PORT_PROBES) =>
                {
                    port += 1;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to bind {}:{}", self.opts.host, port)
                    })
                }
            }
        };
        let addr = listener.local_addr().context("listener local_addr")?;
        *self.bound.lock().unwrap() = Some(addr);

        let handlers: Vec<Arc<dyn ServiceHandler>> =
            self.handlers.iter().map(|e| e.value().clone()).collect();
        for handler in handlers {
            self.registry
                .register(
                    handler.name(),
                    handler.version(),
                    handler.region(),
                    &addr.ip().to_string(),
                    addr.port(),
                )
                .await
                .with_context(|| format!("failed to register service {}", handler.name()))?;
        }

        let server = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(server.accept_loop(listener, shutdown));
        *self.accept_task.lock().unwrap() = Some(task);

        tracing::info!(%addr, services = self.handlers.len(), "skynet server listening");
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().unwrap()
    }

    /// Deregister every service, then stop the acceptor. In-flight
    /// connection handlers drain on their own tasks.
    pub async fn shutdown(&self) {
        let bound = *self.bound.lock().unwrap();
        if let Some(addr) = bound {
            let handlers: Vec<Arc<dyn ServiceHandler>> =
                self.handlers.iter().map(|e| e.value().clone()).collect();
            for handler in handlers {
                if let Err(e) = self
                    .registry
                    .deregister(
                        handler.name(),
                        handler.version(),
                        handler.region(),
                        &addr.ip().to_string(),
                        addr.port(),
                    )
                    .await
                {
                    tracing::warn!(service = %handler.name(), error = %e, "deregister failed during shutdown");
                }
            }
        }
        let _ = self.shutdown.send(());
        let task = self.accept_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("acceptor shutting down");
                    return;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(%peer, "connection accepted");
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer).await {
                                    tracing::debug!(%peer, error = %e, "connection terminated");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                        }
                    }
                }
            }
        }
    }

    /// One connection: handshake, then the request loop. Any protocol
    /// error is terminal for this connection only; the stream closes
    /// on every exit path when it drops.
    async fn handle_connection(
        self: Arc<Self>,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), RpcError> {
        let clientid = Uuid::new_v4().to_string();
        wire::write_message(
            &mut stream,
            &ServiceHandshake {
                registered: true,
                clientid,
            },
        )
        .await?;
        let _peer_handshake: ClientHandshake =
            wire::read_message(&mut stream, self.opts.read_timeout).await?;

        loop {
            let header: RequestHeader =
                match wire::read_message(&mut stream, self.opts.read_timeout).await {
                    Ok(header) => header,
                    // Clean close between requests.
                    Err(RpcError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        return Ok(())
                    }
                    Err(e) => return Err(e),
                };

            let Some(service_name) = header.servicemethod.strip_suffix(FORWARD_SUFFIX) else {
                return Err(RpcError::Protocol(format!(
                    "servicemethod {:?} does not end in {FORWARD_SUFFIX:?}",
                    header.servicemethod
                )));
            };

            let request: Request = wire::read_message(&mut stream, self.opts.read_timeout).await?;
            let params = Document::from_reader(&request.input.bytes[..])
                .map_err(|e| RpcError::Protocol(format!("request params decode failed: {e}")))?;

            let handler = self.handlers.get(service_name).map(|h| h.value().clone());
            let (reply, header_error) = match handler {
                Some(handler) => {
                    match handler.dispatch(&request.method, params).await {
                        Ok(Some(reply)) => (Some(reply), String::new()),
                        Ok(None) => {
                            tracing::debug!(
                                %peer,
                                service = service_name,
                                method = %request.method,
                                "null reply; closing connection"
                            );
                            return Ok(());
                        }
                        Err(err) => (Some(exception_reply(&err)), String::new()),
                    }
                }
                None => (None, format!("unknown service {service_name:?}")),
            };

            let out = match &reply {
                Some(doc) => bson::to_vec(doc)
                    .map_err(|e| RpcError::Protocol(format!("reply encode failed: {e}")))?,
                None => Vec::new(),
            };
            wire::write_message(
                &mut stream,
                &ResponseHeader {
                    servicemethod: header.servicemethod.clone(),
                    seq: header.seq,
                    error: header_error,
                },
            )
            .await?;
            wire::write_message(
                &mut stream,
                &Response {
                    out: wire::binary(out),
                    error: String::new(),
                },
            )
            .await?;
        }
    }
}
