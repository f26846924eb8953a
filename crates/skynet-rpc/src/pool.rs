//! Per-endpoint connection pool.
//!
//! Bounded, LIFO-reusing, blocking borrow with a warn threshold and a
//! hard timeout. Idle connections past the idle timeout are closed at
//! borrow time and by a periodic sweep. A borrowed connection is
//! either given back (reusable) or discarded (closed); the slot it
//! held frees either way, so a failed entry is replaced by a fresh
//! dial on the next borrow.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};

use skynet_core::error::RpcError;

use crate::connection::{Connection, Dial, DialOptions};

#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Connections per endpoint.
    pub size: usize,
    /// Hard bound on a borrow wait.
    pub borrow_timeout: Duration,
    /// Waits longer than this are logged.
    pub warn_timeout: Duration,
    /// Idle connections older than this are closed.
    pub idle_timeout: Duration,
    pub dial: DialOptions,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: 5,
            borrow_timeout: Duration::from_secs(30),
            warn_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            dial: DialOptions::default(),
        }
    }
}

struct IdleEntry {
    conn: Connection,
    since: Instant,
}

struct EndpointPool {
    idle: StdMutex<Vec<IdleEntry>>,
    permits: Arc<Semaphore>,
}

/// Outcome of a borrow.
pub enum Borrowed {
    Ready(PooledConnection),
    /// The endpoint handshook but reports itself unregistered.
    Unregistered,
}

pub struct ConnectionPool {
    endpoints: DashMap<String, Arc<EndpointPool>>,
    opts: PoolOptions,
    shutdown: broadcast::Sender<()>,
}

impl ConnectionPool {
    pub fn new(opts: PoolOptions) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(1);
        let pool = Arc::new(Self {
            endpoints: DashMap::new(),
            opts,
            shutdown,
        });
        pool.spawn_sweeper();
        pool
    }

    /// Borrow a connection for `endpoint`, reusing the most recently
    /// returned live one or dialing fresh. Blocks while the pool is
    /// at capacity, warning past `warn_timeout` and failing past
    /// `borrow_timeout`.
    pub async fn borrow(&self, endpoint: &str) -> Result<Borrowed, RpcError> {
        let slot = self
            .endpoints
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                Arc::new(EndpointPool {
                    idle: StdMutex::new(Vec::new()),
                    permits: Arc::new(Semaphore::new(self.opts.size)),
                })
            })
            .clone();

        let started = Instant::now();
        let permit = match tokio::time::timeout(
            self.opts.warn_timeout,
            slot.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(RpcError::PoolTimeout {
                    endpoint: endpoint.to_string(),
                    waited: started.elapsed(),
                })
            }
            Err(_) => {
                tracing::warn!(
                    endpoint,
                    waited_secs = self.opts.warn_timeout.as_secs_f64(),
                    "still waiting for a pooled connection"
                );
                let remaining = self
                    .opts
                    .borrow_timeout
                    .saturating_sub(self.opts.warn_timeout);
                match tokio::time::timeout(remaining, slot.permits.clone().acquire_owned()).await {
                    Ok(Ok(permit)) => permit,
                    _ => {
                        return Err(RpcError::PoolTimeout {
                            endpoint: endpoint.to_string(),
                            waited: started.elapsed(),
                        })
                    }
                }
            }
        };

        // LIFO: newest idle connection first; stale ones close here.
        let reusable = {
            let mut idle = slot.idle.lock().unwrap();
            let mut found = None;
            while let Some(entry) = idle.pop() {
                if entry.since.elapsed() < self.opts.idle_timeout {
                    found = Some(entry.conn);
                    break;
                }
                tracing::debug!(endpoint, "closing idle-timed-out pooled connection");
            }
            found
        };
        if let Some(conn) = reusable {
            return Ok(Borrowed::Ready(PooledConnection {
                conn: Some(conn),
                slot,
                _permit: permit,
            }));
        }

        match Connection::open(endpoint, &self.opts.dial).await? {
            Dial::Ready(conn) => Ok(Borrowed::Ready(PooledConnection {
                conn: Some(conn),
                slot,
                _permit: permit,
            })),
            Dial::Unregistered => Ok(Borrowed::Unregistered),
        }
    }

    /// Stop the sweeper and drop every idle connection.
    pub fn close(&self) {
        let _ = self.shutdown.send(());
        for entry in self.endpoints.iter() {
            entry.value().idle.lock().unwrap().clear();
        }
    }

    fn spawn_sweeper(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = interval.tick() => {
                        for entry in pool.endpoints.iter() {
                            entry
                                .value()
                                .idle
                                .lock()
                                .unwrap()
                                .retain(|e| e.since.elapsed() < pool.opts.idle_timeout);
                        }
                    }
                }
            }
        });
    }
}

/// A connection checked out of the pool. Dropping it without
/// `give_back` closes the connection; the slot frees either way.
pub struct PooledConnection {
    conn: Option<Connection>,
    slot: Arc<EndpointPool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Return a healthy connection for LIFO reuse.
    pub fn give_back(mut self) {
        if let Some(conn) = self.conn.take() {
            self.slot.idle.lock().unwrap().push(IdleEntry {
                conn,
                since: Instant::now(),
            });
        }
    }

    /// Close a connection that saw an error. The next borrow dials
    /// fresh.
    pub fn discard(mut self) {
        self.conn.take();
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only None after give_back/discard, which consume self.
        self.conn.as_ref().expect("pooled connection taken")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("pooled connection taken")
    }
}
