//! skynet-rpc — the calling half of the Skynet fabric.
//!
//! Connections speak the framed-BSON Skynet protocol and are pooled
//! per endpoint. A `ServiceClient` resolves endpoints through the
//! registry, prefers the nearest score group, and fails over on
//! refused dials. The `RpcServer` accepts connections, dispatches
//! requests to `ServiceHandler`s, and publishes itself into the
//! registry for the lifetime of the listener.

pub mod client;
pub mod connection;
pub mod pool;
pub mod server;
pub mod service;

pub use client::ServiceClient;
pub use connection::{Connection, Dial, DialOptions};
pub use pool::{Borrowed, ConnectionPool, PoolOptions, PooledConnection};
pub use server::{RpcServer, ServerOptions};
pub use service::{exception_reply, ServiceError, ServiceHandler};
