//! skynet-core — shared types, wire format, and payload codec.
//! All other Skynet crates depend on this one.

pub mod config;
pub mod error;
pub mod payload;
pub mod wire;

pub use config::SkynetConfig;
pub use error::RpcError;
pub use payload::RegistryValue;
