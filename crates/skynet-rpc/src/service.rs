//! The service contract between the server and user handlers.

use async_trait::async_trait;
use bson::{doc, Document};

use skynet_core::error::RpcError;

/// A handler failure, returned to the caller as a normal reply whose
/// payload carries an `exception` field.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{class}: {message}")]
pub struct ServiceError {
    pub class: String,
    pub message: String,
    pub backtrace: Vec<String>,
}

impl ServiceError {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            backtrace: Vec::new(),
        }
    }
}

/// A named, versioned, regioned method set reachable by RPC.
///
/// Handlers resolve their own methods in `dispatch`; an unknown
/// method is a `ServiceError` like any other handler failure.
/// Returning `Ok(None)` closes the caller's connection.
#[async_trait]
pub trait ServiceHandler: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    fn region(&self) -> &str;

    async fn dispatch(
        &self,
        method: &str,
        params: Document,
    ) -> Result<Option<Document>, ServiceError>;
}

/// Validate the contract before registration: a non-empty name free
/// of registry-key separators, an integer version, a non-empty
/// region.
pub fn validate_handler(handler: &dyn ServiceHandler) -> Result<(), RpcError> {
    let name = handler.name();
    if name.is_empty() {
        return Err(RpcError::InvalidService("service name is empty".into()));
    }
    if name.contains('/') {
        return Err(RpcError::InvalidService(format!(
            "service name {name:?} contains '/'"
        )));
    }
    if handler.version().parse::<i64>().is_err() {
        return Err(RpcError::InvalidService(format!(
            "service {name:?} version {:?} is not an integer",
            handler.version()
        )));
    }
    if handler.region().is_empty() {
        return Err(RpcError::InvalidService(format!(
            "service {name:?} region is empty"
        )));
    }
    Ok(())
}

/// The reply document sent when a handler fails.
pub fn exception_reply(err: &ServiceError) -> Document {
    doc! {
        "exception": {
            "class": &err.class,
            "message": &err.message,
            "backtrace": err.backtrace.clone(),
        }
    }
}
