//! One Skynet connection: dial, handshake, seq-ordered calls.

use std::time::Duration;

use bson::Document;
use tokio::net::TcpStream;

use skynet_core::error::RpcError;
use skynet_core::wire::{
    self, ClientHandshake, Request, RequestHeader, RequestInfo, Response, ResponseHeader,
    ServiceHandshake, FORWARD_SUFFIX,
};

#[derive(Debug, Clone)]
pub struct DialOptions {
    /// Bounds each TCP connect attempt.
    pub connect_timeout: Duration,
    /// Connect retries after the first attempt.
    pub retry_count: u32,
    /// Sleep between connect attempts.
    pub retry_interval: Duration,
    /// Bounds every framed read on the established connection.
    pub read_timeout: Duration,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            retry_count: 2,
            retry_interval: Duration::from_millis(500),
            read_timeout: Duration::from_secs(60),
        }
    }
}

/// Outcome of a dial-and-handshake.
pub enum Dial {
    Ready(Connection),
    /// The server answered but reports itself unregistered; the
    /// caller must re-resolve the endpoint from the registry.
    Unregistered,
}

pub struct Connection {
    stream: TcpStream,
    endpoint: String,
    /// Session identity assigned by the server during handshake.
    clientid: String,
    /// Strictly incremented on every successful reply.
    seq: i64,
    read_timeout: Duration,
}

impl Connection {
    /// Dial with retries, then run the Skynet handshake: receive the
    /// `ServiceHandshake`, reply with a `ClientHandshake` echoing the
    /// assigned clientid.
    pub async fn open(endpoint: &str, opts: &DialOptions) -> Result<Dial, RpcError> {
        let attempts = opts.retry_count + 1;
        let mut last_err: Option<std::io::Error> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(opts.retry_interval).await;
            }
            match tokio::time::timeout(opts.connect_timeout, TcpStream::connect(endpoint)).await {
                Ok(Ok(stream)) => {
                    return Self::handshake(stream, endpoint, opts.read_timeout).await;
                }
                Ok(Err(e)) => {
                    tracing::debug!(endpoint, attempt, error = %e, "dial failed");
                    last_err = Some(e);
                }
                Err(_) => {
                    last_err = Some(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timed out",
                    ));
                }
            }
        }

        Err(RpcError::ConnectionFailure {
            endpoint: endpoint.to_string(),
            attempts,
            source: last_err
                .unwrap_or_else(|| std::io::Error::other("dial failed with no attempts")),
        })
    }

    async fn handshake(
        mut stream: TcpStream,
        endpoint: &str,
        read_timeout: Duration,
    ) -> Result<Dial, RpcError> {
        let hello: ServiceHandshake = wire::read_message(&mut stream, read_timeout).await?;
        if !hello.registered {
            tracing::debug!(endpoint, "endpoint reports unregistered");
            return Ok(Dial::Unregistered);
        }
        wire::write_message(
            &mut stream,
            &ClientHandshake {
                clientid: hello.clientid.clone(),
            },
        )
        .await?;

        Ok(Dial::Ready(Connection {
            stream,
            endpoint: endpoint.to_string(),
            clientid: hello.clientid,
            seq: 0,
            read_timeout,
        }))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn clientid(&self) -> &str {
        &self.clientid
    }

    pub fn seq(&self) -> i64 {
        self.seq
    }

    /// Write the header and request frames for one call. A transport
    /// error here means the whole send can be retried on a fresh
    /// connection.
    pub async fn send_request(
        &mut self,
        service: &str,
        method: &str,
        params: &Document,
        request_id: &str,
        retry_count: i32,
    ) -> Result<(), RpcError> {
        let header = RequestHeader {
            servicemethod: format!("{service}{FORWARD_SUFFIX}"),
            seq: self.seq,
        };
        let input = bson::to_vec(params)
            .map_err(|e| RpcError::Protocol(format!("params encode failed: {e}")))?;
        let request = Request {
            clientid: self.clientid.clone(),
            input: wire::binary(input),
            method: method.to_string(),
            requestinfo: RequestInfo {
                requestid: request_id.to_string(),
                retrycount: retry_count,
                originaddress: String::new(),
            },
        };

        wire::write_message(&mut self.stream, &header).await?;
        wire::write_message(&mut self.stream, &request).await?;
        Ok(())
    }

    /// Read the response header and body for the call in flight,
    /// verify sequence ordering, and decode the reply document.
    pub async fn read_response(&mut self) -> Result<Document, RpcError> {
        let header: ResponseHeader =
            wire::read_message(&mut self.stream, self.read_timeout).await?;
        if header.seq != self.seq {
            return Err(RpcError::Protocol(format!(
                "response seq {} does not match request seq {}",
                header.seq, self.seq
            )));
        }
        let response: Response = wire::read_message(&mut self.stream, self.read_timeout).await?;

        if !header.error.is_empty() {
            return Err(RpcError::Skynet(header.error));
        }
        if !response.error.is_empty() {
            return Err(RpcError::Service(response.error));
        }

        self.seq += 1;
        Document::from_reader(&response.out.bytes[..])
            .map_err(|e| RpcError::Protocol(format!("reply decode failed: {e}")))
    }

    /// One full request/response exchange.
    pub async fn call(
        &mut self,
        service: &str,
        method: &str,
        params: &Document,
        request_id: &str,
        retry_count: i32,
    ) -> Result<Document, RpcError> {
        self.send_request(service, method, params, request_id, retry_count)
            .await?;
        self.read_response().await
    }
}
