//! Skynet wire format — framed BSON documents over TCP.
//!
//! Every message in either direction is one BSON document. BSON
//! already begins with a 4-byte little-endian length that includes
//! itself, and Skynet uses that length as the frame length: a
//! receiver reads 4 bytes, then exactly `len - 4` more, then parses.
//! A read that returns fewer bytes than requested is an error.

use std::time::Duration;

use bson::Document;
use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RpcError;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Every Skynet servicemethod ends in this suffix; the prefix is the
/// skynet service name.
pub const FORWARD_SUFFIX: &str = ".Forward";

/// Upper bound on a single frame. A length prefix beyond this is
/// treated as a framing error rather than an allocation request.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// The smallest well-formed BSON document: length prefix plus the
/// terminating NUL.
const MIN_FRAME_BYTES: usize = 5;

// ── Messages ──────────────────────────────────────────────────────────────────

/// First frame on a connection, server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHandshake {
    /// False means the server no longer considers itself registered;
    /// the client must close and re-resolve the endpoint.
    pub registered: bool,
    pub clientid: String,
}

/// Client's reply to the handshake. Servers read and discard it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHandshake {
    pub clientid: String,
}

/// Precedes every request. `servicemethod` must end in ".Forward".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHeader {
    pub servicemethod: String,
    pub seq: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestInfo {
    pub requestid: String,
    pub retrycount: i32,
    pub originaddress: String,
}

/// The request body. `in` carries the BSON-encoded call parameters
/// as a binary blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub clientid: String,
    #[serde(rename = "in")]
    pub input: bson::Binary,
    pub method: String,
    pub requestinfo: RequestInfo,
}

/// Precedes every reply. An empty `error` means success; a non-empty
/// one surfaces as a skynet-level exception on the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub servicemethod: String,
    pub seq: i64,
    pub error: String,
}

/// The reply body. `out` carries the BSON-encoded reply document; a
/// non-empty `error` surfaces as a service-level exception.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub out: bson::Binary,
    pub error: String,
}

/// Wrap raw bytes as the generic BSON binary the wire schema uses.
pub fn binary(bytes: Vec<u8>) -> bson::Binary {
    bson::Binary {
        subtype: bson::spec::BinarySubtype::Generic,
        bytes,
    }
}

// ── Framing ───────────────────────────────────────────────────────────────────

/// Write one framed document. The document's own BSON encoding is
/// the frame; no extra prefix is added.
pub async fn write_document<W>(writer: &mut W, doc: &Document) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    doc.to_writer(&mut buf)
        .map_err(|e| RpcError::Protocol(format!("bson encode failed: {e}")))?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize a message struct and write it as one frame.
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let buf = bson::to_vec(msg)
        .map_err(|e| RpcError::Protocol(format!("bson encode failed: {e}")))?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed document, bounding the whole read by `timeout`.
pub async fn read_document<R>(reader: &mut R, timeout: Duration) -> Result<Document, RpcError>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(timeout, read_document_inner(reader)).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::ReadTimeout(timeout)),
    }
}

/// Read one framed document and deserialize it into a message struct.
pub async fn read_message<R, T>(reader: &mut R, timeout: Duration) -> Result<T, RpcError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let doc = read_document(reader, timeout).await?;
    bson::from_document(doc).map_err(|e| RpcError::Protocol(format!("bson decode failed: {e}")))
}

async fn read_document_inner<R>(reader: &mut R) -> Result<Document, RpcError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;

    let len = u32::from_le_bytes(len_buf) as usize;
    if !(MIN_FRAME_BYTES..=MAX_FRAME_BYTES).contains(&len) {
        return Err(RpcError::Protocol(format!("invalid frame length {len}")));
    }

    let mut buf = BytesMut::zeroed(len);
    buf[..4].copy_from_slice(&len_buf);
    reader.read_exact(&mut buf[4..]).await?;

    Document::from_reader(&buf[..])
        .map_err(|e| RpcError::Protocol(format!("bson parse failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn frame_round_trip_is_byte_identical() {
        let original = doc! {
            "string": "value",
            "int": 42i64,
            "nested": { "flag": true },
            "list": [1i32, 2i32, 3i32],
        };

        let mut wire = Vec::new();
        write_document(&mut wire, &original).await.unwrap();

        let mut reencoded = Vec::new();
        let read = read_document(&mut &wire[..], TIMEOUT).await.unwrap();
        read.to_writer(&mut reencoded).unwrap();

        assert_eq!(read, original);
        assert_eq!(reencoded, wire);
    }

    #[tokio::test]
    async fn multiple_frames_read_in_order() {
        let mut wire = Vec::new();
        write_document(&mut wire, &doc! { "n": 1i32 }).await.unwrap();
        write_document(&mut wire, &doc! { "n": 2i32 }).await.unwrap();

        let mut reader = &wire[..];
        let first = read_document(&mut reader, TIMEOUT).await.unwrap();
        let second = read_document(&mut reader, TIMEOUT).await.unwrap();
        assert_eq!(first.get_i32("n").unwrap(), 1);
        assert_eq!(second.get_i32("n").unwrap(), 2);
    }

    #[tokio::test]
    async fn short_read_is_an_error() {
        let mut wire = Vec::new();
        write_document(&mut wire, &doc! { "hello": "world" })
            .await
            .unwrap();
        wire.truncate(wire.len() - 3);

        let err = read_document(&mut &wire[..], TIMEOUT).await.unwrap_err();
        assert!(matches!(err, RpcError::Io(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn absurd_length_prefix_is_a_protocol_error() {
        let wire = u32::MAX.to_le_bytes().to_vec();
        let err = read_document(&mut &wire[..], TIMEOUT).await.unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn handshake_round_trip() {
        let hs = ServiceHandshake {
            registered: true,
            clientid: "client-1".into(),
        };

        let mut wire = Vec::new();
        write_message(&mut wire, &hs).await.unwrap();
        let read: ServiceHandshake = read_message(&mut &wire[..], TIMEOUT).await.unwrap();
        assert!(read.registered);
        assert_eq!(read.clientid, "client-1");
    }

    #[tokio::test]
    async fn request_input_field_is_named_in_on_the_wire() {
        let params = bson::to_vec(&doc! { "hello": "world" }).unwrap();
        let req = Request {
            clientid: "c".into(),
            input: binary(params.clone()),
            method: "echo".into(),
            requestinfo: RequestInfo::default(),
        };

        let mut wire = Vec::new();
        write_message(&mut wire, &req).await.unwrap();
        let doc = read_document(&mut &wire[..], TIMEOUT).await.unwrap();
        let blob = doc.get_binary_generic("in").expect("field named `in`");
        assert_eq!(blob, &params);
    }

    #[tokio::test]
    async fn slow_reader_times_out() {
        // A duplex with no writer never produces the length prefix.
        let (mut rx, _tx) = tokio::io::duplex(64);
        let err = read_document(&mut rx, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::ReadTimeout(_)), "got: {err:?}");
    }
}
