//! Wire-level behavior checked with raw connections and scripted
//! peers.

mod common;

use std::time::Duration;

use bson::doc;
use tokio::net::TcpListener;

use skynet_core::wire::{self, ClientHandshake, RequestHeader, ServiceHandshake};
use skynet_rpc::{Connection, Dial, DialOptions, RpcServer, ServerOptions};

use common::{fabric, EchoService};

const READ_TIMEOUT: Duration = Duration::from_secs(2);

async fn started_echo_server(f: &common::Fabric) -> (std::sync::Arc<RpcServer>, String) {
    let server = RpcServer::new(
        f.registry.clone(),
        ServerOptions {
            port_start: 2000,
            ..ServerOptions::default()
        },
    );
    server
        .register_service(EchoService::in_region("Test"))
        .await
        .unwrap();
    let addr = server.start().await.unwrap();
    (server, addr.to_string())
}

#[tokio::test]
async fn seq_increments_by_one_per_successful_call() {
    let f = fabric().await;
    let (server, endpoint) = started_echo_server(&f).await;

    let mut conn = match Connection::open(&endpoint, &DialOptions::default()).await.unwrap() {
        Dial::Ready(conn) => conn,
        Dial::Unregistered => panic!("server should be registered"),
    };
    assert_eq!(conn.seq(), 0);

    for n in 0..3i64 {
        let reply = conn
            .call("EchoService", "echo", &doc! { "n": n }, "req", 0)
            .await
            .unwrap();
        assert_eq!(reply.get_i64("n").unwrap(), n);
        assert_eq!(conn.seq(), n + 1);
    }

    server.shutdown().await;
}

#[tokio::test]
async fn unregistered_handshake_is_reported_to_the_caller() {
    // A scripted peer that answers the handshake with registered =
    // false, the signal to re-resolve the endpoint.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        wire::write_message(
            &mut stream,
            &ServiceHandshake {
                registered: false,
                clientid: "stale".to_string(),
            },
        )
        .await
        .unwrap();
    });

    let dial = Connection::open(&endpoint, &DialOptions::default())
        .await
        .unwrap();
    assert!(matches!(dial, Dial::Unregistered));
}

#[tokio::test]
async fn refused_dial_exhausts_retries_into_connection_failure() {
    // Bind-then-drop to find a port nothing listens on.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let opts = DialOptions {
        retry_count: 1,
        retry_interval: Duration::from_millis(10),
        ..DialOptions::default()
    };
    let err = Connection::open(&format!("127.0.0.1:{port}"), &opts)
        .await
        .err()
        .expect("dial should fail");
    assert!(err.is_connection_refused(), "got: {err:?}");
    assert!(err.to_string().contains("2 attempts"), "got: {err}");
}

#[tokio::test]
async fn servicemethod_without_forward_suffix_is_terminal() {
    let f = fabric().await;
    let (server, endpoint) = started_echo_server(&f).await;

    let mut stream = tokio::net::TcpStream::connect(&endpoint).await.unwrap();
    let hello: ServiceHandshake = wire::read_message(&mut stream, READ_TIMEOUT).await.unwrap();
    assert!(hello.registered);
    wire::write_message(
        &mut stream,
        &ClientHandshake {
            clientid: hello.clientid,
        },
    )
    .await
    .unwrap();

    wire::write_message(
        &mut stream,
        &RequestHeader {
            servicemethod: "EchoService.Bogus".to_string(),
            seq: 0,
        },
    )
    .await
    .unwrap();

    // The server drops the connection without replying.
    let result = wire::read_document(&mut stream, READ_TIMEOUT).await;
    assert!(result.is_err(), "expected connection teardown");

    server.shutdown().await;
}

#[tokio::test]
async fn null_reply_closes_the_connection() {
    let f = fabric().await;
    let (server, endpoint) = started_echo_server(&f).await;

    let mut conn = match Connection::open(&endpoint, &DialOptions::default()).await.unwrap() {
        Dial::Ready(conn) => conn,
        Dial::Unregistered => panic!("server should be registered"),
    };

    conn.send_request("EchoService", "hangup", &doc! {}, "req", 0)
        .await
        .unwrap();
    let result = conn.read_response().await;
    assert!(result.is_err(), "hangup must close without a reply");

    server.shutdown().await;
}

#[tokio::test]
async fn unknown_service_surfaces_as_a_skynet_error() {
    let f = fabric().await;
    let (server, endpoint) = started_echo_server(&f).await;

    let mut conn = match Connection::open(&endpoint, &DialOptions::default()).await.unwrap() {
        Dial::Ready(conn) => conn,
        Dial::Unregistered => panic!("server should be registered"),
    };

    let err = conn
        .call("NoSuchService", "echo", &doc! {}, "req", 0)
        .await
        .unwrap_err();
    match err {
        skynet_core::error::RpcError::Skynet(message) => {
            assert!(message.contains("NoSuchService"), "message was: {message}");
        }
        other => panic!("expected a skynet-level error, got: {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn mismatched_response_seq_is_a_protocol_error() {
    // A scripted peer that replies with the wrong sequence number.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        wire::write_message(
            &mut stream,
            &ServiceHandshake {
                registered: true,
                clientid: "c".to_string(),
            },
        )
        .await
        .unwrap();
        let _: ClientHandshake = wire::read_message(&mut stream, READ_TIMEOUT).await.unwrap();

        let header: RequestHeader = wire::read_message(&mut stream, READ_TIMEOUT).await.unwrap();
        let _ = wire::read_document(&mut stream, READ_TIMEOUT).await.unwrap();
        wire::write_message(
            &mut stream,
            &wire::ResponseHeader {
                servicemethod: header.servicemethod,
                seq: header.seq + 7,
                error: String::new(),
            },
        )
        .await
        .unwrap();
        wire::write_message(
            &mut stream,
            &wire::Response {
                out: wire::binary(Vec::new()),
                error: String::new(),
            },
        )
        .await
        .unwrap();
    });

    let mut conn = match Connection::open(&endpoint, &DialOptions::default()).await.unwrap() {
        Dial::Ready(conn) => conn,
        Dial::Unregistered => panic!("scripted peer reports registered"),
    };
    let err = conn
        .call("EchoService", "echo", &doc! {}, "req", 0)
        .await
        .unwrap_err();
    match err {
        skynet_core::error::RpcError::Protocol(message) => {
            assert!(message.contains("seq"), "message was: {message}");
        }
        other => panic!("expected a protocol error, got: {other:?}"),
    }
}

#[tokio::test]
async fn idempotent_calls_retry_the_read_phase_on_a_fresh_connection() {
    use skynet_rpc::{PoolOptions, ServiceClient};

    // A scripted peer that reads a request and hangs up without
    // replying on the first two connections; the third is served
    // properly. The first dropped connection feeds the non-idempotent
    // call below, the second and third the idempotent one.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        for attempt in 0..3u32 {
            let (mut stream, _) = listener.accept().await.unwrap();
            wire::write_message(
                &mut stream,
                &ServiceHandshake {
                    registered: true,
                    clientid: format!("c{attempt}"),
                },
            )
            .await
            .unwrap();
            let _: ClientHandshake =
                wire::read_message(&mut stream, READ_TIMEOUT).await.unwrap();
            let header: RequestHeader =
                wire::read_message(&mut stream, READ_TIMEOUT).await.unwrap();
            let _ = wire::read_document(&mut stream, READ_TIMEOUT).await.unwrap();

            if attempt < 2 {
                // Drop without replying; the request may or may not
                // have been processed.
                continue;
            }

            let out = bson::to_vec(&doc! { "served": true }).unwrap();
            wire::write_message(
                &mut stream,
                &wire::ResponseHeader {
                    servicemethod: header.servicemethod,
                    seq: header.seq,
                    error: String::new(),
                },
            )
            .await
            .unwrap();
            wire::write_message(
                &mut stream,
                &wire::Response {
                    out: wire::binary(out),
                    error: String::new(),
                },
            )
            .await
            .unwrap();
        }
    });

    // Register the scripted peer's endpoint as a live instance so the
    // client resolves it.
    let f = fabric().await;
    f.registry
        .register("EchoService", "1", "Test", "127.0.0.1", addr.port())
        .await
        .unwrap();

    let client = ServiceClient::new(
        f.registry.clone(),
        f.pool.clone(),
        "EchoService",
        "1",
        "Test",
    );

    // Non-idempotent: the dropped reply surfaces.
    let err = client.call("echo", doc! {}).await.unwrap_err();
    assert!(err.is_transport(), "got: {err:?}");

    // Idempotent: the read phase retries on a fresh connection.
    let pool = skynet_rpc::ConnectionPool::new(PoolOptions::default());
    let client = ServiceClient::new(f.registry.clone(), pool, "EchoService", "1", "Test");
    let reply = client.call_idempotent("echo", doc! {}).await.unwrap();
    assert!(reply.get_bool("served").unwrap());
}
