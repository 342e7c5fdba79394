use std::future::pending;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Instant};

use replikv::client::Client;
use replikv::server::{self, Config};

async fn start_server(replicaof: Option<String>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = Config {
        port: addr.port(),
        replicaof,
    };

    tokio::spawn(server::run(listener, config, pending::<()>()));

    addr
}

async fn start_primary() -> SocketAddr {
    start_server(None).await
}

/// Read from `stream` until `buf` ends with `suffix`.
async fn read_until(stream: &mut TcpStream, buf: &mut Vec<u8>, suffix: &[u8]) {
    let mut chunk = [0u8; 512];

    while !buf.ends_with(suffix) {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "server closed the connection early");
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[tokio::test]
async fn ping_returns_pong() {
    let addr = start_primary().await;
    let mut client = Client::connect(addr).await.unwrap();

    assert_eq!(client.ping().await.unwrap(), "PONG");
}

#[tokio::test]
async fn echo_is_byte_exact_for_binary_payloads() {
    let addr = start_primary().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // payload contains NUL, a non-UTF8 byte and an embedded CRLF
    stream
        .write_all(b"*2\r\n$4\r\nECHO\r\n$5\r\n\x00\xff\r\nx\r\n")
        .await
        .unwrap();

    let mut reply = vec![0u8; 11];
    stream.read_exact(&mut reply).await.unwrap();

    assert_eq!(&reply[..], b"$5\r\n\x00\xff\r\nx\r\n");
}

#[tokio::test]
async fn get_of_never_set_key_is_null() {
    let addr = start_primary().await;
    let mut client = Client::connect(addr).await.unwrap();

    assert_eq!(client.get("never-set").await.unwrap(), None);
}

#[tokio::test]
async fn set_then_get_round_trips() {
    let addr = start_primary().await;
    let mut client = Client::connect(addr).await.unwrap();

    client
        .set("hello", Bytes::from_static(b"world"))
        .await
        .unwrap();

    assert_eq!(
        client.get("hello").await.unwrap(),
        Some(Bytes::from_static(b"world"))
    );
}

#[tokio::test]
async fn set_with_px_expires() {
    let addr = start_primary().await;
    let mut client = Client::connect(addr).await.unwrap();

    client
        .set_expires("k", Bytes::from_static(b"v"), Duration::from_millis(100))
        .await
        .unwrap();

    assert_eq!(
        client.get("k").await.unwrap(),
        Some(Bytes::from_static(b"v"))
    );

    sleep(Duration::from_millis(200)).await;

    assert_eq!(client.get("k").await.unwrap(), None);
    // expiry is idempotent
    assert_eq!(client.get("k").await.unwrap(), None);
}

#[tokio::test]
async fn info_reports_identity() {
    let addr = start_primary().await;
    let mut client = Client::connect(addr).await.unwrap();

    let info = client.info().await.unwrap();

    assert!(info.contains("role:master"));
    assert!(info.contains("master_repl_offset:0"));

    let replid = info
        .split("\r\n")
        .find_map(|line| line.strip_prefix("master_replid:"))
        .unwrap();
    assert_eq!(replid.len(), 40);
}

#[tokio::test]
async fn unknown_command_keeps_the_connection_usable() {
    let addr = start_primary().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream.write_all(b"*1\r\n$5\r\nHELLO\r\n").await.unwrap();

    let mut reply = Vec::new();
    read_until(&mut stream, &mut reply, b"\r\n").await;
    assert_eq!(reply[0], b'-');
    assert!(reply.starts_with(b"-ERR unknown command"));

    stream.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();

    let mut reply = vec![0u8; 7];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..], b"+PONG\r\n");
}

#[tokio::test]
async fn truncated_frame_is_completed_by_later_bytes() {
    let addr = start_primary().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream.write_all(b"*1\r\n$4\r\nPI").await.unwrap();
    sleep(Duration::from_millis(50)).await;
    stream.write_all(b"NG\r\n").await.unwrap();

    let mut reply = vec![0u8; 7];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..], b"+PONG\r\n");
}

#[tokio::test]
async fn concurrent_clients_on_disjoint_keys_lose_no_updates() {
    let addr = start_primary().await;

    let mut tasks = Vec::new();

    for client_id in 0..8 {
        tasks.push(tokio::spawn(async move {
            let mut client = Client::connect(addr).await.unwrap();

            for i in 0..20 {
                let key = format!("client{}-key{}", client_id, i);
                let value = Bytes::from(format!("value{}-{}", client_id, i).into_bytes());

                client.set(&key, value.clone()).await.unwrap();
                assert_eq!(client.get(&key).await.unwrap(), Some(value));
            }
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn replica_reports_slave_role() {
    let primary = start_primary().await;
    let replica = start_server(Some(format!("127.0.0.1 {}", primary.port()))).await;

    let mut client = Client::connect(replica).await.unwrap();

    assert!(client.info().await.unwrap().contains("role:slave"));
}

#[tokio::test]
async fn writes_on_the_primary_reach_the_replica() {
    let primary = start_primary().await;
    let replica = start_server(Some(format!("127.0.0.1 {}", primary.port()))).await;

    let mut primary_client = Client::connect(primary).await.unwrap();
    let mut replica_client = Client::connect(replica).await.unwrap();

    // propagation is at-most-once and starts only after the handshake, so
    // keep writing until a propagated value shows up on the replica
    let deadline = Instant::now() + Duration::from_secs(5);

    loop {
        primary_client
            .set("x", Bytes::from_static(b"1"))
            .await
            .unwrap();

        if replica_client.get("x").await.unwrap() == Some(Bytes::from_static(b"1")) {
            break;
        }

        assert!(
            Instant::now() < deadline,
            "replication did not converge within the deadline"
        );

        sleep(Duration::from_millis(50)).await;
    }
}
