use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cmd::{Command, Ping, Psync, Replconf};
use crate::connection::Connection;
use crate::db::Db;
use crate::frame::Frame;

/// Deadline for each step of the replica handshake. An unresponsive primary
/// degrades the server to standalone instead of hanging it.
pub const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames queued per replica before the primary gives up on it.
const FEED_QUEUE_DEPTH: usize = 64;

/// 88-byte image of an empty snapshot, sent verbatim on every full resync.
/// Partial resync is unsupported, so this is the only payload ever served.
const EMPTY_SNAPSHOT: &[u8] = b"REDIS0011\xfa\x09redis-ver\x057.2.0\xfa\x0aredis-bits\xc0@\xfa\x05ctime\xc2m\x08\xbce\xfa\x08used-mem\xc2\xb0\xc4\x10\x00\xfa\x08aof-base\xc0\x00\xff\xf0n;\xfe\xc0\xffZ\xa2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
}

impl Role {
    /// Wire-facing name, as reported by INFO.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "master",
            Role::Replica => "slave",
        }
    }
}

/// Identity fixed at process start: the role, the 40-char replication id and
/// the (never advancing) replication offset reported by INFO, plus the
/// primary address when running as a replica.
#[derive(Debug)]
pub struct ServerInfo {
    pub role: Role,
    pub replication_id: String,
    pub replication_offset: u64,
    pub primary_addr: Option<String>,
}

impl ServerInfo {
    /// `replicaof` is the raw `"<host> <port>"` value; its presence selects
    /// the replica role.
    pub fn new(replicaof: Option<String>) -> ServerInfo {
        let role = match replicaof {
            Some(_) => Role::Replica,
            None => Role::Primary,
        };

        ServerInfo {
            role,
            replication_id: generate_replication_id(),
            replication_offset: 0,
            primary_addr: replicaof,
        }
    }

    /// INFO reply body.
    pub fn payload(&self) -> String {
        format!(
            "role:{}\r\nmaster_replid:{}\r\nmaster_repl_offset:{}",
            self.role.as_str(),
            self.replication_id,
            self.replication_offset
        )
    }
}

fn generate_replication_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(40)
        .map(char::from)
        .collect()
}

/// The primary's set of confirmed replicas. Registration happens when a
/// session completes PSYNC; removal happens when a feed fails or backs up.
/// Only this type mutates the set.
#[derive(Debug, Clone)]
pub struct Replicas {
    shared: Arc<Mutex<Vec<Registration>>>,
}

#[derive(Debug)]
struct Registration {
    listening_port: String,
    sender: mpsc::Sender<Frame>,
}

impl Replicas {
    pub fn new() -> Replicas {
        Replicas {
            shared: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Promote a handshaken session: the connection moves into a dedicated
    /// writer task fed by a bounded queue, decoupling each replica's socket
    /// from the sessions that accept writes.
    pub fn register(&self, listening_port: String, mut connection: Connection) {
        let (sender, mut feed) = mpsc::channel::<Frame>(FEED_QUEUE_DEPTH);

        let port = listening_port.clone();
        tokio::spawn(async move {
            while let Some(frame) = feed.recv().await {
                if let Err(err) = connection.write_frame(&frame).await {
                    debug!(%port, %err, "replica feed write failed");
                    return;
                }
            }
        });

        info!(port = %listening_port, "replica registered");

        self.shared.lock().unwrap().push(Registration {
            listening_port,
            sender,
        });
    }

    /// Best-effort, at-most-once fan-out of one accepted write. A replica
    /// whose feed is gone or full is dropped; it can reconnect and full-resync.
    pub fn broadcast(&self, frame: Frame) {
        let mut registrations = self.shared.lock().unwrap();

        registrations.retain(|replica| match replica.sender.try_send(frame.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(port = %replica.listening_port, "replica feed backed up; dropping replica");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(port = %replica.listening_port, "replica disconnected");
                false
            }
        });
    }
}

impl Default for Replicas {
    fn default() -> Replicas {
        Replicas::new()
    }
}

/// Reply line a primary sends when accepting a PSYNC.
pub(crate) fn full_resync_reply(info: &ServerInfo) -> Frame {
    Frame::Simple(format!(
        "FULLRESYNC {} {}",
        info.replication_id, info.replication_offset
    ))
}

/// The snapshot transfer that follows: `$<len>\r\n` plus the raw image, with
/// no trailing CRLF.
pub(crate) fn snapshot_frame() -> Frame {
    let mut payload = Vec::with_capacity(EMPTY_SNAPSHOT.len() + 16);
    payload.extend_from_slice(format!("${}\r\n", EMPTY_SNAPSHOT.len()).as_bytes());
    payload.extend_from_slice(EMPTY_SNAPSHOT);

    Frame::Raw(Bytes::from(payload))
}

/// Entry point for a replica process: handshake against the configured
/// primary, then apply its write stream until the connection drops. Any
/// failure leaves the server running standalone; it is never fatal.
pub async fn replicate(info: Arc<ServerInfo>, listening_port: u16, db: Db) {
    let addr = match info.primary_addr.as_deref().and_then(parse_primary_addr) {
        Some(addr) => addr,
        None => {
            warn!("invalid primary address; serving standalone");
            return;
        }
    };

    match run_replica(&addr, listening_port, &db, &info).await {
        Ok(()) => info!(primary = %addr, "replication stream ended; serving standalone"),
        Err(err) => warn!(primary = %addr, %err, "replication failed; serving standalone"),
    }
}

/// `"<host> <port>"` → `"host:port"`.
fn parse_primary_addr(raw: &str) -> Option<String> {
    let mut parts = raw.split_whitespace();
    let host = parts.next()?;
    let port = parts.next()?;

    if parts.next().is_some() {
        return None;
    }

    Some(format!("{}:{}", host, port))
}

async fn run_replica(
    addr: &str,
    listening_port: u16,
    db: &Db,
    info: &ServerInfo,
) -> crate::Result<()> {
    let socket = TcpStream::connect(addr).await?;
    let mut connection = Connection::new(socket);

    handshake(&mut connection, listening_port).await?;
    info!(primary = %addr, "replication handshake complete");

    loop {
        match connection.read_frame().await? {
            Some(frame) => match Command::from_frame(frame) {
                // propagated writes are applied with the reply suppressed;
                // the primary never reads from this connection
                Ok(command) => {
                    debug!(?command, "applying propagated command");
                    command.execute(db, info);
                }
                Err(err) => warn!(%err, "ignoring malformed propagated command"),
            },
            None => return Ok(()),
        }
    }
}

/// The fixed four-step handshake. Strictly sequential; each step waits for
/// its reply under [`HANDSHAKE_STEP_TIMEOUT`].
async fn handshake(connection: &mut Connection, listening_port: u16) -> crate::Result<()> {
    exchange(connection, Ping::new().into_frame(), "PONG").await?;
    exchange(
        connection,
        Replconf::new("listening-port", listening_port).into_frame(),
        "OK",
    )
    .await?;
    exchange(connection, Replconf::new("capa", "psync2").into_frame(), "OK").await?;
    exchange(connection, Psync::new().into_frame(), "FULLRESYNC").await?;

    // the snapshot following FULLRESYNC is always the empty image; consume
    // and discard it so the command stream that follows stays aligned
    timeout(HANDSHAKE_STEP_TIMEOUT, connection.read_snapshot())
        .await
        .map_err(|_| "timed out waiting for the resync snapshot")??;

    Ok(())
}

/// One handshake step: send the request, await the reply under a deadline,
/// accept it when the expected token appears anywhere in its text.
async fn exchange(connection: &mut Connection, request: Frame, expect: &str) -> crate::Result<()> {
    connection.write_frame(&request).await?;

    let reply = timeout(HANDSHAKE_STEP_TIMEOUT, connection.read_frame())
        .await
        .map_err(|_| format!("handshake timed out waiting for {}", expect))??
        .ok_or("primary closed the connection during handshake")?;

    let text = match &reply {
        Frame::Simple(s) => s.clone(),
        Frame::Bulk(data) => String::from_utf8_lossy(data).into_owned(),
        other => format!("{:?}", other),
    };

    if !text.contains(expect) {
        return Err(format!("handshake step failed; expected {}, got {}", expect, text).into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replication_id_is_40_alphanumeric_chars() {
        let id = generate_replication_id();

        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn info_payload_reports_role_and_id() {
        let info = ServerInfo::new(None);
        let payload = info.payload();

        assert!(payload.starts_with("role:master\r\n"));
        assert!(payload.contains(&format!("master_replid:{}", info.replication_id)));
        assert!(payload.ends_with("master_repl_offset:0"));

        let info = ServerInfo::new(Some("localhost 6379".to_string()));
        assert!(info.payload().starts_with("role:slave\r\n"));
    }

    #[test]
    fn parses_primary_addr() {
        assert_eq!(
            parse_primary_addr("localhost 7000"),
            Some("localhost:7000".to_string())
        );
        assert_eq!(parse_primary_addr("localhost"), None);
        assert_eq!(parse_primary_addr("a b c"), None);
    }

    #[test]
    fn snapshot_frame_is_length_prefixed_without_trailing_crlf() {
        match snapshot_frame() {
            Frame::Raw(bytes) => {
                assert!(bytes.starts_with(b"$88\r\n"));
                assert_eq!(bytes.len(), 5 + 88);
                assert!(!bytes.ends_with(b"\r\n"));
            }
            other => panic!("expected raw frame, got {:?}", other),
        }
    }
}
