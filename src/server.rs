use std::future::Future;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::cmd::Command;
use crate::connection::Connection;
use crate::db::{Db, DbHolder};
use crate::frame::Frame;
use crate::replication::{self, Replicas, Role, ServerInfo};

/// Configuration handed in by the binary: the port this server announces to
/// a primary, and the optional `"<host> <port>"` primary address whose
/// presence selects the replica role.
#[derive(Debug)]
pub struct Config {
    pub port: u16,
    pub replicaof: Option<String>,
}

#[derive(Debug)]
struct Listener {
    listener: TcpListener,
    db_holder: DbHolder,
    info: Arc<ServerInfo>,
    replicas: Replicas,
}

#[derive(Debug)]
struct Handler {
    connection: Connection,
    db: Db,
    info: Arc<ServerInfo>,
    replicas: Replicas,
    /// Port announced by a REPLCONF listening-port on this connection,
    /// pending the PSYNC that completes the replica handshake.
    pending_replica_port: Option<String>,
}

pub async fn run(listener: TcpListener, config: Config, shutdown: impl Future) {
    let info = Arc::new(ServerInfo::new(config.replicaof));

    let server = Listener {
        listener,
        db_holder: DbHolder::new(),
        info: info.clone(),
        replicas: Replicas::new(),
    };

    if info.role == Role::Replica {
        tokio::spawn(replication::replicate(
            info,
            config.port,
            server.db_holder.db(),
        ));
    }

    tokio::select! {
        res = server.run() => {
            if let Err(err) = res {
                error!(%err, "failed to accept connection");
            }
        }
        _ = shutdown => {
            info!("shutting down");
        }
    }
}

impl Listener {
    async fn run(&self) -> crate::Result<()> {
        info!(role = self.info.role.as_str(), "accepting connections");

        loop {
            let socket = self.accept().await?;

            let handler = Handler {
                connection: Connection::new(socket),
                db: self.db_holder.db(),
                info: self.info.clone(),
                replicas: self.replicas.clone(),
                pending_replica_port: None,
            };

            tokio::spawn(async move {
                if let Err(err) = handler.run().await {
                    debug!(%err, "connection ended with error");
                }
            });
        }
    }

    async fn accept(&self) -> crate::Result<TcpStream> {
        match self.listener.accept().await {
            Ok((socket, _)) => Ok(socket),
            Err(err) => Err(err.into()),
        }
    }
}

impl Handler {
    /// Per-connection session loop: decode a frame, dispatch it, write the
    /// reply. Runs until the peer disconnects, the framing breaks, or the
    /// session is promoted to a replica feed.
    async fn run(mut self) -> crate::Result<()> {
        loop {
            let maybe_frame = match self.connection.read_frame().await {
                Ok(maybe_frame) => maybe_frame,
                Err(err) => {
                    // a framing violation leaves no resynchronization point
                    // in a length-prefixed stream: report it, then stop
                    let reply = Frame::Error(format!("ERR {}", err));
                    let _ = self.connection.write_frame(&reply).await;
                    return Err(err);
                }
            };

            let frame = match maybe_frame {
                Some(frame) => frame,
                None => return Ok(()),
            };

            // hold on to the original encoding for replica propagation
            let raw = match self.info.role {
                Role::Primary => Some(frame.clone()),
                Role::Replica => None,
            };

            let command = match Command::from_frame(frame) {
                Ok(command) => command,
                Err(err) => {
                    // well-framed but invalid command; the stream is still
                    // aligned, so the session continues
                    let reply = Frame::Error(format!("ERR {}", err));
                    self.connection.write_frame(&reply).await?;
                    continue;
                }
            };

            match command {
                Command::Replconf(replconf) if self.info.role == Role::Primary => {
                    if replconf.key == "listening-port" {
                        self.pending_replica_port = Some(replconf.value);
                    }

                    let reply = Frame::Simple("OK".to_string());
                    self.connection.write_frame(&reply).await?;
                }
                Command::Psync(_) if self.info.role == Role::Primary => {
                    match self.pending_replica_port.take() {
                        Some(port) => return self.promote(port).await,
                        None => {
                            let reply = Frame::Error(
                                "ERR PSYNC requires a prior REPLCONF listening-port".to_string(),
                            );
                            self.connection.write_frame(&reply).await?;
                        }
                    }
                }
                command => {
                    let propagate = command.is_write();

                    let reply = command.execute(&self.db, &self.info);
                    self.connection.write_frame(&reply).await?;

                    if propagate {
                        if let Some(frame) = raw {
                            self.replicas.broadcast(frame);
                        }
                    }
                }
            }
        }
    }

    /// Complete the replica handshake: answer the PSYNC with a full resync,
    /// then hand the connection over to the replication coordinator. The
    /// session loop ends here; from now on the peer only receives broadcast
    /// writes.
    async fn promote(mut self, listening_port: String) -> crate::Result<()> {
        self.connection
            .write_frame(&replication::full_resync_reply(&self.info))
            .await?;
        self.connection
            .write_frame(&replication::snapshot_frame())
            .await?;

        self.replicas.register(listening_port, self.connection);

        Ok(())
    }
}
