use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::cmd::{Echo, Get, Info, Ping, Set};
use crate::connection::Connection;
use crate::frame::Frame;

/// Minimal protocol client, used by the CLI binary and the integration tests.
pub struct Client {
    connection: Connection,
}

impl Client {
    pub async fn connect<T: ToSocketAddrs>(addr: T) -> crate::Result<Client> {
        let socket = TcpStream::connect(addr).await?;
        let connection = Connection::new(socket);

        Ok(Client { connection })
    }

    pub async fn ping(&mut self) -> crate::Result<String> {
        let frame = Ping::new().into_frame();
        self.connection.write_frame(&frame).await?;

        match self.read_response().await? {
            Frame::Simple(string) => Ok(string),
            frame => Err(format!("unexpected reply: {:?}", frame).into()),
        }
    }

    pub async fn echo(&mut self, message: Bytes) -> crate::Result<Bytes> {
        let frame = Echo::new(message).into_frame();
        self.connection.write_frame(&frame).await?;

        match self.read_response().await? {
            Frame::Bulk(data) => Ok(data),
            frame => Err(format!("unexpected reply: {:?}", frame).into()),
        }
    }

    pub async fn get(&mut self, key: &str) -> crate::Result<Option<Bytes>> {
        let frame = Get::new(key).into_frame();
        self.connection.write_frame(&frame).await?;

        match self.read_response().await? {
            Frame::Bulk(data) => Ok(Some(data)),
            Frame::Null => Ok(None),
            frame => Err(format!("unexpected reply: {:?}", frame).into()),
        }
    }

    pub async fn set(&mut self, key: &str, value: Bytes) -> crate::Result<()> {
        self.set_cmd(Set::new(key, value, None)).await
    }

    /// SET with a PX expiry.
    pub async fn set_expires(
        &mut self,
        key: &str,
        value: Bytes,
        expiration: Duration,
    ) -> crate::Result<()> {
        self.set_cmd(Set::new(key, value, Some(expiration))).await
    }

    async fn set_cmd(&mut self, cmd: Set) -> crate::Result<()> {
        let frame = cmd.into_frame();
        self.connection.write_frame(&frame).await?;

        match self.read_response().await? {
            Frame::Simple(string) if string == "OK" => Ok(()),
            frame => Err(format!("unexpected reply: {:?}", frame).into()),
        }
    }

    pub async fn info(&mut self) -> crate::Result<String> {
        let frame = Info::new().into_frame();
        self.connection.write_frame(&frame).await?;

        match self.read_response().await? {
            Frame::Bulk(data) => Ok(String::from_utf8_lossy(&data).into_owned()),
            frame => Err(format!("unexpected reply: {:?}", frame).into()),
        }
    }

    async fn read_response(&mut self) -> crate::Result<Frame> {
        match self.connection.read_frame().await? {
            Some(Frame::Error(message)) => Err(message.into()),
            Some(frame) => Ok(frame),
            None => Err("connection closed by server".into()),
        }
    }
}
