use std::io::{self, Cursor};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;

use crate::frame::{self, Frame};

/// Buffered frame I/O over one socket. Reads accumulate into `buffer` until a
/// complete frame can be decoded, so frames split across reads are handled
/// transparently.
#[derive(Debug)]
pub struct Connection {
    stream: BufWriter<TcpStream>,
    buffer: BytesMut,
}

impl Connection {
    pub fn new(socket: TcpStream) -> Connection {
        Connection {
            stream: BufWriter::new(socket),
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Read one frame, waiting for more bytes as needed. `Ok(None)` means the
    /// peer closed the connection cleanly between frames.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, crate::Error> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }

            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                if self.buffer.is_empty() {
                    return Ok(None);
                } else {
                    return Err("connection reset by peer".into());
                }
            }
        }
    }

    fn parse_frame(&mut self) -> Result<Option<Frame>, crate::Error> {
        use frame::Error::Incomplete;

        let mut buf = Cursor::new(&self.buffer[..]);

        match Frame::check(&mut buf) {
            Ok(_) => {
                let len = buf.position() as usize;

                buf.set_position(0);

                let frame = Frame::parse(&mut buf)?;

                self.buffer.advance(len);

                Ok(Some(frame))
            }
            Err(Incomplete) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read the full-resync snapshot payload: `$<len>\r\n` followed by `len`
    /// raw bytes with no trailing CRLF, so it cannot go through the regular
    /// frame decoder.
    pub async fn read_snapshot(&mut self) -> Result<Bytes, crate::Error> {
        loop {
            if let Some(payload) = self.parse_snapshot()? {
                return Ok(payload);
            }

            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                return Err("connection reset by peer".into());
            }
        }
    }

    fn parse_snapshot(&mut self) -> Result<Option<Bytes>, crate::Error> {
        let header_end = match self.buffer[..].windows(2).position(|w| w == b"\r\n") {
            Some(pos) => pos,
            None => return Ok(None),
        };

        if self.buffer[0] != b'$' {
            return Err("protocol error; expected snapshot bulk payload".into());
        }

        let len: usize = atoi::atoi(&self.buffer[1..header_end])
            .ok_or("protocol error; invalid snapshot length")?;

        if self.buffer.len() < header_end + 2 + len {
            return Ok(None);
        }

        self.buffer.advance(header_end + 2);
        let payload = Bytes::copy_from_slice(&self.buffer[..len]);
        self.buffer.advance(len);

        Ok(Some(payload))
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        match frame {
            Frame::Array(val) => {
                self.stream.write_u8(b'*').await?;
                self.write_decimal(val.len() as u64).await?;

                for entry in val {
                    self.write_value(entry).await?;
                }
            }
            _ => {
                self.write_value(frame).await?;
            }
        }

        self.stream.flush().await
    }

    async fn write_value(&mut self, frame: &Frame) -> io::Result<()> {
        match frame {
            Frame::Simple(string) => {
                self.stream.write_u8(b'+').await?;
                self.stream.write_all(string.as_bytes()).await?;
                self.stream.write_all(b"\r\n").await?;
            }
            Frame::Error(message) => {
                self.stream.write_u8(b'-').await?;
                self.stream.write_all(message.as_bytes()).await?;
                self.stream.write_all(b"\r\n").await?;
            }
            Frame::Integer(value) => {
                self.stream.write_u8(b':').await?;
                self.write_decimal(*value).await?;
            }
            Frame::Bulk(val) => {
                let len = val.len();

                self.stream.write_u8(b'$').await?;
                self.write_decimal(len as u64).await?;
                self.stream.write_all(val).await?;
                self.stream.write_all(b"\r\n").await?;
            }
            Frame::Null => {
                self.stream.write_all(b"$-1\r\n").await?;
            }
            Frame::Raw(bytes) => {
                self.stream.write_all(bytes).await?;
            }
            // nested arrays never occur in this protocol's replies
            Frame::Array(_) => unreachable!(),
        }

        Ok(())
    }

    async fn write_decimal(&mut self, val: u64) -> io::Result<()> {
        use std::io::Write;

        let mut buf = [0u8; 20];
        let mut buf = Cursor::new(&mut buf[..]);
        write!(&mut buf, "{}", val)?;

        let pos = buf.position() as usize;
        self.stream.write_all(&buf.get_ref()[..pos]).await?;
        self.stream.write_all(b"\r\n").await?;

        Ok(())
    }
}
