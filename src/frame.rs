use std::fmt;
use std::io::Cursor;
use std::string::FromUtf8Error;

use bytes::{Buf, Bytes};

/// A single decoded wire value. Commands arrive as an `Array` of `Bulk`
/// elements; replies use the scalar variants.
#[derive(Debug, Clone)]
pub enum Frame {
    Simple(String),    // +
    Error(String),     // -
    Integer(u64),      // :
    Bulk(Bytes),       // $
    Null,              // $-1
    Array(Vec<Frame>), // *
    /// Pre-encoded bytes written to the wire verbatim. Never produced by the
    /// decoder; carries the replication snapshot, which has no trailing CRLF.
    Raw(Bytes),
}

#[derive(Debug)]
pub enum Error {
    /// Not enough buffered bytes to decode a complete frame yet.
    Incomplete,
    Other(crate::Error),
}

impl Frame {
    pub fn array() -> Frame {
        Frame::Array(vec![])
    }

    pub fn push_bulk(&mut self, bytes: Bytes) {
        match self {
            Frame::Array(vec) => {
                vec.push(Frame::Bulk(bytes));
            }
            _ => panic!("not an array frame"),
        }
    }

    pub fn push_string(&mut self, string: String) {
        match self {
            Frame::Array(vec) => {
                vec.push(Frame::Bulk(Bytes::from(string.into_bytes())));
            }
            _ => panic!("not an array frame"),
        }
    }

    /// Validate that one complete frame is buffered, without allocating.
    /// Lengths are walked exactly as declared; bulk payloads are skipped,
    /// never scanned, so binary content cannot confuse the decoder.
    pub fn check(src: &mut Cursor<&[u8]>) -> Result<(), Error> {
        match get_descriptor(src)? {
            b'+' | b'-' => {
                get_line(src)?;
                Ok(())
            }
            b':' => {
                get_decimal(src)?;
                Ok(())
            }
            b'$' => {
                if peek_u8(src)? == b'-' {
                    // null bulk string
                    get_line(src)?;
                    Ok(())
                } else {
                    let len = get_decimal(src)? as usize;

                    // payload + trailing \r\n
                    skip(src, len + 2)
                }
            }
            b'*' => {
                let len = get_decimal(src)?;

                for _ in 0..len {
                    Frame::check(src)?;
                }

                Ok(())
            }
            marker => Err(format!("protocol error; invalid frame type byte {}", marker).into()),
        }
    }

    /// Build the frame. The caller has already run [`Frame::check`], so the
    /// buffer is known to hold a complete frame.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Frame, Error> {
        match get_descriptor(src)? {
            b'+' => {
                let bytes_vec = get_line(src)?.to_vec();
                let string = String::from_utf8(bytes_vec)?;

                Ok(Frame::Simple(string))
            }
            b'-' => {
                let bytes_vec = get_line(src)?.to_vec();
                let string = String::from_utf8(bytes_vec)?;

                Ok(Frame::Error(string))
            }
            b':' => {
                let value = get_decimal(src)?;

                Ok(Frame::Integer(value))
            }
            b'$' => {
                if peek_u8(src)? == b'-' {
                    let line = get_line(src)?;

                    if line != b"-1" {
                        return Err("protocol error; invalid bulk length".into());
                    }

                    return Ok(Frame::Null);
                }

                let len = get_decimal(src)? as usize;
                let n = len + 2;

                if src.remaining() < n {
                    return Err(Error::Incomplete);
                }

                let data = Bytes::copy_from_slice(&src.chunk()[..len]);

                skip(src, n)?;

                Ok(Frame::Bulk(data))
            }
            b'*' => {
                let len = get_decimal(src)?;
                let mut array: Vec<Frame> = Vec::with_capacity(len as usize);

                for _ in 0..len {
                    array.push(Frame::parse(src)?);
                }

                Ok(Frame::Array(array))
            }
            marker => Err(format!("protocol error; invalid frame type byte {}", marker).into()),
        }
    }
}

fn get_decimal(src: &mut Cursor<&[u8]>) -> Result<u64, Error> {
    use atoi::atoi;

    let line = get_line(src)?;

    atoi::<u64>(line).ok_or_else(|| "protocol error; invalid frame format".into())
}

/// A "line" is a sequence of bytes terminated by CRLF. Only used for the
/// length and status fields of a frame, never for bulk payloads.
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    let end = src.get_ref().len() - 1;

    for i in start..end {
        if src.get_ref()[i] == b'\r' && src.get_ref()[i + 1] == b'\n' {
            src.set_position((i + 2) as u64);

            return Ok(&src.get_ref()[start..i]);
        }
    }

    Err(Error::Incomplete)
}

fn get_descriptor(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }

    Ok(src.get_u8())
}

fn peek_u8(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }

    Ok(src.chunk()[0])
}

fn skip(src: &mut Cursor<&[u8]>, n: usize) -> Result<(), Error> {
    if src.remaining() < n {
        return Err(Error::Incomplete);
    }

    src.advance(n);
    Ok(())
}

impl From<String> for Error {
    fn from(src: String) -> Error {
        Error::Other(src.into())
    }
}

impl From<&str> for Error {
    fn from(src: &str) -> Error {
        src.to_string().into()
    }
}

impl From<FromUtf8Error> for Error {
    fn from(_src: FromUtf8Error) -> Error {
        "protocol error; invalid frame format".into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Incomplete => "stream ended early".fmt(fmt),
            Error::Other(err) => err.fmt(fmt),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(data: &[u8]) -> Result<Frame, Error> {
        let mut cursor = Cursor::new(data);
        Frame::check(&mut cursor)?;

        let len = cursor.position() as usize;
        assert_eq!(len, data.len(), "check must consume the whole input");

        cursor.set_position(0);
        Frame::parse(&mut cursor)
    }

    #[test]
    fn parses_command_array() {
        let frame = decode(b"*2\r\n$4\r\nECHO\r\n$3\r\nfoo\r\n").unwrap();

        match frame {
            Frame::Array(items) => {
                assert_eq!(items.len(), 2);
                assert!(matches!(&items[0], Frame::Bulk(b) if &b[..] == b"ECHO"));
                assert!(matches!(&items[1], Frame::Bulk(b) if &b[..] == b"foo"));
            }
            other => panic!("expected array, got {:?}", other),
        }
    }

    #[test]
    fn bulk_payload_is_binary_safe() {
        // the payload embeds CRLF and non-UTF8 bytes; the declared length wins
        let frame = decode(b"*1\r\n$6\r\na\r\n\xff\x00b\r\n").unwrap();

        match frame {
            Frame::Array(items) => {
                assert!(matches!(&items[0], Frame::Bulk(b) if &b[..] == b"a\r\n\xff\x00b"));
            }
            other => panic!("expected array, got {:?}", other),
        }
    }

    #[test]
    fn truncated_input_reports_incomplete() {
        let full: &[u8] = b"*1\r\n$4\r\nPING\r\n";

        for cut in 0..full.len() {
            let mut cursor = Cursor::new(&full[..cut]);
            match Frame::check(&mut cursor) {
                Err(Error::Incomplete) => {}
                other => panic!("cut at {} gave {:?}", cut, other),
            }
        }
    }

    #[test]
    fn parses_null_bulk() {
        assert!(matches!(decode(b"$-1\r\n").unwrap(), Frame::Null));
    }

    #[test]
    fn parses_simple_and_error_lines() {
        assert!(matches!(decode(b"+OK\r\n").unwrap(), Frame::Simple(s) if s == "OK"));
        assert!(
            matches!(decode(b"-ERR unknown command\r\n").unwrap(), Frame::Error(s) if s == "ERR unknown command")
        );
    }

    #[test]
    fn rejects_unknown_type_marker() {
        let mut cursor = Cursor::new(&b"%1\r\n"[..]);
        assert!(matches!(Frame::check(&mut cursor), Err(Error::Other(_))));
    }

    #[test]
    fn rejects_invalid_bulk_length() {
        let mut cursor = Cursor::new(&b"$abc\r\nxyz\r\n"[..]);
        assert!(matches!(Frame::check(&mut cursor), Err(Error::Other(_))));

        let mut cursor = Cursor::new(&b"$-2\r\n"[..]);
        assert!(matches!(Frame::parse(&mut cursor), Err(Error::Other(_))));
    }
}
