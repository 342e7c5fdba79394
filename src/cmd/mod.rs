use std::time::Duration;

use bytes::Bytes;

mod parse;

use crate::db::Db;
use crate::frame::Frame;
use crate::replication::ServerInfo;
use parse::{Parse, ParseError};

/// One decoded command invocation. Execution is pure dispatch: every command
/// maps to a reply frame, and the session decides what to do with it (write
/// it back, or drop it on the replication feed).
#[derive(Debug)]
pub enum Command {
    Ping(Ping),
    Echo(Echo),
    Get(Get),
    Set(Set),
    Info(Info),
    Replconf(Replconf),
    Psync(Psync),
    Unknown(Unknown),
}

#[derive(Debug, Default)]
pub struct Ping;

#[derive(Debug)]
pub struct Echo {
    pub message: Bytes,
}

#[derive(Debug)]
pub struct Get {
    pub key: String,
}

#[derive(Debug)]
pub struct Set {
    pub key: String,
    pub value: Bytes,
    pub expire: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct Info;

#[derive(Debug)]
pub struct Replconf {
    pub key: String,
    pub value: String,
}

#[derive(Debug)]
pub struct Psync {
    pub replication_id: String,
    pub offset: String,
}

#[derive(Debug)]
pub struct Unknown {
    command_name: String,
}

impl Command {
    /// Map a wire frame to a command. The first element is matched
    /// case-sensitively.
    pub fn from_frame(frame: Frame) -> crate::Result<Command> {
        let mut parse = Parse::new(frame)?;

        let command_name = parse.next_string()?;

        let command = match command_name.as_str() {
            "PING" => Command::Ping(Ping::parse_frames(&mut parse)?),
            "ECHO" => Command::Echo(Echo::parse_frames(&mut parse)?),
            "GET" => Command::Get(Get::parse_frames(&mut parse)?),
            "SET" => Command::Set(Set::parse_frames(&mut parse)?),
            "INFO" => Command::Info(Info::parse_frames(&mut parse)?),
            "REPLCONF" => Command::Replconf(Replconf::parse_frames(&mut parse)?),
            "PSYNC" => Command::Psync(Psync::parse_frames(&mut parse)?),
            _ => return Ok(Command::Unknown(Unknown::new(command_name))),
        };

        parse.finish()?;

        Ok(command)
    }

    /// Run the command against the keyspace and produce its reply frame.
    ///
    /// REPLCONF and PSYNC only reach this point on a server that is not a
    /// primary; the session layer intercepts them before dispatch otherwise.
    pub fn execute(self, db: &Db, info: &ServerInfo) -> Frame {
        match self {
            Command::Ping(cmd) => cmd.execute(),
            Command::Echo(cmd) => cmd.execute(),
            Command::Get(cmd) => cmd.execute(db),
            Command::Set(cmd) => cmd.execute(db),
            Command::Info(cmd) => cmd.execute(info),
            Command::Replconf(_) => {
                Frame::Error("ERR REPLCONF is only accepted by a primary".to_string())
            }
            Command::Psync(_) => {
                Frame::Error("ERR PSYNC is only accepted by a primary".to_string())
            }
            Command::Unknown(cmd) => cmd.execute(),
        }
    }

    /// Whether the command mutates the keyspace and must be propagated to
    /// replicas when executed on a primary.
    pub fn is_write(&self) -> bool {
        matches!(self, Command::Set(_))
    }
}

impl Ping {
    pub fn new() -> Ping {
        Ping
    }

    pub fn into_frame(self) -> Frame {
        let mut frame = Frame::array();

        frame.push_string("PING".to_string());

        frame
    }

    fn parse_frames(parse: &mut Parse) -> Result<Ping, ParseError> {
        // an optional message argument is tolerated and ignored
        match parse.next_bytes() {
            Ok(_) | Err(ParseError::EndOfStream) => Ok(Ping),
            Err(e) => Err(e),
        }
    }

    fn execute(self) -> Frame {
        Frame::Simple("PONG".to_string())
    }
}

impl Echo {
    pub fn new(message: Bytes) -> Echo {
        Echo { message }
    }

    pub fn into_frame(self) -> Frame {
        let mut frame = Frame::array();

        frame.push_string("ECHO".to_string());
        frame.push_bulk(self.message);

        frame
    }

    fn parse_frames(parse: &mut Parse) -> Result<Echo, ParseError> {
        let message = parse.next_bytes()?;

        Ok(Echo { message })
    }

    fn execute(self) -> Frame {
        Frame::Bulk(self.message)
    }
}

impl Get {
    pub fn new(key: impl ToString) -> Get {
        Get {
            key: key.to_string(),
        }
    }

    pub fn into_frame(self) -> Frame {
        let mut frame = Frame::array();

        frame.push_string("GET".to_string());
        frame.push_string(self.key);

        frame
    }

    fn parse_frames(parse: &mut Parse) -> Result<Get, ParseError> {
        let key = parse.next_string()?;

        Ok(Get { key })
    }

    fn execute(self, db: &Db) -> Frame {
        match db.get(&self.key) {
            Some(value) => Frame::Bulk(value),
            None => Frame::Null,
        }
    }
}

impl Set {
    pub fn new(key: impl ToString, value: Bytes, expire: Option<Duration>) -> Set {
        Set {
            key: key.to_string(),
            value,
            expire,
        }
    }

    pub fn into_frame(self) -> Frame {
        let mut frame = Frame::array();

        frame.push_string("SET".to_string());
        frame.push_string(self.key);
        frame.push_bulk(self.value);

        if let Some(ms) = self.expire {
            frame.push_string("PX".to_string());
            frame.push_string(ms.as_millis().to_string());
        }

        frame
    }

    fn parse_frames(parse: &mut Parse) -> Result<Set, ParseError> {
        let key = parse.next_string()?;
        let value = parse.next_bytes()?;

        let expire = match parse.next_string() {
            Ok(option) if option == "PX" => {
                let ms = parse.next_int()?;

                // PX 0 means "no expiry", same as leaving the option off
                (ms > 0).then(|| Duration::from_millis(ms))
            }
            Ok(option) => {
                return Err(format!("protocol error; unsupported SET option {}", option).into())
            }
            Err(ParseError::EndOfStream) => None,
            Err(e) => return Err(e),
        };

        Ok(Set { key, value, expire })
    }

    fn execute(self, db: &Db) -> Frame {
        db.set(self.key, self.value, self.expire);

        Frame::Simple("OK".to_string())
    }
}

impl Info {
    pub fn new() -> Info {
        Info
    }

    pub fn into_frame(self) -> Frame {
        let mut frame = Frame::array();

        frame.push_string("INFO".to_string());

        frame
    }

    fn parse_frames(parse: &mut Parse) -> Result<Info, ParseError> {
        // a section argument ("INFO replication") is tolerated and ignored
        match parse.next_string() {
            Ok(_) | Err(ParseError::EndOfStream) => Ok(Info),
            Err(e) => Err(e),
        }
    }

    fn execute(self, info: &ServerInfo) -> Frame {
        Frame::Bulk(Bytes::from(info.payload().into_bytes()))
    }
}

impl Replconf {
    pub fn new(key: impl ToString, value: impl ToString) -> Replconf {
        Replconf {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    pub fn into_frame(self) -> Frame {
        let mut frame = Frame::array();

        frame.push_string("REPLCONF".to_string());
        frame.push_string(self.key);
        frame.push_string(self.value);

        frame
    }

    fn parse_frames(parse: &mut Parse) -> Result<Replconf, ParseError> {
        let key = parse.next_string()?;
        let value = parse.next_string()?;

        Ok(Replconf { key, value })
    }
}

impl Psync {
    /// The only supported request shape: full resync from the start.
    pub fn new() -> Psync {
        Psync {
            replication_id: "?".to_string(),
            offset: "-1".to_string(),
        }
    }

    pub fn into_frame(self) -> Frame {
        let mut frame = Frame::array();

        frame.push_string("PSYNC".to_string());
        frame.push_string(self.replication_id);
        frame.push_string(self.offset);

        frame
    }

    fn parse_frames(parse: &mut Parse) -> Result<Psync, ParseError> {
        let replication_id = parse.next_string()?;
        let offset = parse.next_string()?;

        Ok(Psync {
            replication_id,
            offset,
        })
    }
}

impl Default for Psync {
    fn default() -> Psync {
        Psync::new()
    }
}

impl Unknown {
    pub fn new(command_name: impl ToString) -> Unknown {
        Unknown {
            command_name: command_name.to_string(),
        }
    }

    fn execute(self) -> Frame {
        Frame::Error(format!("ERR unknown command '{}'", self.command_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_of(parts: &[&str]) -> Frame {
        let mut frame = Frame::array();
        for part in parts {
            frame.push_bulk(Bytes::copy_from_slice(part.as_bytes()));
        }
        frame
    }

    #[test]
    fn parses_set_with_px() {
        let frame = frame_of(&["SET", "k", "v", "PX", "100"]);

        match Command::from_frame(frame).unwrap() {
            Command::Set(set) => {
                assert_eq!(set.key, "k");
                assert_eq!(&set.value[..], b"v");
                assert_eq!(set.expire, Some(Duration::from_millis(100)));
            }
            other => panic!("expected SET, got {:?}", other),
        }
    }

    #[test]
    fn set_px_zero_means_no_expiry() {
        let frame = frame_of(&["SET", "k", "v", "PX", "0"]);

        match Command::from_frame(frame).unwrap() {
            Command::Set(set) => assert_eq!(set.expire, None),
            other => panic!("expected SET, got {:?}", other),
        }
    }

    #[test]
    fn set_rejects_negative_px() {
        let frame = frame_of(&["SET", "k", "v", "PX", "-5"]);

        assert!(Command::from_frame(frame).is_err());
    }

    #[test]
    fn command_names_are_case_sensitive() {
        let frame = frame_of(&["ping"]);

        assert!(matches!(
            Command::from_frame(frame).unwrap(),
            Command::Unknown(_)
        ));
    }

    #[test]
    fn echo_requires_exactly_one_argument() {
        assert!(Command::from_frame(frame_of(&["ECHO"])).is_err());
        assert!(Command::from_frame(frame_of(&["ECHO", "a", "b"])).is_err());
    }

    #[test]
    fn replconf_carries_announced_port() {
        let frame = frame_of(&["REPLCONF", "listening-port", "6380"]);

        match Command::from_frame(frame).unwrap() {
            Command::Replconf(replconf) => {
                assert_eq!(replconf.key, "listening-port");
                assert_eq!(replconf.value, "6380");
            }
            other => panic!("expected REPLCONF, got {:?}", other),
        }
    }

    #[test]
    fn only_set_is_a_write() {
        assert!(Command::from_frame(frame_of(&["SET", "k", "v"]))
            .unwrap()
            .is_write());
        assert!(!Command::from_frame(frame_of(&["GET", "k"]))
            .unwrap()
            .is_write());
        assert!(!Command::from_frame(frame_of(&["PING"])).unwrap().is_write());
    }
}
