//! Line protocol spoken over the control socket.
//!
//! Every connection carries exactly one request line. Replies are
//! newline-terminated lines; `ATTACH` switches the connection to a raw
//! byte stream after its `OK ATTACH` reply.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, NO_SUCH_SESSION};

/// Byte that ends an attachment when it arrives from the client side (Ctrl-]).
pub const DETACH_BYTE: u8 = 0x1D;

/// Upper bound on the length of a request line.
pub const MAX_REQUEST_LEN: usize = 4096;

/// Identifier of a session, unique for the lifetime of a daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<u64>() {
            Ok(id) if id > 0 => Ok(Self(id)),
            _ => Err(ProtocolError::InvalidSessionId(s.to_string())),
        }
    }
}

/// Terminal window size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl WindowSize {
    fn parse(verb: &'static str, rows: &str, cols: &str) -> Result<Self, ProtocolError> {
        let parse_dim = |s: &str| match s.parse::<u16>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(ProtocolError::Usage(verb)),
        };
        Ok(Self {
            rows: parse_dim(rows)?,
            cols: parse_dim(cols)?,
        })
    }
}

/// A request sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Start a new session, running `command` through the shell if given.
    Spawn { command: Option<String> },
    /// Enumerate live sessions.
    List,
    /// Send SIGKILL to a session's process.
    Kill { id: SessionId },
    /// Stream the session's terminal over this connection.
    Attach {
        id: SessionId,
        size: Option<WindowSize>,
    },
    /// Change the session's window size.
    Resize { id: SessionId, size: WindowSize },
}

const ATTACH_USAGE: &str = "ATTACH <id> [<rows> <cols>]";
const KILL_USAGE: &str = "KILL <id>";
const RESIZE_USAGE: &str = "RESIZE <id> <rows> <cols>";

impl FromStr for Request {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_end_matches(['\r', '\n']);
        let line = line.trim_start_matches(' ');
        let (verb, rest) = match line.split_once(' ') {
            Some((verb, rest)) => (verb, rest),
            None => (line, ""),
        };
        let args: Vec<&str> = rest.split(' ').filter(|a| !a.is_empty()).collect();

        match verb {
            "" => Err(ProtocolError::Empty),
            "SPAWN" => {
                let command = rest.trim_matches(' ');
                Ok(Request::Spawn {
                    command: (!command.is_empty()).then(|| command.to_string()),
                })
            }
            "LIST" if args.is_empty() => Ok(Request::List),
            "LIST" => Err(ProtocolError::Usage("LIST")),
            "KILL" => match args.as_slice() {
                [id] => Ok(Request::Kill { id: id.parse()? }),
                _ => Err(ProtocolError::Usage(KILL_USAGE)),
            },
            "ATTACH" => match args.as_slice() {
                [id] => Ok(Request::Attach {
                    id: id.parse()?,
                    size: None,
                }),
                [id, rows, cols] => Ok(Request::Attach {
                    id: id.parse()?,
                    size: Some(WindowSize::parse(ATTACH_USAGE, rows, cols)?),
                }),
                _ => Err(ProtocolError::Usage(ATTACH_USAGE)),
            },
            "RESIZE" => match args.as_slice() {
                [id, rows, cols] => Ok(Request::Resize {
                    id: id.parse()?,
                    size: WindowSize::parse(RESIZE_USAGE, rows, cols)?,
                }),
                _ => Err(ProtocolError::Usage(RESIZE_USAGE)),
            },
            _ => Err(ProtocolError::UnknownCommand(verb.to_string())),
        }
    }
}

/// Renders the request as a single line, without the trailing newline.
impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Spawn { command: None } => write!(f, "SPAWN"),
            Request::Spawn {
                command: Some(command),
            } => write!(f, "SPAWN {}", command),
            Request::List => write!(f, "LIST"),
            Request::Kill { id } => write!(f, "KILL {}", id),
            Request::Attach { id, size: None } => write!(f, "ATTACH {}", id),
            Request::Attach {
                id,
                size: Some(size),
            } => write!(f, "ATTACH {} {} {}", id, size.rows, size.cols),
            Request::Resize { id, size } => {
                write!(f, "RESIZE {} {} {}", id, size.rows, size.cols)
            }
        }
    }
}

/// One line of a daemon reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `OK <id>`: a session was spawned.
    Spawned(SessionId),
    /// `SESSION <id> pid=<pid>`: one entry of a listing.
    Session(SessionEntry),
    /// `DONE`: end of a listing.
    Done,
    /// `OK killing session <id>`.
    Killing(SessionId),
    /// `OK ATTACH`: raw streaming follows.
    Attached,
    /// `OK resized <id>`.
    Resized(SessionId),
    /// `ERROR <message>`.
    Error(String),
}

/// A session as reported by `LIST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub id: SessionId,
    pub pid: u32,
}

impl Reply {
    /// Build an error reply from anything displayable.
    pub fn error(message: impl fmt::Display) -> Self {
        Reply::Error(message.to_string())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Render the reply as a wire line including the newline.
    pub fn to_line(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Spawned(id) => write!(f, "OK {}", id),
            Reply::Session(entry) => write!(f, "SESSION {} pid={}", entry.id, entry.pid),
            Reply::Done => write!(f, "DONE"),
            Reply::Killing(id) => write!(f, "OK killing session {}", id),
            Reply::Attached => write!(f, "OK ATTACH"),
            Reply::Resized(id) => write!(f, "OK resized {}", id),
            Reply::Error(message) => write!(f, "ERROR {}", message),
        }
    }
}

impl FromStr for Reply {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_end_matches(['\r', '\n']);
        let malformed = || ProtocolError::MalformedReply(line.to_string());

        if line == "DONE" {
            return Ok(Reply::Done);
        }
        if line == "OK ATTACH" {
            return Ok(Reply::Attached);
        }
        if let Some(message) = line.strip_prefix("ERROR ") {
            return Ok(Reply::Error(message.to_string()));
        }
        if let Some(id) = line.strip_prefix("OK killing session ") {
            return Ok(Reply::Killing(id.parse()?));
        }
        if let Some(id) = line.strip_prefix("OK resized ") {
            return Ok(Reply::Resized(id.parse()?));
        }
        if let Some(id) = line.strip_prefix("OK ") {
            return Ok(Reply::Spawned(id.parse()?));
        }
        if let Some(rest) = line.strip_prefix("SESSION ") {
            let (id, pid) = rest.split_once(" pid=").ok_or_else(malformed)?;
            let pid = pid.parse().map_err(|_| malformed())?;
            return Ok(Reply::Session(SessionEntry {
                id: id.parse()?,
                pid,
            }));
        }
        Err(malformed())
    }
}

/// How the daemon answers a request line it could not parse.
///
/// An id that does not parse names no session, and a blank line is just
/// another unknown command.
impl From<ProtocolError> for Reply {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidSessionId(_) => Reply::error(NO_SUCH_SESSION),
            ProtocolError::Empty => Reply::error(ProtocolError::UnknownCommand(String::new())),
            other => Reply::error(other),
        }
    }
}
