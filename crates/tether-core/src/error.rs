//! Error types shared by the daemon and its clients.
//!
//! The `Display` text of both enums is what travels after `ERROR ` on the
//! wire, so it is kept short and stable.

use thiserror::Error;

use crate::protocol::SessionId;

/// Reply text for any id that names no live session.
pub const NO_SUCH_SESSION: &str = "no such session";

/// A request or reply line that could not be understood.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty request")]
    Empty,

    #[error("unknown command")]
    UnknownCommand(String),

    #[error("invalid session id '{0}'")]
    InvalidSessionId(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("request too long (limit {0} bytes)")]
    TooLong(usize),

    #[error("malformed reply '{0}'")]
    MalformedReply(String),
}

/// A session operation the daemon could not carry out.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no such session")]
    NotFound(SessionId),

    #[error("session {0} is already attached")]
    AlreadyAttached(SessionId),

    #[error("failed to spawn: {0}")]
    SpawnFailed(String),

    #[error("failed to signal session {id}: {source}")]
    SignalFailed {
        id: SessionId,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to resize session {id}: {reason}")]
    ResizeFailed { id: SessionId, reason: String },

    #[error("failed to open session {id}: {reason}")]
    StreamFailed { id: SessionId, reason: String },
}

impl SessionError {
    pub fn spawn_failed(reason: impl std::fmt::Display) -> Self {
        SessionError::SpawnFailed(format!("{:#}", reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message_is_stable() {
        // Clients match on this exact text.
        assert_eq!(
            SessionError::NotFound(SessionId(9)).to_string(),
            "no such session"
        );
        assert_eq!(SessionError::NotFound(SessionId(1)).to_string(), NO_SUCH_SESSION);
    }

    #[test]
    fn test_unknown_command_hides_the_verb() {
        let err = ProtocolError::UnknownCommand("FROB".to_string());
        assert_eq!(err.to_string(), "unknown command");
    }

    #[test]
    fn test_already_attached_names_the_session() {
        assert_eq!(
            SessionError::AlreadyAttached(SessionId(4)).to_string(),
            "session 4 is already attached"
        );
    }

    #[test]
    fn test_spawn_failed_flattens_context_chain() {
        let err = SessionError::spawn_failed("No such file or directory");
        assert_eq!(
            err.to_string(),
            "failed to spawn: No such file or directory"
        );
    }
}
