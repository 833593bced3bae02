//! Core types and logic for tether.
//!
//! This crate holds everything the daemon and its clients must agree on,
//! with no knowledge of PTYs or process management.
//!
//! # Modules
//!
//! - [`protocol`]: the one-request-per-connection line protocol
//! - [`error`]: protocol and session error types, whose messages go on the wire
//! - [`forward`]: the bidirectional byte pump used while attached
//!
//! # Wire format
//!
//! | Request | Reply |
//! |---------|-------|
//! | `SPAWN [cmd...]` | `OK <id>` or `ERROR <message>` |
//! | `LIST` | `SESSION <id> pid=<pid>` lines, then `DONE` |
//! | `KILL <id>` | `OK killing session <id>` or `ERROR no such session` |
//! | `ATTACH <id> [<rows> <cols>]` | `OK ATTACH`, then raw bytes both ways |
//! | `RESIZE <id> <rows> <cols>` | `OK resized <id>` or `ERROR <message>` |

pub mod error;
pub mod forward;
pub mod protocol;
