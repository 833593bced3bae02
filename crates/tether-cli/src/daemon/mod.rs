//! Daemon process holding shells in PTY sessions, and the client that talks to it.

pub mod cgroup;
pub mod client;
pub mod paths;
pub mod pty;
pub mod reaper;
pub mod server;
pub mod session;
pub mod terminal;

// Public API - used by main.rs
pub use client::{AttachOutcome, DaemonClient};
pub use server::DaemonServer;
