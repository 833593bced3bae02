//! Session registry: every live PTY session the daemon holds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tether_core::error::SessionError;
use tether_core::protocol::{SessionEntry, SessionId};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::daemon::pty::{session_shell, FdStream, PtySession, TermSize};

/// How many times shutdown polls for exited children.
const SHUTDOWN_REAP_ATTEMPTS: usize = 20;

/// Pause between shutdown polls.
const SHUTDOWN_REAP_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on the whole shutdown drain.
const SHUTDOWN_REAP_DEADLINE: Duration = Duration::from_secs(2);

/// An active PTY session.
pub struct Session {
    pub id: SessionId,
    pub pty: PtySession,
    pub created_at: DateTime<Utc>,
    /// Held by whichever client is currently attached.
    attach_lock: Arc<Mutex<()>>,
}

impl Session {
    fn entry(&self) -> SessionEntry {
        SessionEntry {
            id: self.id,
            pid: self.pty.pid(),
        }
    }
}

/// An exclusive attachment to a session's terminal.
///
/// Dropping it releases the session for the next client. The session
/// itself may be removed while attached; the stream then reports EOF.
pub struct Attachment {
    pub stream: FdStream,
    _permit: OwnedMutexGuard<()>,
}

/// How a reaped child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
    /// Already collected elsewhere (ECHILD).
    Unknown,
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit status {}", code),
            ExitStatus::Signaled(sig) => write!(f, "killed by signal {}", sig),
            ExitStatus::Unknown => write!(f, "status unavailable"),
        }
    }
}

/// Non-blocking check of one child. `None` means still running.
fn try_reap(pid: u32) -> Option<ExitStatus> {
    let mut status: libc::c_int = 0;
    // SAFETY: waitpid with WNOHANG on a pid we spawned; `status` is a valid out pointer.
    let rc = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, libc::WNOHANG) };
    match rc {
        0 => None,
        rc if rc > 0 => {
            if libc::WIFEXITED(status) {
                Some(ExitStatus::Exited(libc::WEXITSTATUS(status)))
            } else if libc::WIFSIGNALED(status) {
                Some(ExitStatus::Signaled(libc::WTERMSIG(status)))
            } else {
                // Stopped/continued notifications are not exits.
                None
            }
        }
        _ => {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                None
            } else {
                debug!("waitpid({}) failed: {}", pid, err);
                Some(ExitStatus::Unknown)
            }
        }
    }
}

fn send_sigkill(pid: u32) -> std::io::Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

struct Registry {
    sessions: HashMap<SessionId, Session>,
    next_id: u64,
}

/// Manages active PTY sessions.
///
/// All state sits behind one async mutex: connection tasks and the reaper
/// run concurrently, and a pid is only signalled or waited on while its
/// session is known to be unreaped.
pub struct SessionManager {
    inner: Mutex<Registry>,
    /// Shell every session runs under.
    shell: String,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    /// A registry whose sessions run under `$SHELL` (or `/bin/sh`).
    pub fn new() -> Self {
        Self::with_shell(session_shell())
    }

    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(Registry {
                sessions: HashMap::new(),
                next_id: 1,
            }),
            shell: shell.into(),
        }
    }

    /// Launch `command` in a new PTY and register it.
    ///
    /// The registry stays locked from fork to insert, so a child that dies
    /// instantly is still registered before the reaper can look for it.
    pub async fn spawn(
        &self,
        command: Option<&str>,
        size: TermSize,
    ) -> Result<SessionId, SessionError> {
        let mut registry = self.inner.lock().await;
        let pty =
            PtySession::spawn(&self.shell, command, size).map_err(SessionError::spawn_failed)?;
        let id = Self::insert_locked(&mut registry, pty);
        info!(
            "Spawned session {} ({})",
            id,
            command.unwrap_or("interactive shell")
        );
        Ok(id)
    }

    /// Register an already-launched PTY under the next id.
    #[cfg(test)]
    pub async fn insert(&self, pty: PtySession) -> SessionId {
        let mut registry = self.inner.lock().await;
        Self::insert_locked(&mut registry, pty)
    }

    fn insert_locked(registry: &mut Registry, pty: PtySession) -> SessionId {
        let id = SessionId(registry.next_id);
        registry.next_id += 1;
        registry.sessions.insert(
            id,
            Session {
                id,
                pty,
                created_at: Utc::now(),
                attach_lock: Arc::new(Mutex::new(())),
            },
        );
        id
    }

    /// Look up a session.
    pub async fn find(&self, id: SessionId) -> Option<SessionEntry> {
        self.inner.lock().await.sessions.get(&id).map(Session::entry)
    }

    /// Remove a session and close its PTY master.
    ///
    /// Removing an unknown id is a no-op; returns whether anything was removed.
    #[cfg(test)]
    pub async fn remove(&self, id: SessionId) -> bool {
        let mut registry = self.inner.lock().await;
        Self::remove_locked(&mut registry, id).is_some()
    }

    fn remove_locked(registry: &mut Registry, id: SessionId) -> Option<Session> {
        registry.sessions.remove(&id)
    }

    /// Snapshot of all sessions, ordered by id.
    pub async fn list(&self) -> Vec<SessionEntry> {
        let registry = self.inner.lock().await;
        let mut entries: Vec<_> = registry.sessions.values().map(Session::entry).collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    #[cfg(test)]
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.sessions.is_empty()
    }

    /// Send SIGKILL to a session's process.
    ///
    /// The session stays listed until the reaper collects the exit.
    pub async fn kill(&self, id: SessionId) -> Result<(), SessionError> {
        let registry = self.inner.lock().await;
        let session = registry
            .sessions
            .get(&id)
            .ok_or(SessionError::NotFound(id))?;
        send_sigkill(session.pty.pid())
            .map_err(|source| SessionError::SignalFailed { id, source })?;
        info!("Sent SIGKILL to session {} (pid {})", id, session.pty.pid());
        Ok(())
    }

    /// Resize a session's terminal.
    pub async fn resize(&self, id: SessionId, size: TermSize) -> Result<(), SessionError> {
        let registry = self.inner.lock().await;
        let session = registry
            .sessions
            .get(&id)
            .ok_or(SessionError::NotFound(id))?;
        session
            .pty
            .resize(size)
            .map_err(|e| SessionError::ResizeFailed {
                id,
                reason: format!("{:#}", e),
            })
    }

    /// Claim a session's terminal for one client.
    ///
    /// Fails with `AlreadyAttached` while another client holds it. The
    /// window size is applied best-effort.
    pub async fn attach(
        &self,
        id: SessionId,
        size: Option<TermSize>,
    ) -> Result<Attachment, SessionError> {
        let registry = self.inner.lock().await;
        let session = registry
            .sessions
            .get(&id)
            .ok_or(SessionError::NotFound(id))?;

        let permit = session
            .attach_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| SessionError::AlreadyAttached(id))?;

        if let Some(size) = size {
            if let Err(e) = session.pty.resize(size) {
                warn!("Session {}: ignoring resize failure on attach: {:#}", id, e);
            }
        }

        let stream = session
            .pty
            .stream()
            .map_err(|e| SessionError::StreamFailed {
                id,
                reason: format!("{:#}", e),
            })?;

        Ok(Attachment {
            stream,
            _permit: permit,
        })
    }

    /// Collect every exited child and drop its session.
    ///
    /// Only registered pids are waited on, so exits of processes this
    /// registry does not own are left alone. Returns how many were removed.
    pub async fn reap(&self) -> usize {
        let mut registry = self.inner.lock().await;
        let exited: Vec<(SessionId, ExitStatus)> = registry
            .sessions
            .values()
            .filter_map(|s| try_reap(s.pty.pid()).map(|status| (s.id, status)))
            .collect();

        for (id, status) in &exited {
            if let Some(session) = Self::remove_locked(&mut registry, *id) {
                let lifetime = Utc::now().signed_duration_since(session.created_at);
                info!(
                    "Session {} (pid {}) ended after {}s: {}",
                    id,
                    session.pty.pid(),
                    lifetime.num_seconds(),
                    status
                );
            }
        }
        exited.len()
    }

    /// Kill every child, close every master, and wait (bounded) for the exits.
    pub async fn shutdown(&self) {
        let sessions: Vec<Session> = {
            let mut registry = self.inner.lock().await;
            registry.sessions.drain().map(|(_, s)| s).collect()
        };
        if sessions.is_empty() {
            return;
        }
        info!("Terminating {} session(s)", sessions.len());

        let mut pending: Vec<u32> = Vec::with_capacity(sessions.len());
        for session in sessions {
            let pid = session.pty.pid();
            if let Err(e) = send_sigkill(pid) {
                debug!("SIGKILL to pid {} failed: {}", pid, e);
            }
            pending.push(pid);
            // Dropping the session closes its master.
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_REAP_DEADLINE;
        for _ in 0..SHUTDOWN_REAP_ATTEMPTS {
            pending.retain(|&pid| try_reap(pid).is_none());
            if pending.is_empty() || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(SHUTDOWN_REAP_INTERVAL).await;
        }

        if pending.is_empty() {
            debug!("All session processes reaped");
        } else {
            warn!(
                "{} session process(es) not reaped before exit: {:?}",
                pending.len(),
                pending
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::pty::tests::read_until_contains;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    /// Poll `reap` until `id` is gone or the limit passes.
    async fn reap_until_gone(manager: &SessionManager, id: SessionId) -> bool {
        timeout(Duration::from_secs(5), async {
            loop {
                manager.reap().await;
                if manager.find(id).await.is_none() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .is_ok()
    }

    #[tokio::test]
    async fn test_spawn_and_find() {
        let manager = SessionManager::new();
        let id = manager
            .spawn(Some("sleep 30"), TermSize::default())
            .await
            .expect("spawn");

        let entry = manager.find(id).await.expect("session registered");
        assert_eq!(entry.id, id);
        assert!(entry.pid > 0);

        manager.shutdown().await;
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn test_ids_increase_and_are_never_reused() {
        let manager = SessionManager::new();
        let first = manager.spawn(Some("sleep 30"), TermSize::default()).await.unwrap();
        let second = manager.spawn(Some("sleep 30"), TermSize::default()).await.unwrap();
        assert!(second > first);

        manager.kill(second).await.unwrap();
        assert!(reap_until_gone(&manager, second).await);

        let third = manager.spawn(Some("sleep 30"), TermSize::default()).await.unwrap();
        assert!(third > second);

        let ids: Vec<_> = manager.list().await.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![first, third]);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_kill_unknown_session_leaves_registry_alone() {
        let manager = SessionManager::new();
        let id = manager.spawn(Some("sleep 30"), TermSize::default()).await.unwrap();

        let result = manager.kill(SessionId(999)).await;
        assert!(matches!(result, Err(SessionError::NotFound(SessionId(999)))));
        assert_eq!(manager.len().await, 1);
        assert!(manager.find(id).await.is_some());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_kill_is_reconciled_by_reap() {
        let manager = SessionManager::new();
        let id = manager.spawn(Some("sleep 30"), TermSize::default()).await.unwrap();

        manager.kill(id).await.unwrap();
        // Still listed until the exit is collected.
        assert!(manager.find(id).await.is_some());
        assert!(reap_until_gone(&manager, id).await);
    }

    #[tokio::test]
    async fn test_natural_exit_is_reaped() {
        let manager = SessionManager::new();
        let id = manager.spawn(Some("true"), TermSize::default()).await.unwrap();
        assert!(reap_until_gone(&manager, id).await);
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_command_exits_127() {
        let session = PtySession::spawn(
            "/bin/sh",
            Some("definitely-not-a-real-command-tether"),
            TermSize::default(),
        )
        .expect("shell itself starts");
        let pid = session.pid();

        let status = timeout(Duration::from_secs(5), async {
            loop {
                if let Some(status) = try_reap(pid) {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("child exits");
        assert_eq!(status, ExitStatus::Exited(127));
    }

    #[tokio::test]
    async fn test_spawn_with_missing_shell_registers_nothing() {
        let manager = SessionManager::with_shell("/no/such/shell");

        let result = manager.spawn(Some("true"), TermSize::default()).await;
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let manager = SessionManager::new();
        let pty = PtySession::spawn("/bin/sh", Some("sleep 30"), TermSize::default()).unwrap();
        let pid = pty.pid();
        let id = manager.insert(pty).await;

        assert!(manager.remove(id).await);
        assert!(!manager.remove(id).await);
        assert!(!manager.remove(SessionId(12345)).await);

        send_sigkill(pid).unwrap();
        let _ = timeout(Duration::from_secs(5), async {
            while try_reap(pid).is_none() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
    }

    #[tokio::test]
    async fn test_attach_is_exclusive() {
        let manager = SessionManager::new();
        let id = manager.spawn(Some("cat"), TermSize::default()).await.unwrap();

        let first = manager.attach(id, None).await.expect("first attach");
        let second = manager.attach(id, None).await;
        assert!(matches!(second, Err(SessionError::AlreadyAttached(_))));

        drop(first);
        let mut again = manager.attach(id, None).await.expect("re-attach after release");
        again.stream.write_all(b"still here\n").await.unwrap();
        let output =
            read_until_contains(&mut again.stream, "still here", Duration::from_secs(5)).await;
        assert!(output.contains("still here"));

        drop(again);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_attach_and_resize_unknown_session() {
        let manager = SessionManager::new();
        assert!(matches!(
            manager.attach(SessionId(1), None).await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            manager.resize(SessionId(1), TermSize::default()).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_kills_and_reaps_everything() {
        let manager = SessionManager::new();
        let mut pids = Vec::new();
        for _ in 0..3 {
            let id = manager.spawn(Some("sleep 30"), TermSize::default()).await.unwrap();
            pids.push(manager.find(id).await.unwrap().pid);
        }

        manager.shutdown().await;

        assert!(manager.is_empty().await);
        for pid in pids {
            // SAFETY: signal 0 only checks for existence.
            let alive = unsafe { libc::kill(pid as libc::pid_t, 0) } == 0;
            assert!(!alive, "pid {} survived shutdown", pid);
        }
    }
}
