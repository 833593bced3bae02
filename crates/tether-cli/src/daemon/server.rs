//! Unix socket server for the daemon process.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tether_core::error::ProtocolError;
use tether_core::forward::{forward, ForwardOutcome};
use tether_core::protocol::{Reply, Request, SessionId, WindowSize, DETACH_BYTE, MAX_REQUEST_LEN};
use tokio::io::{AsyncBufRead, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::daemon::paths;
use crate::daemon::pty::TermSize;
use crate::daemon::reaper::Reaper;
use crate::daemon::session::SessionManager;

/// Maximum number of concurrent client connections to prevent resource exhaustion.
const MAX_CONNECTIONS: usize = 100;

/// How long a client may take to send its request line.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A partial request line followed by this much silence counts as complete.
const REQUEST_IDLE_TIMEOUT: Duration = Duration::from_millis(250);

/// The daemon server that listens for client connections.
pub struct DaemonServer {
    listener: UnixListener,
    socket_path: PathBuf,
    pid_path: PathBuf,
    sessions: Arc<SessionManager>,
    /// Semaphore to limit concurrent connections and prevent resource exhaustion.
    connection_semaphore: Arc<Semaphore>,
    reaper: JoinHandle<()>,
}

impl DaemonServer {
    /// Create a new daemon server bound to the default socket path.
    pub async fn bind() -> Result<Self> {
        paths::ensure_socket_dir().context("Failed to create socket directory")?;
        Self::bind_to(paths::get_socket_path(), paths::get_pid_path()).await
    }

    /// Create a new daemon server bound to a specific socket path.
    ///
    /// Uses a bind-first approach to avoid TOCTOU race conditions:
    /// 1. Try to bind directly
    /// 2. If the address is in use and something answers on it, or the PID
    ///    file names a live process, refuse to start
    /// 3. Otherwise remove the stale socket and retry
    ///
    /// The reaper's SIGCHLD stream is registered before this returns.
    pub async fn bind_to(socket_path: PathBuf, pid_path: PathBuf) -> Result<Self> {
        Self::bind_with_sessions(socket_path, pid_path, SessionManager::new()).await
    }

    /// Like [`DaemonServer::bind_to`], serving an existing session manager.
    pub async fn bind_with_sessions(
        socket_path: PathBuf,
        pid_path: PathBuf,
        sessions: SessionManager,
    ) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create socket directory for {:?}", socket_path)
            })?;
        }

        let reaper = Reaper::install()?;

        let listener = match UnixListener::bind(&socket_path) {
            Ok(l) => l,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                if std::os::unix::net::UnixStream::connect(&socket_path).is_ok() {
                    anyhow::bail!("Daemon already running (socket {:?} accepts connections)", socket_path);
                }
                if is_daemon_alive(&pid_path) {
                    anyhow::bail!(
                        "Daemon already running (socket {:?} in use, PID file valid)",
                        socket_path
                    );
                }
                remove_stale_socket(&socket_path)?;
                UnixListener::bind(&socket_path)
                    .with_context(|| format!("Failed to bind to socket: {:?}", socket_path))?
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to bind to socket: {:?}", socket_path));
            }
        };

        // Write the PID right after bind so a concurrent starter never sees
        // our socket without a live PID behind it.
        write_pid_file(&pid_path)
            .with_context(|| format!("Failed to write PID file: {:?}", pid_path))?;

        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("Failed to restrict socket {:?}", socket_path))?;
        }

        info!("Daemon listening on {:?}", socket_path);

        let sessions = Arc::new(sessions);
        let reaper = reaper.spawn(&sessions);

        Ok(Self {
            listener,
            socket_path,
            pid_path,
            sessions,
            connection_semaphore: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
            reaper,
        })
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Accept connections forever, serving each on its own task.
    ///
    /// Dropping the returned future aborts every in-flight connection,
    /// including attached clients.
    pub async fn run(&self) -> Result<()> {
        let mut connection_tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            // The permit is held for the lifetime of the connection handler.
                            let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    warn!(
                                        "Connection limit ({}) reached, rejecting new connection",
                                        MAX_CONNECTIONS
                                    );
                                    drop(stream);
                                    continue;
                                }
                            };

                            debug!("Accepted new connection");
                            let sessions = self.sessions.clone();
                            connection_tasks.spawn(async move {
                                let _permit = permit;
                                if let Err(e) = handle_connection(stream, sessions).await {
                                    debug!("Connection ended with error: {:#}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                // Reap completed connection tasks to prevent unbounded growth
                Some(_) = connection_tasks.join_next(), if !connection_tasks.is_empty() => {}
            }
        }
    }

    /// Serve until `shutdown` resolves, then tear everything down.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let result = tokio::select! {
            result = self.run() => result,
            _ = shutdown => Ok(()),
        };
        self.shutdown().await;
        result
    }

    /// Stop reaping, then kill and collect every session.
    ///
    /// The socket and PID files go away when the server is dropped.
    pub async fn shutdown(&self) {
        info!("Shutting down with {} session(s)", self.sessions.len().await);
        self.reaper.abort();
        self.sessions.shutdown().await;
    }
}

impl Drop for DaemonServer {
    fn drop(&mut self) {
        self.reaper.abort();
        if self.socket_path.exists() && std::fs::remove_file(&self.socket_path).is_err() {
            warn!("Failed to remove socket on shutdown");
        }
        if self.pid_path.exists() && std::fs::remove_file(&self.pid_path).is_err() {
            warn!("Failed to remove PID file on shutdown");
        }
    }
}

/// Write our PID, owner-only, replacing any previous file.
fn write_pid_file(pid_path: &Path) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(pid_path)?;
    // A pre-existing file keeps its old mode through open().
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.write_all(std::process::id().to_string().as_bytes())
}

/// Remove a leftover socket from a dead daemon, refusing anything that is
/// not a plain socket file.
fn remove_stale_socket(socket_path: &Path) -> Result<()> {
    use std::os::unix::fs::FileTypeExt;

    // Don't follow symlinks (could delete unintended files)
    let metadata = std::fs::symlink_metadata(socket_path)
        .with_context(|| format!("Failed to stat socket path: {:?}", socket_path))?;

    if metadata.file_type().is_symlink() {
        anyhow::bail!(
            "Socket path {:?} is a symlink, refusing to delete for safety",
            socket_path
        );
    }
    if !metadata.file_type().is_socket() {
        anyhow::bail!(
            "Path {:?} exists but is not a socket file (type: {:?})",
            socket_path,
            metadata.file_type()
        );
    }

    info!("Removing stale socket from dead daemon");
    std::fs::remove_file(socket_path)
        .with_context(|| format!("Failed to remove stale socket: {:?}", socket_path))
}

/// Check if a daemon process is still alive by reading its PID file.
fn is_daemon_alive(pid_path: &Path) -> bool {
    let Ok(pid_str) = std::fs::read_to_string(pid_path) else {
        return false;
    };
    let Ok(pid) = pid_str.trim().parse::<i32>() else {
        return false;
    };
    if pid <= 0 || pid as u32 == std::process::id() {
        return false;
    }

    // SAFETY: signal 0 performs only the existence and permission check.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Read one request line, bounded by `max_size`.
///
/// The line ends at a newline, at EOF, or once the client goes quiet for
/// `idle` after sending part of a line. Returns `None` if the client
/// closed without sending anything. Bytes after the newline stay buffered
/// in `reader`.
async fn read_request<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max_size: usize,
    idle: Duration,
) -> Result<Option<String>> {
    use tokio::io::AsyncBufReadExt;

    let mut bytes = Vec::new();

    loop {
        let available = if bytes.is_empty() {
            reader.fill_buf().await
        } else {
            match tokio::time::timeout(idle, reader.fill_buf()).await {
                Ok(result) => result,
                Err(_) => break,
            }
        }
        .context("Failed to read from client")?;

        if available.is_empty() {
            break;
        }

        let newline_pos = available.iter().position(|&b| b == b'\n');
        let bytes_to_consume = newline_pos.map(|p| p + 1).unwrap_or(available.len());

        if bytes.len() + bytes_to_consume > max_size {
            return Err(ProtocolError::TooLong(max_size).into());
        }

        bytes.extend_from_slice(&available[..bytes_to_consume]);
        reader.consume(bytes_to_consume);

        if newline_pos.is_some() {
            break;
        }
    }

    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

async fn write_reply(writer: &mut OwnedWriteHalf, reply: &Reply) -> Result<()> {
    writer
        .write_all(reply.to_line().as_bytes())
        .await
        .context("Failed to write reply")?;
    writer.flush().await.context("Failed to flush")
}

/// Serve one connection: read a request, answer it, and for `ATTACH`
/// stream the session until the client detaches or either side closes.
async fn handle_connection(stream: UnixStream, sessions: Arc<SessionManager>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let read = tokio::time::timeout(
        REQUEST_TIMEOUT,
        read_request(&mut reader, MAX_REQUEST_LEN, REQUEST_IDLE_TIMEOUT),
    )
    .await
    .context("Timed out waiting for request")?;

    let line = match read {
        Ok(Some(line)) => line,
        Ok(None) => {
            debug!("Client disconnected without a request");
            return Ok(());
        }
        Err(e) => {
            if let Some(protocol_err) = e.downcast_ref::<ProtocolError>() {
                let _ = write_reply(&mut writer, &Reply::from(protocol_err.clone())).await;
            }
            return Err(e);
        }
    };

    debug!("Received: {}", line.trim_end());

    let request = match line.parse::<Request>() {
        Ok(request) => request,
        Err(e) => {
            debug!("Rejected request: {}", e);
            return write_reply(&mut writer, &Reply::from(e)).await;
        }
    };

    match request {
        Request::Spawn { command } => {
            let reply = handle_spawn(&sessions, command.as_deref()).await;
            write_reply(&mut writer, &reply).await
        }
        Request::List => handle_list(&mut writer, &sessions).await,
        Request::Kill { id } => {
            let reply = match sessions.kill(id).await {
                Ok(()) => Reply::Killing(id),
                Err(e) => Reply::error(e),
            };
            write_reply(&mut writer, &reply).await
        }
        Request::Resize { id, size } => {
            let reply = match sessions.resize(id, size.into()).await {
                Ok(()) => Reply::Resized(id),
                Err(e) => Reply::error(e),
            };
            write_reply(&mut writer, &reply).await
        }
        Request::Attach { id, size } => handle_attach(reader, writer, &sessions, id, size).await,
    }
}

async fn handle_spawn(sessions: &SessionManager, command: Option<&str>) -> Reply {
    match sessions.spawn(command, TermSize::default()).await {
        Ok(id) => Reply::Spawned(id),
        Err(e) => {
            warn!("Spawn failed: {}", e);
            Reply::error(e)
        }
    }
}

async fn handle_list(writer: &mut OwnedWriteHalf, sessions: &SessionManager) -> Result<()> {
    let mut out = String::new();
    for entry in sessions.list().await {
        out.push_str(&Reply::Session(entry).to_line());
    }
    out.push_str(&Reply::Done.to_line());

    writer
        .write_all(out.as_bytes())
        .await
        .context("Failed to write session list")?;
    writer.flush().await.context("Failed to flush")
}

/// Hand the connection to the forwarder for the duration of the attachment.
///
/// Anything the client sent right after the request line is still in
/// `reader`'s buffer and reaches the PTY first.
async fn handle_attach(
    mut reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    sessions: &SessionManager,
    id: SessionId,
    size: Option<WindowSize>,
) -> Result<()> {
    let mut attachment = match sessions.attach(id, size.map(TermSize::from)).await {
        Ok(attachment) => attachment,
        Err(e) => {
            debug!("Attach to session {} refused: {}", id, e);
            return write_reply(&mut writer, &Reply::error(e)).await;
        }
    };

    write_reply(&mut writer, &Reply::Attached).await?;
    info!("Client attached to session {}", id);

    let (mut pty_rx, mut pty_tx) = tokio::io::split(&mut attachment.stream);
    let outcome = forward(&mut reader, &mut writer, &mut pty_rx, &mut pty_tx, DETACH_BYTE).await;

    match outcome {
        ForwardOutcome::Detached => info!("Client detached from session {}", id),
        ForwardOutcome::Closed => info!("Attachment to session {} closed", id),
    }
    Ok(())
}
