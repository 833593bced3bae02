//! Client for connecting to the daemon process.

use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tether_core::forward::{forward, ForwardOutcome};
use tether_core::protocol::{Reply, Request, SessionId, WindowSize, DETACH_BYTE};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::daemon::paths;
use crate::daemon::pty::FdStream;
use crate::daemon::terminal::{self, RawModeGuard};

/// Connection attempts before giving up.
const CONNECT_ATTEMPTS: u32 = 5;

/// Interval between socket connection attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// How long to wait for a reply line.
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// How an `attach` ended.
#[derive(Debug)]
pub enum AttachOutcome {
    /// The daemon answered with an error; the terminal was never touched.
    Refused(Reply),
    /// Forwarding ran and stopped.
    Ended(ForwardOutcome),
}

/// Client for communicating with the daemon.
pub struct DaemonClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    socket_path: PathBuf,
}

impl DaemonClient {
    fn new(stream: UnixStream, socket_path: PathBuf) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
            socket_path,
        }
    }

    /// Connect to the daemon, starting it if necessary.
    pub async fn connect() -> Result<Self> {
        let socket_path = paths::get_socket_path();
        let stream = connect_with_retry(&socket_path, start_daemon).await?;
        Ok(Self::new(stream, socket_path))
    }

    /// Connect to a daemon that must already be running.
    pub async fn connect_to(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("Failed to connect to {:?}", socket_path))?;
        Ok(Self::new(stream, socket_path.to_path_buf()))
    }

    async fn send(&mut self, request: &Request) -> Result<()> {
        debug!("Sending: {}", request);
        self.writer
            .write_all(format!("{}\n", request).as_bytes())
            .await
            .context("Failed to write request")?;
        self.writer.flush().await.context("Failed to flush")
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let mut line = String::new();
        let bytes_read = timeout(REPLY_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .context("Request timed out")?
            .context("Failed to read reply")?;

        if bytes_read == 0 {
            bail!("Daemon closed connection unexpectedly");
        }

        debug!("Received: {}", line.trim_end());
        line.parse().context("Failed to parse reply")
    }

    /// Send a request and collect its reply lines.
    ///
    /// `SESSION` lines are followed by more; any other reply ends the
    /// conversation.
    pub async fn request(mut self, request: &Request) -> Result<Vec<Reply>> {
        self.send(request).await?;

        let mut replies = Vec::new();
        loop {
            let reply = self.read_reply().await?;
            let more = matches!(reply, Reply::Session(_));
            replies.push(reply);
            if !more {
                return Ok(replies);
            }
        }
    }

    /// Attach the calling terminal to session `id` until detach or hang-up.
    ///
    /// Raw mode is entered only after `OK ATTACH` and is restored on every
    /// path out of here.
    pub async fn attach(mut self, id: SessionId) -> Result<AttachOutcome> {
        let stdin = std::io::stdin();
        let stdout = std::io::stdout();

        let size = terminal::window_size(stdout.as_fd())
            .or_else(|| terminal::window_size(stdin.as_fd()));
        self.send(&Request::Attach { id, size }).await?;

        match self.read_reply().await? {
            Reply::Attached => {}
            reply @ Reply::Error(_) => return Ok(AttachOutcome::Refused(reply)),
            other => bail!("Unexpected reply to ATTACH: {}", other),
        }

        let _raw_mode = if terminal::is_terminal(stdin.as_fd()) {
            Some(RawModeGuard::enter(stdin.as_fd()).context("Failed to enter raw mode")?)
        } else {
            None
        };

        let mut local_in = FdStream::dup(stdin.as_fd()).context("Failed to watch stdin")?;
        let mut local_out = FdStream::dup(stdout.as_fd()).context("Failed to watch stdout")?;

        let resizer = spawn_resize_watcher(self.socket_path.clone(), id);

        let outcome = forward(
            &mut local_in,
            &mut local_out,
            &mut self.reader,
            &mut self.writer,
            DETACH_BYTE,
        )
        .await;

        if let Some(resizer) = resizer {
            resizer.abort();
        }
        Ok(AttachOutcome::Ended(outcome))
    }
}

/// Forward terminal size changes to the daemon over side connections.
fn spawn_resize_watcher(socket_path: PathBuf, id: SessionId) -> Option<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut winch = match signal(SignalKind::window_change()) {
        Ok(winch) => winch,
        Err(e) => {
            warn!("Failed to watch window size changes: {}", e);
            return None;
        }
    };

    Some(tokio::spawn(async move {
        while winch.recv().await.is_some() {
            let Some(size) = terminal::window_size(std::io::stdout().as_fd()) else {
                continue;
            };
            if let Err(e) = send_resize(&socket_path, id, size).await {
                debug!("Resize of session {} failed: {:#}", id, e);
            }
        }
    }))
}

async fn send_resize(socket_path: &Path, id: SessionId, size: WindowSize) -> Result<()> {
    let replies = DaemonClient::connect_to(socket_path)
        .await?
        .request(&Request::Resize { id, size })
        .await?;
    match replies.first() {
        Some(Reply::Resized(_)) => Ok(()),
        Some(other) => bail!("{}", other),
        None => bail!("No reply to RESIZE"),
    }
}

/// Try to connect, launching the daemon after the first failure.
///
/// The launcher runs at most once. If the launched process exits before a
/// connection succeeds, this fails right away with its exit status.
async fn connect_with_retry<F>(socket_path: &Path, mut launch: F) -> Result<UnixStream>
where
    F: FnMut() -> Result<Child>,
{
    let mut child: Option<Child> = None;
    let mut last_error = std::io::Error::from(std::io::ErrorKind::NotFound);

    for attempt in 1..=CONNECT_ATTEMPTS {
        match UnixStream::connect(socket_path).await {
            Ok(stream) => {
                debug!("Connected to daemon on attempt {}", attempt);
                return Ok(stream);
            }
            Err(e) => {
                debug!("Connect attempt {} failed: {}", attempt, e);
                last_error = e;
            }
        }

        match child.as_mut() {
            None => {
                info!("Daemon not running, starting...");
                child = Some(launch()?);
            }
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => {
                    bail!(
                        "Daemon exited immediately with status: {} (see {:?})",
                        status,
                        paths::get_log_path()
                    );
                }
                Ok(None) => {}
                Err(e) => debug!("Error checking daemon status: {}", e),
            },
        }

        if attempt < CONNECT_ATTEMPTS {
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    Err(anyhow::Error::new(last_error).context(format!(
        "Could not connect to daemon at {:?} after {} attempts",
        socket_path, CONNECT_ATTEMPTS
    )))
}

/// Start the daemon as a background process.
///
/// The daemon runs in its own session so it outlives the terminal that
/// started it; its stderr is appended to the log file.
fn start_daemon() -> Result<Child> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe().context("Failed to get current executable path")?;

    paths::ensure_socket_dir().context("Failed to create socket directory")?;
    let log_path = paths::get_log_path();
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {:?}", log_path))?;

    let mut command = std::process::Command::new(exe);
    command
        .arg("daemon")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(log));

    // SAFETY: setsid is async-signal-safe and touches no parent state.
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    command.spawn().context("Failed to spawn daemon process")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::DaemonServer;
    use std::sync::Arc;

    async fn start_server(dir: &Path) -> (Arc<DaemonServer>, tokio::task::JoinHandle<()>, PathBuf) {
        let socket_path = dir.join("tether.sock");
        let server = Arc::new(
            DaemonServer::bind_to(socket_path.clone(), dir.join("tether.pid"))
                .await
                .expect("Failed to bind server"),
        );
        let runner = server.clone();
        let handle = tokio::spawn(async move {
            let _ = runner.run().await;
        });
        (server, handle, socket_path)
    }

    #[tokio::test]
    async fn test_running_daemon_is_not_relaunched() {
        let dir = tempfile::tempdir().unwrap();
        let (server, handle, socket_path) = start_server(dir.path()).await;

        let mut launches = 0;
        let stream = connect_with_retry(&socket_path, || {
            launches += 1;
            bail!("should not launch")
        })
        .await;
        assert!(stream.is_ok());
        assert_eq!(launches, 0);

        handle.abort();
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_exhaustion_launches_once() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("missing.sock");

        let mut launches = 0;
        let result = connect_with_retry(&socket_path, || {
            launches += 1;
            // Stays alive without ever listening.
            Ok(std::process::Command::new("sleep").arg("2").spawn()?)
        })
        .await;

        assert!(result.is_err());
        assert_eq!(launches, 1);
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("after 5 attempts"), "{}", message);
    }

    #[tokio::test]
    async fn test_launched_daemon_crash_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("missing.sock");

        let started = std::time::Instant::now();
        let result = connect_with_retry(&socket_path, || {
            Ok(std::process::Command::new("false").spawn()?)
        })
        .await;

        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("exited immediately"), "{}", message);
        assert!(started.elapsed() < Duration::from_millis(4 * 200));
    }

    #[tokio::test]
    async fn test_launch_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("missing.sock");

        let result = connect_with_retry(&socket_path, || bail!("no executable")).await;
        assert_eq!(result.unwrap_err().to_string(), "no executable");
    }

    #[tokio::test]
    async fn test_request_collects_listing() {
        let dir = tempfile::tempdir().unwrap();
        let (server, handle, socket_path) = start_server(dir.path()).await;

        let spawned = DaemonClient::connect_to(&socket_path)
            .await
            .unwrap()
            .request(&Request::Spawn {
                command: Some("sleep 30".to_string()),
            })
            .await
            .unwrap();
        let Some(Reply::Spawned(id)) = spawned.first().cloned() else {
            panic!("unexpected spawn reply {:?}", spawned);
        };

        let listing = DaemonClient::connect_to(&socket_path)
            .await
            .unwrap()
            .request(&Request::List)
            .await
            .unwrap();
        assert_eq!(listing.len(), 2);
        assert!(matches!(&listing[0], Reply::Session(entry) if entry.id == id));
        assert_eq!(listing[1], Reply::Done);

        handle.abort();
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_error_reply_is_returned_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let (server, handle, socket_path) = start_server(dir.path()).await;

        let replies = DaemonClient::connect_to(&socket_path)
            .await
            .unwrap()
            .request(&Request::Kill { id: SessionId(42) })
            .await
            .unwrap();
        assert_eq!(replies, vec![Reply::Error("no such session".to_string())]);

        handle.abort();
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_attach_to_unknown_session_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (server, handle, socket_path) = start_server(dir.path()).await;

        let outcome = DaemonClient::connect_to(&socket_path)
            .await
            .unwrap()
            .attach(SessionId(7))
            .await
            .unwrap();
        match outcome {
            AttachOutcome::Refused(reply) => assert_eq!(reply.to_string(), "ERROR no such session"),
            other => panic!("expected refusal, got {:?}", other),
        }

        handle.abort();
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_resize_over_side_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (server, handle, socket_path) = start_server(dir.path()).await;

        let id = server
            .sessions()
            .spawn(Some("sleep 30"), Default::default())
            .await
            .unwrap();
        send_resize(&socket_path, id, WindowSize { rows: 50, cols: 120 })
            .await
            .unwrap();
        assert!(send_resize(&socket_path, SessionId(99), WindowSize { rows: 1, cols: 1 })
            .await
            .is_err());

        handle.abort();
        server.shutdown().await;
    }
}
