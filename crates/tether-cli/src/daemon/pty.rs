//! PTY allocation and async descriptor I/O.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use anyhow::{bail, Context as _, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tether_core::protocol::WindowSize;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// Shell used when `$SHELL` is unset or empty.
const DEFAULT_SHELL: &str = "/bin/sh";

/// Runs first in every session: ignore hang-up, then become the real
/// shell (`$0`) with its arguments. portable-pty resets SIGHUP to the
/// default just before exec, so the disposition has to be set from inside
/// the child.
const HUP_IGNORING_LAUNCHER: &str = "trap '' HUP; exec \"$0\" \"$@\"";

/// Terminal size in columns and rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl From<TermSize> for PtySize {
    fn from(size: TermSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl From<WindowSize> for TermSize {
    fn from(size: WindowSize) -> Self {
        Self {
            cols: size.cols,
            rows: size.rows,
        }
    }
}

/// The shell sessions run under: `$SHELL`, or `/bin/sh`.
pub fn session_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_SHELL.to_string())
}

/// A shell running on the slave side of a PTY whose master we own.
///
/// The child leads its own session with the slave as controlling terminal.
/// Dropping a `PtySession` closes the master; it does not signal or reap
/// the child, which is the session manager's job.
pub struct PtySession {
    master: Box<dyn MasterPty + Send>,
    // Kept so the std handle outlives the session; reaping goes through
    // waitpid on `pid`.
    _child: Box<dyn Child + Send + Sync>,
    pid: u32,
}

impl PtySession {
    /// Spawn `command` through `shell` in a new PTY, with SIGHUP ignored.
    ///
    /// With no command, the shell itself is started interactively. A
    /// command the shell cannot find makes the child exit with status 127
    /// later on; only a shell that cannot be executed fails here.
    pub fn spawn(shell: &str, command: Option<&str>, size: TermSize) -> Result<Self> {
        let shell_path = resolve_shell(shell)?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(size.into())
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(DEFAULT_SHELL);
        cmd.arg("-c");
        cmd.arg(HUP_IGNORING_LAUNCHER);
        cmd.arg(&shell_path);
        if let Some(command) = command {
            cmd.arg("-c");
            cmd.arg(command);
        }
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn {}", shell_path.display()))?;
        // The parent's copy of the slave must go, or the master never sees
        // hang-up when the child exits.
        drop(pair.slave);

        let pid = child
            .process_id()
            .context("Spawned child has no process id")?;

        debug!("Spawned pid {} in PTY ({}x{})", pid, size.cols, size.rows);

        Ok(Self {
            master: pair.master,
            _child: child,
            pid,
        })
    }

    /// Process id of the shell.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Resize the PTY; the kernel delivers SIGWINCH to the foreground job.
    pub fn resize(&self, size: TermSize) -> Result<()> {
        self.master
            .resize(size.into())
            .context("Failed to resize PTY")
    }

    /// Open an async stream over a duplicate of the master descriptor.
    ///
    /// The master itself stays owned by this session, so the stream can be
    /// dropped (on detach) without closing the PTY.
    pub fn stream(&self) -> Result<FdStream> {
        let raw: RawFd = self
            .master
            .as_raw_fd()
            .context("PTY master has no file descriptor")?;
        // SAFETY: `raw` belongs to `self.master`, which outlives this borrow.
        let master = unsafe { BorrowedFd::borrow_raw(raw) };
        let fd = master
            .try_clone_to_owned()
            .context("Failed to duplicate PTY master")?;
        FdStream::new(fd).context("Failed to register PTY master")
    }
}

/// Locate `shell` the way exec would: as given when it contains a slash,
/// otherwise on `$PATH`. Only executable regular files qualify.
fn resolve_shell(shell: &str) -> Result<PathBuf> {
    fn is_executable(path: &Path) -> bool {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }

    if shell.contains('/') {
        let path = PathBuf::from(shell);
        if !is_executable(&path) {
            bail!("shell {} is not an executable file", shell);
        }
        return Ok(path);
    }

    let search_path = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&search_path)
        .map(|dir| dir.join(shell))
        .find(|candidate| is_executable(candidate))
        .with_context(|| format!("shell {} not found on PATH", shell))
}

/// Readiness-driven `AsyncRead + AsyncWrite` over an owned descriptor.
///
/// The descriptor is switched to non-blocking mode; its original status
/// flags are put back on drop. Because duplicated descriptors share those
/// flags, this matters for stdin/stdout, which belong to the user's shell.
pub struct FdStream {
    inner: AsyncFd<File>,
    original_flags: libc::c_int,
}

impl FdStream {
    /// Take ownership of `fd` and register it with the tokio reactor.
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        // Register first: if the reactor refuses the descriptor (regular
        // files), its flags are still untouched.
        // SAFETY: the File owns `fd` and keeps that same descriptor open
        // until the AsyncFd, which owns the File, is dropped.
        let inner = unsafe { AsyncFd::register(File::from(fd)) }?;
        let original_flags = set_nonblocking(inner.get_ref().as_fd())?;
        Ok(Self {
            inner,
            original_flags,
        })
    }

    /// Duplicate a descriptor we do not own (stdin, stdout) into a stream.
    pub fn dup(fd: BorrowedFd<'_>) -> io::Result<Self> {
        Self::new(fd.try_clone_to_owned()?)
    }

    pub fn get_ref(&self) -> &File {
        self.inner.get_ref()
    }
}

impl Drop for FdStream {
    fn drop(&mut self) {
        // SAFETY: fcntl(F_SETFL) on a descriptor we still own.
        let rc = unsafe {
            libc::fcntl(
                self.inner.get_ref().as_raw_fd(),
                libc::F_SETFL,
                self.original_flags,
            )
        };
        if rc < 0 {
            debug!(
                "Failed to restore descriptor flags: {}",
                io::Error::last_os_error()
            );
        }
    }
}

/// Set `O_NONBLOCK`, returning the previous status flags.
fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<libc::c_int> {
    let raw = fd.as_raw_fd();
    // SAFETY: fcntl on a valid borrowed descriptor.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(flags)
}

impl AsyncRead for FdStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            let mut guard = ready!(this.inner.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| inner.get_ref().read(unfilled)) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                // Linux reports a PTY master whose slave side is gone as EIO.
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => {
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for FdStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            let mut guard = ready!(this.inner.poll_write_ready(cx))?;
            match guard.try_io(|inner| inner.get_ref().write(data)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
