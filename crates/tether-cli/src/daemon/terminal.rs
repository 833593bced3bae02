//! Client-side terminal handling: raw mode and window size.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

use tether_core::protocol::WindowSize;

/// Puts a terminal into raw mode and restores the saved settings on drop.
///
/// Restoration happens on every exit path out of an attachment, including
/// errors and a daemon hang-up.
pub struct RawModeGuard<'fd> {
    fd: BorrowedFd<'fd>,
    original: libc::termios,
}

impl<'fd> RawModeGuard<'fd> {
    pub fn enter(fd: BorrowedFd<'fd>) -> io::Result<Self> {
        // SAFETY: termios is plain old data; tcgetattr fills it in.
        let mut original: libc::termios = unsafe { std::mem::zeroed() };
        // SAFETY: valid descriptor and out pointer.
        if unsafe { libc::tcgetattr(fd.as_raw_fd(), &mut original) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let mut raw = original;
        // SAFETY: cfmakeraw only edits the struct it is given.
        unsafe { libc::cfmakeraw(&mut raw) };
        // SAFETY: valid descriptor and settings.
        if unsafe { libc::tcsetattr(fd.as_raw_fd(), libc::TCSAFLUSH, &raw) } != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { fd, original })
    }
}

impl Drop for RawModeGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: restoring settings captured from this same descriptor.
        if unsafe { libc::tcsetattr(self.fd.as_raw_fd(), libc::TCSAFLUSH, &self.original) } != 0 {
            tracing::warn!(
                "Failed to restore terminal mode: {}",
                io::Error::last_os_error()
            );
        }
    }
}

/// Current window size of the terminal on `fd`, if it is one.
pub fn window_size(fd: BorrowedFd<'_>) -> Option<WindowSize> {
    // SAFETY: winsize is plain old data.
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    // SAFETY: TIOCGWINSZ writes a winsize through a valid pointer.
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ, &mut ws) };
    if rc != 0 || ws.ws_row == 0 || ws.ws_col == 0 {
        return None;
    }
    Some(WindowSize {
        rows: ws.ws_row,
        cols: ws.ws_col,
    })
}

/// Whether `fd` refers to a terminal.
pub fn is_terminal(fd: BorrowedFd<'_>) -> bool {
    // SAFETY: isatty has no preconditions beyond a descriptor number.
    unsafe { libc::isatty(fd.as_raw_fd()) == 1 }
}
