//! Socket, PID and log file path resolution.
//!
//! Priority for the runtime directory:
//! 1. `TETHER_SOCKET_DIR` (explicit override)
//! 2. `XDG_RUNTIME_DIR/tether` (Linux standard)
//! 3. `~/.tether` (home directory fallback)
//! 4. `$TMPDIR/tether` (last resort)
//!
//! The directory holds `tether.sock`, `tether.pid` and `tether.log`.

use std::env;
use std::path::PathBuf;

const SOCKET_FILE: &str = "tether.sock";
const PID_FILE: &str = "tether.pid";
const LOG_FILE: &str = "tether.log";

/// Get the runtime directory with priority fallback.
///
/// Empty environment values are ignored.
pub fn get_socket_dir() -> PathBuf {
    if let Ok(dir) = env::var("TETHER_SOCKET_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    if let Ok(runtime_dir) = env::var("XDG_RUNTIME_DIR") {
        if !runtime_dir.is_empty() {
            return PathBuf::from(runtime_dir).join("tether");
        }
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".tether");
    }

    env::temp_dir().join("tether")
}

/// Path of the control socket.
pub fn get_socket_path() -> PathBuf {
    get_socket_dir().join(SOCKET_FILE)
}

/// Path of the PID file written next to the socket.
pub fn get_pid_path() -> PathBuf {
    get_socket_dir().join(PID_FILE)
}

/// Where an auto-started daemon sends its log output.
pub fn get_log_path() -> PathBuf {
    get_socket_dir().join(LOG_FILE)
}

/// Ensure the runtime directory exists and is private (0700).
pub fn ensure_socket_dir() -> std::io::Result<()> {
    let dir = get_socket_dir();
    std::fs::create_dir_all(&dir)?;

    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;

    Ok(())
}
