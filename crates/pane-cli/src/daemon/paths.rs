//! Runtime directory and socket path resolution.
//!
//! Everything lives under a per-user directory `/tmp/pane-<euid>`:
//! the listening socket (`default`), the PID file (`pane.pid`), and
//! the optional log file (`pane.log`). The directory is created with
//! mode 0700 and re-chmodded on every server start.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

/// Per-user runtime directory.
pub fn runtime_dir() -> PathBuf {
    // SAFETY: geteuid has no failure modes and touches no memory.
    let euid = unsafe { libc::geteuid() };
    PathBuf::from(format!("/tmp/pane-{euid}"))
}

/// Create the runtime directory if needed and enforce 0700 on it.
pub fn ensure_runtime_dir() -> io::Result<PathBuf> {
    let dir = runtime_dir();
    fs::create_dir_all(&dir)?;
    fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
    Ok(dir)
}

/// Path of the listening socket.
pub fn socket_path() -> PathBuf {
    runtime_dir().join("default")
}

/// Path of the server PID file.
pub fn pid_path() -> PathBuf {
    runtime_dir().join("pane.pid")
}

/// Path of the optional log file.
pub fn log_path() -> PathBuf {
    runtime_dir().join("pane.log")
}
