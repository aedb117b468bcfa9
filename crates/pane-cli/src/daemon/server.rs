//! Unix socket server hosting the session registry.
//!
//! One frame is read per connection. Control commands get a single
//! response and a close; a successful attach upgrades the connection
//! into a subscriber stream that lives until either side hangs up.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{SecondsFormat, Utc};
use pane_core::error::CommandError;
use pane_core::protocol::{Request, Response, ServerInfo, WireMessage};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::daemon::connection::FramedConnection;
use crate::daemon::paths;
use crate::daemon::registry::SessionRegistry;
use crate::daemon::subscriber::Subscriber;

/// Maximum concurrent client connections.
const MAX_CONNECTIONS: usize = 256;

/// Usable bytes in `sockaddr_un.sun_path` (the trailing NUL is the
/// kernel's).
const SOCKET_PATH_MAX: usize = 107;

pub struct PaneServer {
    listener: UnixListener,
    socket_path: PathBuf,
    pid_path: PathBuf,
    registry: Arc<SessionRegistry>,
    info: ServerInfo,
    connection_semaphore: Arc<Semaphore>,
}

impl std::fmt::Debug for PaneServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaneServer")
            .field("socket_path", &self.socket_path)
            .finish()
    }
}

impl PaneServer {
    /// Bind at the default per-user paths.
    pub async fn bind() -> Result<Self> {
        paths::ensure_runtime_dir().context("failed to prepare runtime directory")?;
        Self::bind_to(paths::socket_path(), paths::pid_path()).await
    }

    /// Bind at explicit paths.
    ///
    /// Binds first to avoid an unlink race between concurrently
    /// auto-started servers: on `AddrInUse` the PID file decides
    /// whether a live server owns the socket (error) or a dead one
    /// left it behind (remove and retry).
    pub async fn bind_to(socket_path: PathBuf, pid_path: PathBuf) -> Result<Self> {
        ignore_sigpipe();

        if socket_path.as_os_str().len() > SOCKET_PATH_MAX {
            bail!(
                "socket path too long for sockaddr_un ({} > {SOCKET_PATH_MAX} bytes): {}",
                socket_path.as_os_str().len(),
                socket_path.display()
            );
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let listener = match UnixListener::bind(&socket_path) {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                if is_server_alive(&pid_path) {
                    bail!("server already running at {}", socket_path.display());
                }
                remove_stale_socket(&socket_path)?;
                UnixListener::bind(&socket_path)
                    .with_context(|| format!("failed to bind {}", socket_path.display()))?
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to bind {}", socket_path.display()));
            }
        };

        std::fs::set_permissions(&socket_path, socket_permissions())
            .with_context(|| format!("failed to chmod {}", socket_path.display()))?;
        write_pid_file(&pid_path)
            .with_context(|| format!("failed to write {}", pid_path.display()))?;

        let info = ServerInfo {
            pid: std::process::id(),
            started_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            socket_path: socket_path.display().to_string(),
        };
        info!(pid = info.pid, "listening on {}", socket_path.display());

        Ok(Self {
            listener,
            socket_path,
            pid_path,
            registry: Arc::new(SessionRegistry::new()),
            info,
            connection_semaphore: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        })
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Accept connections until the task is dropped.
    pub async fn run(&self) -> Result<()> {
        loop {
            let (stream, _addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("accept error: {e}");
                    continue;
                }
            };
            let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("connection limit ({MAX_CONNECTIONS}) reached, dropping client");
                    drop(stream);
                    continue;
                }
            };
            let registry = self.registry.clone();
            let info = self.info.clone();
            tokio::spawn(async move {
                let _permit = permit;
                handle_connection(stream, registry, info).await;
            });
        }
    }

    /// Terminate every session; called before the process exits.
    pub async fn shutdown(&self) {
        self.registry.destroy_all().await;
    }
}

impl Drop for PaneServer {
    fn drop(&mut self) {
        if self.socket_path.exists() && std::fs::remove_file(&self.socket_path).is_err() {
            warn!("failed to remove socket on shutdown");
        }
        if self.pid_path.exists() && std::fs::remove_file(&self.pid_path).is_err() {
            warn!("failed to remove PID file on shutdown");
        }
    }
}

fn socket_permissions() -> std::fs::Permissions {
    use std::os::unix::fs::PermissionsExt;
    std::fs::Permissions::from_mode(0o600)
}

/// Writes to clients that vanished must surface as errors, not kill
/// the process.
fn ignore_sigpipe() {
    // SAFETY: installing SIG_IGN for SIGPIPE is async-signal-safe and
    // has no observable effect beyond write() returning EPIPE.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Whether the PID file names a process that still exists.
fn is_server_alive(pid_path: &Path) -> bool {
    let Ok(contents) = std::fs::read_to_string(pid_path) else {
        return false;
    };
    let Ok(pid) = contents.trim().parse::<i32>() else {
        return false;
    };
    // SAFETY: kill with signal 0 only probes for existence.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Remove a leftover socket, refusing symlinks and non-socket files.
fn remove_stale_socket(socket_path: &Path) -> Result<()> {
    use std::os::unix::fs::FileTypeExt;

    let metadata = std::fs::symlink_metadata(socket_path)
        .with_context(|| format!("failed to stat {}", socket_path.display()))?;
    if metadata.file_type().is_symlink() {
        bail!(
            "socket path {} is a symlink, refusing to remove it",
            socket_path.display()
        );
    }
    if !metadata.file_type().is_socket() {
        bail!(
            "{} exists but is not a socket",
            socket_path.display()
        );
    }
    info!("removing stale socket from dead server");
    std::fs::remove_file(socket_path)
        .with_context(|| format!("failed to remove {}", socket_path.display()))
}

/// `<pid>\n`, written to a temp file and renamed into place.
fn write_pid_file(pid_path: &Path) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut tmp_name = pid_path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&tmp_path)?;
    file.write_all(format!("{}\n", std::process::id()).as_bytes())?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp_path, pid_path)?;
    Ok(())
}

async fn handle_connection(
    stream: UnixStream,
    registry: Arc<SessionRegistry>,
    info: ServerInfo,
) {
    let conn = Arc::new(FramedConnection::new(stream));

    let message = match conn.read_message().await {
        Ok(Some(message)) => message,
        Ok(None) => return,
        Err(e) => {
            debug!("unreadable initial frame: {e}");
            conn.close().await;
            return;
        }
    };
    let request = match message {
        WireMessage::Request { request } => request,
        other => {
            debug!("first frame was not a request: {other:?}");
            let failure = Response::failure(CommandError::invalid_request().message);
            respond(&conn, &info, failure).await;
            conn.close().await;
            return;
        }
    };

    debug!(?request, "dispatching");
    match request {
        Request::Ping => {
            respond(&conn, &info, Response::success().with_message("pong")).await;
            conn.close().await;
        }
        Request::CreateSession { name, command_line } => {
            let response = match registry.create(name, command_line).await {
                Ok(session) => Response::success().with_session(session.info()),
                Err(e) => Response::failure(e.message),
            };
            respond(&conn, &info, response).await;
            conn.close().await;
        }
        Request::ListSessions => {
            let response = Response::success().with_sessions(registry.list().await);
            respond(&conn, &info, response).await;
            conn.close().await;
        }
        Request::DestroySession { session_id } => {
            let response = match session_id {
                None => Response::failure(CommandError::session_id_required().message),
                Some(id) => match registry.destroy(&id).await {
                    Ok(()) => Response::success().with_message("session destroyed"),
                    Err(e) => Response::failure(e.message),
                },
            };
            respond(&conn, &info, response).await;
            conn.close().await;
        }
        Request::AttachSession {
            session_id,
            cols,
            rows,
        } => {
            handle_attach(conn, registry, info, session_id, cols, rows).await;
        }
    }
}

/// Upgrade the connection into a subscriber stream. The declared size
/// is applied first so the initial snapshot already has the client's
/// dimensions; the response and snapshot then flow through the
/// subscriber's queue, which fixes their order ahead of any delta.
async fn handle_attach(
    conn: Arc<FramedConnection>,
    registry: Arc<SessionRegistry>,
    info: ServerInfo,
    session_id: Option<String>,
    cols: Option<u16>,
    rows: Option<u16>,
) {
    let session = match registry.attach_target(session_id.as_deref()).await {
        Ok(session) => session,
        Err(e) => {
            respond(&conn, &info, Response::failure(e.message)).await;
            conn.close().await;
            return;
        }
    };
    if let (Some(cols), Some(rows)) = (cols, rows) {
        if let Err(e) = session.resize(cols, rows).await {
            debug!("attach resize failed: {e}");
        }
    }

    let subscriber = Subscriber::spawn(conn);
    let mut response = Response::success().with_session(session.info());
    response.server = Some(info);
    subscriber.send(WireMessage::Response { response });
    session.attach_subscriber(subscriber.clone()).await;
    subscriber.run_receive_loop(session).await;
}

async fn respond(conn: &FramedConnection, info: &ServerInfo, mut response: Response) {
    response.server = Some(info.clone());
    if let Err(e) = conn.send(&WireMessage::Response { response }).await {
        debug!("failed to send response: {e}");
    }
}
