//! Client connection to the server, with on-demand auto-start.
//!
//! A missing or refusing socket means "no server yet": the client
//! forks the server executable detached and retries the connect on a
//! fixed budget. Every other connect error propagates immediately.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use pane_core::protocol::{Request, Response, ServerInfo, SessionInfo, WireMessage};
use pane_core::screen::ScreenSnapshot;
use tokio::net::UnixStream;
use tracing::{debug, info};

use crate::daemon::connection::FramedConnection;
use crate::daemon::paths;

/// Connect retry budget while an auto-started server comes up.
const CONNECT_ATTEMPTS: u32 = 25;
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Connection behavior knobs taken from the CLI flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOptions {
    /// Start a server if none is listening.
    pub auto_start: bool,
    /// Pass `--log` to an auto-started server.
    pub log: bool,
}

pub struct PaneClient {
    conn: Arc<FramedConnection>,
}

impl std::fmt::Debug for PaneClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaneClient").finish()
    }
}

impl PaneClient {
    /// Connect to the default socket.
    pub async fn connect(options: ConnectOptions) -> Result<Self> {
        Self::connect_to(&paths::socket_path(), options).await
    }

    /// Connect to an explicit socket path.
    pub async fn connect_to(socket_path: &Path, options: ConnectOptions) -> Result<Self> {
        match UnixStream::connect(socket_path).await {
            Ok(stream) => {
                debug!("connected to running server");
                return Ok(Self::from_stream(stream));
            }
            Err(e) if is_no_server(&e) => {
                if !options.auto_start {
                    bail!("No server running");
                }
                // A refused connect means a dead server left its
                // socket behind; clear it so the new one can bind.
                if e.kind() == std::io::ErrorKind::ConnectionRefused {
                    let _ = std::fs::remove_file(socket_path);
                }
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to connect to {}", socket_path.display()));
            }
        }

        info!("no server running, starting one");
        let mut child = spawn_server(options.log)?;

        for _ in 0..CONNECT_ATTEMPTS {
            match UnixStream::connect(socket_path).await {
                Ok(stream) => return Ok(Self::from_stream(stream)),
                Err(e) if is_no_server(&e) => {
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to connect to {}", socket_path.display())
                    });
                }
            }
        }

        // Losing the bind race to a concurrent auto-start is fine, the
        // winner would have answered above. Getting here means nothing
        // ever listened; the child's exit status is the best clue.
        match child.try_wait() {
            Ok(Some(status)) => bail!("server exited during startup with {status}"),
            _ => bail!(
                "server did not become reachable after {} attempts",
                CONNECT_ATTEMPTS
            ),
        }
    }

    fn from_stream(stream: UnixStream) -> Self {
        Self {
            conn: Arc::new(FramedConnection::new(stream)),
        }
    }

    pub fn connection(&self) -> Arc<FramedConnection> {
        self.conn.clone()
    }

    /// Send one request and read its response.
    pub async fn request(&self, request: Request) -> Result<Response> {
        self.conn
            .send(&WireMessage::Request { request })
            .await
            .context("failed to send request")?;
        match self.conn.read_message().await? {
            Some(WireMessage::Response { response }) => Ok(response),
            Some(_) => bail!("invalid response"),
            None => bail!("server closed the connection"),
        }
    }

    /// Send one request and fail with the server's message verbatim on
    /// a negative response.
    pub async fn request_ok(&self, request: Request) -> Result<Response> {
        let response = self.request(request).await?;
        if !response.ok {
            bail!(
                "{}",
                response.message.unwrap_or_else(|| "request failed".into())
            );
        }
        Ok(response)
    }

    /// Perform the attach handshake: request, positive response, then
    /// the initial snapshot. The connection stays upgraded; screen
    /// traffic continues on it until either side closes.
    pub async fn attach(
        &self,
        session_id: Option<String>,
        cols: u16,
        rows: u16,
    ) -> Result<(SessionInfo, ScreenSnapshot)> {
        let response = self
            .request(Request::AttachSession {
                session_id,
                cols: Some(cols),
                rows: Some(rows),
            })
            .await?;
        if !response.ok {
            bail!(
                "{}",
                response.message.unwrap_or_else(|| "attach failed".into())
            );
        }
        let Some(session) = response.session else {
            bail!("invalid attach response");
        };
        match self.conn.read_message().await? {
            Some(WireMessage::Snapshot { snapshot }) => Ok((session, snapshot)),
            _ => bail!("missing snapshot"),
        }
    }
}

/// Probe every socket in the runtime directory and collect the info of
/// each answering server.
pub async fn list_servers() -> Vec<ServerInfo> {
    use std::os::unix::fs::FileTypeExt;

    let mut servers = Vec::new();
    let Ok(entries) = std::fs::read_dir(paths::runtime_dir()) else {
        return servers;
    };
    for entry in entries.flatten() {
        let is_socket = entry
            .file_type()
            .map(|t| t.is_socket())
            .unwrap_or(false);
        if !is_socket {
            continue;
        }
        let probe = async {
            let client =
                PaneClient::connect_to(&entry.path(), ConnectOptions::default()).await.ok()?;
            let response = client.request(Request::Ping).await.ok()?;
            response.server
        };
        if let Ok(Some(server)) = tokio::time::timeout(Duration::from_secs(1), probe).await {
            servers.push(server);
        }
    }
    servers
}

fn is_no_server(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
    )
}

/// Fork the server executable, detached from this terminal.
fn spawn_server(log: bool) -> Result<std::process::Child> {
    use std::os::unix::process::CommandExt;

    let exe = server_executable()?;
    let mut command = std::process::Command::new(exe);
    command
        .arg("--server")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        // New process group: the server must survive this terminal's
        // hangup.
        .process_group(0);
    if log {
        command.arg("--log");
    }
    command.spawn().context("failed to spawn server process")
}

/// Resolve the server executable from arg0: absolute paths as-is,
/// relative paths against the CWD, bare names through PATH.
fn server_executable() -> Result<PathBuf> {
    let arg0 = std::env::args().next().context("missing argv[0]")?;
    resolve_executable(&arg0)
}

fn resolve_executable(arg0: &str) -> Result<PathBuf> {
    let path = Path::new(arg0);
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    if arg0.contains('/') {
        let cwd = std::env::current_dir().context("failed to read current directory")?;
        return Ok(cwd.join(path));
    }
    let search = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&search) {
        let candidate = dir.join(arg0);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    bail!("cannot resolve server executable from {arg0:?}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::server::PaneServer;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn absolute_arg0_is_used_verbatim() {
        let resolved = resolve_executable("/usr/local/bin/pane").expect("resolve");
        assert_eq!(resolved, PathBuf::from("/usr/local/bin/pane"));
    }

    #[test]
    fn relative_arg0_resolves_against_cwd() {
        let resolved = resolve_executable("./target/debug/pane").expect("resolve");
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(resolved, cwd.join("./target/debug/pane"));
    }

    #[test]
    fn bare_arg0_searches_path() {
        // `sh` exists on any Unix PATH this test runs under.
        let resolved = resolve_executable("sh").expect("resolve sh");
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("sh"));
    }

    #[tokio::test]
    async fn connect_without_auto_start_reports_no_server() {
        let missing = std::env::temp_dir().join(format!(
            "pane-noserver-{}.sock",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&missing);

        let err = PaneClient::connect_to(&missing, ConnectOptions::default())
            .await
            .expect_err("no server must fail");
        assert_eq!(err.to_string(), "No server running");
    }

    #[tokio::test]
    async fn request_round_trips_against_a_live_server() {
        let dir = std::env::temp_dir();
        let socket = dir.join(format!("pane-client-{}.sock", std::process::id()));
        let pid = socket.with_extension("pid");
        let _ = std::fs::remove_file(&socket);
        let _ = std::fs::remove_file(&pid);

        let server = PaneServer::bind_to(socket.clone(), pid.clone())
            .await
            .expect("bind");
        let handle = tokio::spawn(async move {
            let _ = server.run().await;
        });

        let client = PaneClient::connect_to(&socket, ConnectOptions::default())
            .await
            .expect("connect");
        let response = timeout(Duration::from_secs(2), client.request(Request::Ping))
            .await
            .expect("timeout")
            .expect("ping");
        assert!(response.ok);
        assert_eq!(response.message.as_deref(), Some("pong"));

        handle.abort();
        let _ = std::fs::remove_file(&socket);
        let _ = std::fs::remove_file(&pid);
    }

    #[tokio::test]
    async fn request_ok_surfaces_server_message_verbatim() {
        let dir = std::env::temp_dir();
        let socket = dir.join(format!("pane-clienterr-{}.sock", std::process::id()));
        let pid = socket.with_extension("pid");
        let _ = std::fs::remove_file(&socket);
        let _ = std::fs::remove_file(&pid);

        let server = PaneServer::bind_to(socket.clone(), pid.clone())
            .await
            .expect("bind");
        let handle = tokio::spawn(async move {
            let _ = server.run().await;
        });

        let client = PaneClient::connect_to(&socket, ConnectOptions::default())
            .await
            .expect("connect");
        let err = client
            .request_ok(Request::DestroySession {
                session_id: Some("bogus".into()),
            })
            .await
            .expect_err("must fail");
        assert_eq!(err.to_string(), "session not found");

        handle.abort();
        let _ = std::fs::remove_file(&socket);
        let _ = std::fs::remove_file(&pid);
    }
}
