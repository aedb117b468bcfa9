//! Message types for client/server communication.
//!
//! Control traffic (requests, responses) is always JSON; screen
//! traffic additionally has a compact binary encoding in [`crate::wire`].
//! Field names below are part of the wire contract.

use serde::{Deserialize, Serialize};

use crate::screen::{ScreenDelta, ScreenSnapshot};

/// A command sent by a client. One request is read per connection; for
/// everything except `attachSession` the server answers once and
/// closes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Request {
    /// Liveness probe, answered with "pong".
    Ping,
    /// Create a session and start its child process.
    CreateSession {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Executable and arguments; defaults to the user's shell.
        #[serde(
            default,
            rename = "commandLine",
            skip_serializing_if = "Option::is_none"
        )]
        command_line: Option<Vec<String>>,
    },
    ListSessions,
    /// Upgrade this connection into a persistent subscriber stream.
    AttachSession {
        #[serde(default, rename = "sessionID", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Declared client terminal size, applied before the snapshot.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },
    DestroySession {
        #[serde(default, rename = "sessionID", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

/// Identity of the server answering a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub pid: u32,
    pub started_at: String,
    pub socket_path: String,
}

/// Public attributes of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: String,
    #[serde(default, rename = "processID", skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    pub is_running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exit_code: Option<i32>,
}

/// Answer to a request. `server` identifies the responding daemon and
/// is attached to every response the server emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions: Option<Vec<SessionInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerInfo>,
}

impl Response {
    pub fn success() -> Self {
        Self {
            ok: true,
            message: None,
            session: None,
            sessions: None,
            server: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: Some(message.into()),
            session: None,
            sessions: None,
            server: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_session(mut self, session: SessionInfo) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_sessions(mut self, sessions: Vec<SessionInfo>) -> Self {
        self.sessions = Some(sessions);
        self
    }
}

/// Keyboard bytes bound for a session's child process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputMessage {
    pub data: String,
}

/// A subscriber's terminal changed size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeMessage {
    pub cols: u16,
    pub rows: u16,
}

/// Top-level envelope for every frame on the wire, discriminated by
/// `type` with the matching body field populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WireMessage {
    Request { request: Request },
    Response { response: Response },
    Snapshot { snapshot: ScreenSnapshot },
    Delta { delta: ScreenDelta },
    Input { input: InputMessage },
    Resize { resize: ResizeMessage },
}
