//! A session: one PTY-attached child process plus an emulator-backed
//! screen, fanned out live to any number of subscribers.
//!
//! All per-session mutable state (the emulator and the subscriber set)
//! sits behind one async mutex. The PTY pump, resize, and subscriber
//! registration all enter that critical section, which is what makes
//! the ordering guarantees hold: a subscriber's initial snapshot is
//! enqueued under the same lock that fan-outs run under, so no delta
//! can ever precede it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use pane_core::protocol::{SessionInfo, WireMessage};
use pane_core::screen::{Cell, ScreenDelta, ScreenSnapshot};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

use crate::daemon::pty::{PtyHandle, TermSize};
use crate::daemon::subscriber::{Subscriber, SubscriberId};
use crate::daemon::terminal::{Emulator, TerminalEmulator};

/// Default command when a session is created without one.
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

struct SessionInner {
    emulator: Box<dyn Emulator>,
    subscribers: HashMap<SubscriberId, Arc<Subscriber>>,
}

/// One live (or exited) terminal session.
pub struct Session {
    id: String,
    name: Option<String>,
    created_at: DateTime<Utc>,
    process_id: Option<u32>,
    running: AtomicBool,
    last_exit_code: StdMutex<Option<i32>>,
    pty: PtyHandle,
    inner: Mutex<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

impl Session {
    /// Spawn the child on a fresh PTY. The command defaults to
    /// `$SHELL` (or `/bin/sh`); arguments after the first are passed
    /// verbatim. Returns the session plus the PTY output stream the
    /// caller hands to [`Session::spawn_pump`].
    pub fn start(
        id: String,
        name: Option<String>,
        command_line: Option<Vec<String>>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Vec<u8>>)> {
        let command = match command_line {
            Some(command) if !command.is_empty() => command,
            _ => vec![default_shell()],
        };
        let size = TermSize::default();
        let (pty, output) = PtyHandle::spawn(&command, size)?;
        let process_id = pty.process_id();

        let session = Arc::new(Self {
            id,
            name,
            created_at: Utc::now(),
            process_id,
            running: AtomicBool::new(true),
            last_exit_code: StdMutex::new(None),
            pty,
            inner: Mutex::new(SessionInner {
                emulator: Box::new(TerminalEmulator::new(size)),
                subscribers: HashMap::new(),
            }),
        });
        Ok((session, output))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            created_at: self
                .created_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            process_id: self.process_id,
            is_running: self.is_running(),
            last_exit_code: self
                .last_exit_code
                .lock()
                .map(|code| *code)
                .unwrap_or(None),
        }
    }

    /// Start the output pump: PTY bytes feed the emulator, dirty rows
    /// fan out as deltas, and PTY EOF triggers child reaping.
    pub fn spawn_pump(self: &Arc<Self>, mut output: mpsc::Receiver<Vec<u8>>) {
        let session = self.clone();
        tokio::spawn(async move {
            while let Some(bytes) = output.recv().await {
                session.process_output(&bytes).await;
            }
            session.handle_child_exit().await;
        });
    }

    async fn process_output(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().await;
        inner.emulator.feed(bytes);
        Self::flush_dirty(&mut inner);
    }

    /// Emit a delta for the emulator's dirty range, then clear it.
    ///
    /// With no subscribers the range is still cleared so it cannot
    /// grow without bound. A range entirely below the screen after
    /// clipping produces no frame at all.
    fn flush_dirty(inner: &mut SessionInner) {
        let Some((start, end)) = inner.emulator.dirty_range() else {
            return;
        };
        if !inner.subscribers.is_empty() {
            let rows = inner.emulator.rows();
            let end = end.min(rows.saturating_sub(1));
            if rows > 0 && start < rows && start <= end {
                let delta = build_delta(inner.emulator.as_ref(), start, end);
                for subscriber in inner.subscribers.values() {
                    subscriber.send_binary(WireMessage::Delta {
                        delta: delta.clone(),
                    });
                }
            }
        }
        inner.emulator.clear_dirty();
    }

    /// Write bytes to the child's stdin.
    pub async fn send_input(&self, bytes: &[u8]) -> Result<()> {
        self.pty.write(bytes).await
    }

    /// Resize the emulator and the PTY. A zero dimension is a no-op.
    /// Every subscriber observes the new size as a full-screen delta,
    /// even when the child stays quiet.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if cols == 0 || rows == 0 {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        inner.emulator.resize(cols, rows);
        if let Err(e) = self.pty.resize(TermSize { cols, rows }) {
            // The emulator already switched; an exited child just
            // means nobody is left to receive the winsize change.
            debug!(session = %self.id, "PTY resize failed: {e}");
        }
        Self::flush_dirty(&mut inner);
        Ok(())
    }

    /// Register a subscriber and enqueue its initial snapshot in one
    /// critical section, then wire the close callback that unlinks it.
    pub async fn attach_subscriber(self: &Arc<Self>, subscriber: Arc<Subscriber>) {
        let weak = Arc::downgrade(self);
        subscriber.set_on_close(Box::new(move |id| {
            if let Some(session) = weak.upgrade() {
                tokio::spawn(async move {
                    session.remove_subscriber(id).await;
                });
            }
        }));

        let mut inner = self.inner.lock().await;
        let snapshot = build_snapshot(inner.emulator.as_ref());
        subscriber.send_binary(WireMessage::Snapshot { snapshot });
        inner.subscribers.insert(subscriber.id(), subscriber);
        debug!(session = %self.id, subscribers = inner.subscribers.len(), "subscriber attached");
    }

    pub async fn remove_subscriber(&self, id: SubscriberId) {
        let mut inner = self.inner.lock().await;
        if inner.subscribers.remove(&id).is_some() {
            debug!(session = %self.id, subscriber = id, "subscriber removed");
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.subscribers.len()
    }

    /// SIGTERM the child and close the PTY master. The pump observes
    /// EOF and finishes the teardown (reap, flags, subscribers).
    pub async fn terminate(&self) {
        if let Some(pid) = self.process_id {
            // SAFETY: signalling a pid we spawned; worst case the pid
            // is already reaped and kill returns ESRCH.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        for _ in 0..10 {
            if self.pty.has_exited() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        if !self.pty.has_exited() {
            self.pty.kill();
        }
        self.pty.close_master();
    }

    async fn handle_child_exit(&self) {
        let code = self.pty.reap().await;
        if let Ok(mut slot) = self.last_exit_code.lock() {
            *slot = code;
        }
        self.running.store(false, Ordering::SeqCst);
        self.pty.close_master();

        let subscribers: Vec<_> = {
            let inner = self.inner.lock().await;
            inner.subscribers.values().cloned().collect()
        };
        // Brief delay so the sender lanes can flush the final deltas
        // before the connections drop.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        for subscriber in subscribers {
            subscriber.close().await;
        }
        info!(session = %self.id, exit_code = ?code, "child exited");
    }
}

/// Capture the whole grid.
pub fn build_snapshot(emulator: &dyn Emulator) -> ScreenSnapshot {
    let (cursor_x, cursor_y) = emulator.cursor();
    let rows = emulator.rows();
    ScreenSnapshot {
        cols: emulator.cols(),
        rows,
        cursor_x,
        cursor_y,
        is_alternate: emulator.alternate_screen(),
        lines: (0..rows).map(|y| build_line(emulator, y)).collect(),
    }
}

/// Capture the inclusive row range `[start_y, end_y]`.
pub fn build_delta(emulator: &dyn Emulator, start_y: u16, end_y: u16) -> ScreenDelta {
    let (cursor_x, cursor_y) = emulator.cursor();
    ScreenDelta {
        start_y,
        end_y,
        cursor_x,
        cursor_y,
        lines: (start_y..=end_y).map(|y| build_line(emulator, y)).collect(),
    }
}

/// One cell per column; rows the emulator cannot fill are padded with
/// blanks so every line is exactly `cols` cells wide.
fn build_line(emulator: &dyn Emulator, y: u16) -> Vec<Cell> {
    let cols = emulator.cols();
    (0..cols)
        .map(|x| emulator.cell(x, y).unwrap_or_else(Cell::blank))
        .collect()
}
