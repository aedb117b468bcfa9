//! PTY allocation and child process I/O using portable-pty.
//!
//! PTY file descriptors only support blocking reads and writes, so a
//! reader thread and a writer thread bridge them to tokio channels.
//! The reader side is handed to the session's output pump; the writer
//! side is driven through [`PtyHandle::write`].

use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

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

/// Buffer size for reading from the PTY master.
const READ_BUFFER_SIZE: usize = 4096;

/// Handle to a spawned child on a PTY.
///
/// Owns the master side and the child; output bytes arrive on the
/// receiver returned from [`PtyHandle::spawn`].
pub struct PtyHandle {
    write_tx: mpsc::Sender<Vec<u8>>,
    /// Master side, kept for resize ioctls. Taken on close.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    process_id: Option<u32>,
}

impl PtyHandle {
    /// Open a PTY pair, spawn `command` on the slave side, and start
    /// the I/O threads. Arguments after the first are passed verbatim.
    pub fn spawn(command: &[String], size: TermSize) -> Result<(Self, mpsc::Receiver<Vec<u8>>)> {
        if command.is_empty() {
            bail!("command cannot be empty");
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(size.into())
            .context("failed to open PTY")?;

        let mut cmd = CommandBuilder::new(&command[0]);
        if command.len() > 1 {
            cmd.args(&command[1..]);
        }
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .context("failed to spawn command")?;
        let process_id = child.process_id();

        let reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone PTY reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("failed to take PTY writer")?;

        let (write_tx, write_rx) = mpsc::channel::<Vec<u8>>(64);
        let (read_tx, read_rx) = mpsc::channel::<Vec<u8>>(64);

        std::thread::spawn(move || reader_loop(reader, read_tx));
        std::thread::spawn(move || writer_loop(writer, write_rx));

        let handle = Self {
            write_tx,
            master: Mutex::new(Some(pair.master)),
            child: Mutex::new(child),
            process_id,
        };
        Ok((handle, read_rx))
    }

    /// OS process id of the child, if the platform reports one.
    pub fn process_id(&self) -> Option<u32> {
        self.process_id
    }

    /// Queue bytes for the child's stdin.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.write_tx
            .send(data.to_vec())
            .await
            .context("PTY writer is gone")
    }

    /// Resize the PTY; the kernel delivers SIGWINCH to the child.
    pub fn resize(&self, size: TermSize) -> Result<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| anyhow::anyhow!("master PTY mutex poisoned"))?;
        match master.as_ref() {
            Some(master) => master.resize(size.into()).context("failed to resize PTY"),
            None => bail!("PTY already closed"),
        }
    }

    /// Whether the child has exited, without blocking.
    pub fn has_exited(&self) -> bool {
        self.child
            .lock()
            .ok()
            .and_then(|mut child| child.try_wait().ok())
            .map(|status| status.is_some())
            .unwrap_or(false)
    }

    /// Non-blocking reap attempt; the exit code once the child is gone.
    pub fn try_wait(&self) -> Option<i32> {
        let mut child = self.child.lock().ok()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.exit_code() as i32),
            _ => None,
        }
    }

    /// Forcibly kill the child.
    pub fn kill(&self) {
        if let Ok(mut child) = self.child.lock() {
            if let Err(e) = child.kill() {
                debug!("kill failed (child may have exited): {e}");
            }
        }
    }

    /// Collect the exit code, escalating to kill if the child lingers.
    pub async fn reap(&self) -> Option<i32> {
        for _ in 0..40 {
            if let Some(code) = self.try_wait() {
                return Some(code);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        warn!("child did not exit after PTY EOF, killing");
        self.kill();
        for _ in 0..20 {
            if let Some(code) = self.try_wait() {
                return Some(code);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        None
    }

    /// Drop the master descriptor. Further resizes fail; the reader
    /// thread ends once the child side is gone.
    pub fn close_master(&self) {
        if let Ok(mut master) = self.master.lock() {
            master.take();
        }
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        // Reap so an abandoned session never leaves a zombie behind.
        if let Ok(mut child) = self.child.lock() {
            if let Ok(None) = child.try_wait() {
                let _ = child.kill();
                let _ = child.try_wait();
            }
        }
    }
}

fn reader_loop(mut reader: Box<dyn Read + Send>, read_tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                debug!("PTY reader EOF");
                break;
            }
            Ok(n) => {
                if read_tx.blocking_send(buf[..n].to_vec()).is_err() {
                    debug!("PTY output channel closed");
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                // EIO is the normal end-of-stream for a PTY master on Linux.
                debug!("PTY read ended: {e}");
                break;
            }
        }
    }
}

fn writer_loop(mut writer: Box<dyn Write + Send>, mut write_rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = write_rx.blocking_recv() {
        if let Err(e) = writer.write_all(&data) {
            error!("PTY write error: {e}");
            break;
        }
        if let Err(e) = writer.flush() {
            error!("PTY flush error: {e}");
            break;
        }
    }
    debug!("PTY writer exiting");
}
