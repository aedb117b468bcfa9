//! Length-prefixed framed I/O over a Unix stream.
//!
//! Frame layout: 4-byte big-endian length, 1-byte format tag
//! (0 = JSON, 1 = binary), then `length - 1` payload bytes. One async
//! mutex serializes writes so concurrent senders never interleave the
//! bytes of two frames; reads are single-consumer by contract.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use pane_core::error::CodecError;
use pane_core::protocol::WireMessage;
use pane_core::wire::{self, FORMAT_BINARY, FORMAT_JSON};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

/// Upper bound on a single frame. A full-screen true-color snapshot of
/// a very large terminal stays well under this.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One framed duplex connection.
pub struct FramedConnection {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
}

impl FramedConnection {
    pub fn new(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a message as a JSON frame.
    pub async fn send(&self, message: &WireMessage) -> Result<()> {
        let payload = serde_json::to_vec(message).context("failed to serialize message")?;
        self.write_frame(FORMAT_JSON, &payload).await
    }

    /// Send a message as a binary frame. Only screen traffic has a
    /// binary form; requests and responses are rejected.
    pub async fn send_binary(&self, message: &WireMessage) -> Result<()> {
        let payload = wire::encode_binary(message)?;
        self.write_frame(FORMAT_BINARY, &payload).await
    }

    async fn write_frame(&self, format: u8, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            bail!("connection closed");
        }
        let mut frame = Vec::with_capacity(5 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32 + 1).to_be_bytes());
        frame.push(format);
        frame.extend_from_slice(payload);

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&frame)
            .await
            .context("failed to write frame")?;
        writer.flush().await.context("failed to flush frame")?;
        Ok(())
    }

    /// Read the next message, auto-detecting the format from the frame
    /// tag. Returns `None` on clean EOF at a frame boundary; EOF in
    /// the middle of a frame is an error.
    pub async fn read_message(&self) -> Result<Option<WireMessage>> {
        if self.is_closed() {
            return Ok(None);
        }
        let mut reader = self.reader.lock().await;

        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e).context("failed to read frame length"),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Err(CodecError::UnexpectedEnd.into());
        }
        if len > MAX_FRAME_LEN {
            bail!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit");
        }

        let mut frame = vec![0u8; len];
        reader
            .read_exact(&mut frame)
            .await
            .map_err(|_| CodecError::UnexpectedEnd)?;
        drop(reader);

        let format = frame[0];
        let payload = &frame[1..];
        match format {
            FORMAT_JSON => {
                let message =
                    serde_json::from_slice(payload).context("failed to parse JSON frame")?;
                Ok(Some(message))
            }
            FORMAT_BINARY => Ok(Some(wire::decode_binary(payload)?)),
            other => Err(CodecError::InvalidTag(other).into()),
        }
    }

    /// Close the write side. Idempotent; subsequent sends fail and
    /// reads report EOF.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}
