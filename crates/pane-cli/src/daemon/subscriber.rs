//! Per-attached-client adapter.
//!
//! A subscriber owns one framed connection and two lanes: a sender
//! task draining a queue (so fan-out from the session never blocks on
//! a slow client socket) and a receive loop dispatching client input
//! and resize events. The session owns subscribers by id; the
//! subscriber only borrows the session handle inside its receive loop,
//! and teardown flows through a close callback instead of a
//! back-pointer.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use pane_core::protocol::WireMessage;
use tokio::sync::mpsc;
use tracing::debug;

use crate::daemon::connection::FramedConnection;
use crate::daemon::session::Session;

pub type SubscriberId = u64;
pub type CloseCallback = Box<dyn Fn(SubscriberId) + Send + Sync>;

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

enum Outbound {
    Json(WireMessage),
    Binary(WireMessage),
}

pub struct Subscriber {
    id: SubscriberId,
    conn: Arc<FramedConnection>,
    /// Taken on close so the sender task drains out and exits.
    outbox: StdMutex<Option<mpsc::UnboundedSender<Outbound>>>,
    closed: AtomicBool,
    on_close: StdMutex<Option<CloseCallback>>,
}

impl Subscriber {
    /// Wrap a connection and start the sender task.
    pub fn spawn(conn: Arc<FramedConnection>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber = Arc::new(Self {
            id: NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed),
            conn,
            outbox: StdMutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            on_close: StdMutex::new(None),
        });
        tokio::spawn(Self::run_sender(subscriber.clone(), rx));
        subscriber
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Register the callback invoked exactly once when this subscriber
    /// closes; the session uses it to unlink the id.
    pub fn set_on_close(&self, callback: CloseCallback) {
        if let Ok(mut slot) = self.on_close.lock() {
            *slot = Some(callback);
        }
    }

    /// Queue a JSON frame. Never blocks; silently dropped once closed.
    pub fn send(&self, message: WireMessage) {
        self.enqueue(Outbound::Json(message));
    }

    /// Queue a binary frame.
    pub fn send_binary(&self, message: WireMessage) {
        self.enqueue(Outbound::Binary(message));
    }

    fn enqueue(&self, outbound: Outbound) {
        if self.is_closed() {
            return;
        }
        let sender = self.outbox.lock().ok().and_then(|slot| slot.clone());
        if let Some(tx) = sender {
            let _ = tx.send(outbound);
        }
    }

    async fn run_sender(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
        while let Some(outbound) = rx.recv().await {
            let result = match outbound {
                Outbound::Json(message) => self.conn.send(&message).await,
                Outbound::Binary(message) => self.conn.send_binary(&message).await,
            };
            if let Err(e) = result {
                debug!(subscriber = self.id, "send failed, closing: {e}");
                break;
            }
        }
        self.close().await;
    }

    /// Read messages until EOF or error, dispatching input and resize
    /// to the session. Unknown message types are ignored for forward
    /// compatibility. Returns once the subscriber is closed.
    pub async fn run_receive_loop(self: &Arc<Self>, session: Arc<Session>) {
        loop {
            match self.conn.read_message().await {
                Ok(Some(WireMessage::Input { input })) => {
                    if let Err(e) = session.send_input(input.data.as_bytes()).await {
                        debug!(subscriber = self.id, "input write failed: {e}");
                        break;
                    }
                }
                Ok(Some(WireMessage::Resize { resize })) => {
                    if let Err(e) = session.resize(resize.cols, resize.rows).await {
                        debug!(subscriber = self.id, "resize failed: {e}");
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!(subscriber = self.id, "client disconnected");
                    break;
                }
                Err(e) => {
                    debug!(subscriber = self.id, "receive failed: {e}");
                    break;
                }
            }
        }
        self.close().await;
    }

    /// Idempotent close: shuts the connection, stops the sender task,
    /// and fires the close callback exactly once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut slot) = self.outbox.lock() {
            slot.take();
        }
        self.conn.close().await;
        let callback = self.on_close.lock().ok().and_then(|mut slot| slot.take());
        if let Some(callback) = callback {
            callback(self.id);
        }
    }
}
