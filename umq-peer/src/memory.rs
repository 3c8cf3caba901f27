//! In-process connection pair backed by tokio mpsc channels.
//!
//! Each direction is an unbounded queue carrying [`Message`] values
//! directly, with no framing and no I/O. Useful for exercising peers without
//! networking, and as the semantic reference for real transports.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, Notify, mpsc};

use crate::connection::{Connection, Message};

/// Create a pair of connected in-memory connections.
///
/// Sending on one delivers to the other, in order, with text and binary
/// frames sharing a single queue the way a real channel would.
pub fn memory_pair() -> (MemoryConnection, MemoryConnection) {
    let (tx_a, rx_b) = mpsc::unbounded_channel();
    let (tx_b, rx_a) = mpsc::unbounded_channel();
    (MemoryConnection::new(tx_a, rx_a), MemoryConnection::new(tx_b, rx_b))
}

/// One end of an in-memory channel pair.
pub struct MemoryConnection {
    tx: mpsc::UnboundedSender<Message>,
    rx: Mutex<mpsc::UnboundedReceiver<Message>>,
    shut: Arc<Shutdown>,
}

struct Shutdown {
    flag: AtomicBool,
    notify: Notify,
}

impl MemoryConnection {
    fn new(tx: mpsc::UnboundedSender<Message>, rx: mpsc::UnboundedReceiver<Message>) -> Self {
        MemoryConnection {
            tx,
            rx: Mutex::new(rx),
            shut: Arc::new(Shutdown {
                flag: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }
}

#[async_trait::async_trait]
impl Connection for MemoryConnection {
    async fn receive(&self) -> std::io::Result<Message> {
        if self.shut.flag.load(Ordering::Acquire) {
            return Ok(Message::Close);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.shut.notify.notified() => Ok(Message::Close),
            msg = rx.recv() => Ok(msg.unwrap_or(Message::Close)),
        }
    }

    fn send(&self, msg: Message) -> bool {
        if self.shut.flag.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send(msg).is_ok()
    }

    async fn flush(&self) -> bool {
        // Delivery is immediate; flushing only reports liveness.
        !self.shut.flag.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    fn buffered_amount(&self) -> usize {
        0
    }

    fn shutdown(&self) {
        self.shut.flag.store(true, Ordering::Release);
        self.shut.notify.notify_one();
    }
}
