//! A [`Connection`] over any framed byte stream.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

use umq_peer::{Connection, Message};

use crate::framing::{FRAME_HEADER_LEN, FrameKind, read_frame, write_frame};

/// A UMQ connection over a byte stream.
///
/// Splits the stream: a writer task owns the write half and drains a
/// send queue, tracking the buffered byte count for the engine's
/// high-water-mark policy; the read half serves `receive`.
pub struct StreamConnection {
    tx: mpsc::UnboundedSender<Message>,
    reader: Mutex<Box<dyn AsyncRead + Send + Unpin>>,
    shared: Arc<Shared>,
    writer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    /// Bytes enqueued but not yet written out.
    buffered: AtomicUsize,
    /// Writer task gone (error or queue closed).
    dead: AtomicBool,
    /// Notified whenever the writer makes progress or dies.
    progress: Notify,
    /// Shutdown requested.
    shut_flag: AtomicBool,
    shut: Notify,
}

fn frame_cost(msg: &Message) -> usize {
    let payload = match msg {
        Message::Text(text) => text.len(),
        Message::Binary(bytes) => bytes.len(),
        Message::Close => 0,
    };
    payload + FRAME_HEADER_LEN
}

impl StreamConnection {
    /// Wrap a byte stream. Must be called from within a tokio runtime.
    pub fn new<S>(stream: S) -> StreamConnection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            buffered: AtomicUsize::new(0),
            dead: AtomicBool::new(false),
            progress: Notify::new(),
            shut_flag: AtomicBool::new(false),
            shut: Notify::new(),
        });
        let writer = tokio::spawn(writer_loop(write_half, rx, shared.clone()));
        StreamConnection {
            tx,
            reader: Mutex::new(Box::new(read_half) as Box<dyn AsyncRead + Send + Unpin>),
            shared,
            writer: std::sync::Mutex::new(Some(writer)),
        }
    }
}

async fn writer_loop<W>(
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<Message>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Send + Unpin,
{
    use tokio::io::AsyncWriteExt;

    while let Some(msg) = queue.recv().await {
        let cost = frame_cost(&msg);
        let result = match &msg {
            Message::Text(text) => write_frame(&mut writer, FrameKind::Text, text.as_bytes()).await,
            Message::Binary(bytes) => write_frame(&mut writer, FrameKind::Binary, bytes).await,
            Message::Close => write_frame(&mut writer, FrameKind::Close, b"").await,
        };
        shared.buffered.fetch_sub(cost, Ordering::AcqRel);
        let result = match result {
            Ok(()) if queue.is_empty() => writer.flush().await,
            other => other.map(|_| ()),
        };
        if let Err(err) = result {
            debug!(error = %err, "stream writer failed");
            break;
        }
        shared.progress.notify_waiters();
    }
    shared.dead.store(true, Ordering::Release);
    shared.progress.notify_waiters();
}

#[async_trait::async_trait]
impl Connection for StreamConnection {
    async fn receive(&self) -> io::Result<Message> {
        if self.shared.shut_flag.load(Ordering::Acquire) {
            return Ok(Message::Close);
        }
        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = self.shared.shut.notified() => Ok(Message::Close),
            frame = read_frame(&mut *reader) => match frame? {
                None => Ok(Message::Close),
                Some((FrameKind::Close, _)) => Ok(Message::Close),
                Some((FrameKind::Binary, payload)) => Ok(Message::Binary(Bytes::from(payload))),
                Some((FrameKind::Text, payload)) => match String::from_utf8(payload) {
                    Ok(text) => Ok(Message::Text(text)),
                    Err(_) => Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "text frame is not valid utf-8",
                    )),
                },
            },
        }
    }

    fn send(&self, msg: Message) -> bool {
        if self.shared.dead.load(Ordering::Acquire) || self.shared.shut_flag.load(Ordering::Acquire)
        {
            return false;
        }
        self.shared.buffered.fetch_add(frame_cost(&msg), Ordering::AcqRel);
        if self.tx.send(msg).is_err() {
            // Writer already gone; the count no longer matters.
            return false;
        }
        true
    }

    async fn flush(&self) -> bool {
        loop {
            let progress = self.shared.progress.notified();
            tokio::pin!(progress);
            progress.as_mut().enable();
            if self.shared.dead.load(Ordering::Acquire) {
                return false;
            }
            if self.shared.buffered.load(Ordering::Acquire) == 0 {
                return true;
            }
            progress.await;
        }
    }

    fn buffered_amount(&self) -> usize {
        self.shared.buffered.load(Ordering::Acquire)
    }

    fn shutdown(&self) {
        self.shared.shut_flag.store(true, Ordering::Release);
        self.shared.shut.notify_one();
        self.shared.dead.store(true, Ordering::Release);
        self.shared.progress.notify_waiters();
        if let Some(writer) = self.writer.lock().unwrap().take() {
            writer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn pipe_pair() -> (StreamConnection, StreamConnection) {
        let (a, b) = duplex(64 * 1024);
        (StreamConnection::new(a), StreamConnection::new(b))
    }

    #[tokio::test]
    async fn text_and_binary_cross_in_order() {
        let (a, b) = pipe_pair();
        assert!(a.send(Message::Text("C1:ping".into())));
        assert!(a.send(Message::Binary(Bytes::from_static(b"\x01\x02"))));
        assert_eq!(b.receive().await.unwrap(), Message::Text("C1:ping".into()));
        assert_eq!(
            b.receive().await.unwrap(),
            Message::Binary(Bytes::from_static(b"\x01\x02"))
        );
    }

    #[tokio::test]
    async fn close_frame_and_eof_both_close() {
        let (a, b) = pipe_pair();
        assert!(a.send(Message::Close));
        assert_eq!(b.receive().await.unwrap(), Message::Close);

        let (c, d) = pipe_pair();
        c.shutdown();
        drop(c);
        assert_eq!(d.receive().await.unwrap(), Message::Close);
    }

    #[tokio::test]
    async fn flush_drains_the_queue() {
        let (a, b) = pipe_pair();
        for i in 0..100 {
            assert!(a.send(Message::Text(format!("T{i}:tick"))));
        }
        assert!(a.flush().await);
        assert_eq!(a.buffered_amount(), 0);
        for _ in 0..100 {
            assert!(matches!(b.receive().await.unwrap(), Message::Text(_)));
        }
    }

    #[tokio::test]
    async fn send_after_shutdown_fails() {
        let (a, _b) = pipe_pair();
        a.shutdown();
        assert!(!a.send(Message::Text("C1:x".into())));
        assert!(!a.flush().await);
    }

    #[tokio::test]
    async fn invalid_utf8_text_frame_is_an_error() {
        let (mut raw, peer) = duplex(1024);
        let conn = StreamConnection::new(peer);
        write_frame(&mut raw, FrameKind::Text, &[0xff, 0xfe]).await.unwrap();
        let err = conn.receive().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
