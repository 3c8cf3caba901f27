//! The channel capability the engine consumes.
//!
//! Anything that can move discrete text and binary messages in order
//! (a WebSocket, a length-prefixed TCP stream, an in-process queue)
//! implements [`Connection`]. The engine never sees framing, TLS, or
//! sockets; it sees exactly this surface.

use bytes::Bytes;

/// One message on the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A UTF-8 text frame carrying one envelope.
    Text(String),
    /// A binary frame carrying one attachment payload.
    Binary(Bytes),
    /// The channel closed; the last message of the stream.
    Close,
}

/// A message-oriented, framed, bidirectional channel.
///
/// `receive` is called serially by the engine's single reader task and
/// never concurrently with itself. `send` may be called from any thread;
/// it enqueues synchronously and must preserve per-kind ordering.
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    /// Receive the next message. Resolves with [`Message::Close`] when
    /// the peer closed the channel in an orderly way; errors mean the
    /// transport failed.
    async fn receive(&self) -> std::io::Result<Message>;

    /// Enqueue a message for sending. Returns `false` when the channel
    /// is dead and the message was not accepted.
    fn send(&self, msg: Message) -> bool;

    /// Resolves when the send buffer is empty; `false` on failure.
    async fn flush(&self) -> bool;

    /// Bytes currently buffered for sending. Drives the publisher's
    /// high-water-mark policy.
    fn buffered_amount(&self) -> usize;

    /// Best-effort cancel of any pending receive and a hard close. After
    /// this the channel cannot be used again, not even to send a close.
    fn shutdown(&self);
}
