//! Error taxonomy for the peer engine.
//!
//! Protocol errors are fatal: an `F` frame goes out and the engine tears
//! down. Application exceptions (`E`) and execute errors (`!`) complete a
//! single request and nothing more. Everything pending at teardown is
//! settled with [`PeerError::Disconnected`], a subscription-specific
//! [`PeerError::SubscriptionClosed`], or a broken promise, so callers can
//! tell "the remote said no" from "the connection died".

/// Error delivered through any of the engine's completions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// The remote answered an RPC with an exception (`E` frame). The
    /// payload conventionally starts with `"<code> "`; see
    /// [`code`](PeerError::code) and [`message`](PeerError::message).
    Exception(String),
    /// The remote could not execute or route the RPC (`!` frame).
    ExecuteError(String),
    /// A fatal protocol error (`F` frame), sent or received.
    Fatal(String),
    /// The sender failed to produce an attachment; carries the error text
    /// from the `-` frame.
    AttachmentError(String),
    /// The publisher closed the subscription.
    SubscriptionClosed,
    /// The connection died while this operation was pending.
    Disconnected,
    /// The resolving half was dropped without settling.
    BrokenPromise,
    /// A message id was not valid base 36.
    InvalidId,
    /// The underlying channel failed; carries the transport's own error
    /// text. Surfaces through `close_event()` only.
    Transport(String),
}

impl PeerError {
    /// The numeric code of a `"<code> <message>"` payload, or 0 when the
    /// variant carries none.
    pub fn code(&self) -> u64 {
        match self.payload() {
            Some(payload) => umq_wire::parse_error(payload).0,
            None => 0,
        }
    }

    /// The human-readable part of the error.
    pub fn message(&self) -> &str {
        match self.payload() {
            Some(payload) => umq_wire::parse_error(payload).1,
            None => match self {
                PeerError::SubscriptionClosed => "subscription closed",
                PeerError::Disconnected => "disconnected",
                PeerError::BrokenPromise => "broken promise",
                _ => "invalid message id format",
            },
        }
    }

    fn payload(&self) -> Option<&str> {
        match self {
            PeerError::Exception(p)
            | PeerError::ExecuteError(p)
            | PeerError::Fatal(p)
            | PeerError::AttachmentError(p)
            | PeerError::Transport(p) => Some(p),
            _ => None,
        }
    }
}

impl From<umq_wire::ParseError> for PeerError {
    fn from(_: umq_wire::ParseError) -> Self {
        PeerError::InvalidId
    }
}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerError::Exception(p) => write!(f, "rpc exception: {p}"),
            PeerError::ExecuteError(p) => write!(f, "rpc execute error: {p}"),
            PeerError::Fatal(p) => write!(f, "fatal protocol error: {p}"),
            PeerError::AttachmentError(p) => write!(f, "attachment error: {p}"),
            PeerError::SubscriptionClosed => write!(f, "subscription closed"),
            PeerError::Disconnected => write!(f, "disconnected"),
            PeerError::BrokenPromise => write!(f, "broken promise"),
            PeerError::InvalidId => write!(f, "invalid message id format"),
            PeerError::Transport(p) => write!(f, "transport error: {p}"),
        }
    }
}

impl std::error::Error for PeerError {}
