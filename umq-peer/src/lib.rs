#![deny(unsafe_code)]

//! Symmetric peer-to-peer message engine over one framed bidirectional
//! channel.
//!
//! Each endpoint is a [`Peer`] that plays client and server at once and
//! multiplexes four interaction patterns over a single [`Connection`]:
//!
//! - **RPC**: [`Peer::rpc_call`] on one side, [`Peer::rpc_server`] plus
//!   [`Peer::rpc_result`]/[`Peer::rpc_exception`] on the other.
//! - **Callbacks**: one-shot reverse RPC. Mint an id with
//!   [`Peer::create_callback_call`], hand it to the peer inside any
//!   payload, and the peer invokes it with [`Peer::rpc_callback_call`].
//! - **Subscriptions**: the subscriber mints an id
//!   ([`Peer::create_subscription`]) and listens
//!   ([`Peer::listen_subscription`]); the publisher opens it with
//!   [`Peer::begin_publish`] and streams updates, under a per-topic
//!   high-water-mark policy.
//! - **Attributes**: key/value state pushed to the peer with
//!   [`Peer::set_attribute`] and mirrored on arrival.
//!
//! Every pattern can carry binary [`Attachment`]s that travel out of
//! band as binary frames but stay correlated with their envelope in
//! strict FIFO order.
//!
//! ```
//! use umq_peer::{memory::memory_pair, Peer};
//!
//! async fn handshake() {
//!     let (a, b) = memory_pair();
//!     let (_client, welcome) = Peer::start_client(a, "hi", Vec::new());
//!     let (server, hello) = Peer::start_server(b);
//!     let hello = hello.await.unwrap();
//!     assert_eq!(hello.text, "hi");
//!     server.accept_client("ok", Vec::new());
//!     assert_eq!(welcome.await.unwrap().text, "ok");
//! }
//! ```

pub mod memory;
pub mod promise;

mod config;
mod connection;
mod errors;
mod payload;
mod peer;
mod subscription;

pub use config::{CallbackMissPolicy, HwmBehavior, PeerConfig};
pub use connection::{Connection, Message};
pub use errors::PeerError;
pub use payload::{
    Attachment, AttachmentPromise, Callback, CallbackCall, CallbackReply, Id, Payload, attachment,
    ready_attachment,
};
pub use peer::Peer;
pub use subscription::Subscription;

pub use umq_wire::PROTOCOL_VERSION;
