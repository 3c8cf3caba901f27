//! Message payloads and attachment slots.

use bytes::Bytes;

use crate::promise::{self, Completion, Promise, Shared, SharedPromise};

/// Per-connection message identifier, base-36 encoded on the wire.
pub type Id = u64;

/// One binary attachment slot: a shared one-shot carrier of bytes.
///
/// The sender may charge a slot long after its envelope went out; the
/// receiver may read it long after it arrived. Clones observe the same
/// outcome.
pub type Attachment = Shared<Bytes>;

/// The charging half of a deferred attachment slot.
pub type AttachmentPromise = SharedPromise<Bytes>;

/// Create an attachment slot to be charged later.
///
/// The [`Attachment`] goes into an outgoing payload; the returned promise
/// is resolved (or rejected, or dropped) whenever the bytes are ready.
pub fn attachment() -> (AttachmentPromise, Attachment) {
    Shared::pair()
}

/// One decoded message: the id from the envelope header, the body text,
/// and any attachment slots announced for it.
///
/// The meaning of `id` depends on the frame: the request id of an RPC,
/// the subscription id of a topic update, the peer's protocol version for
/// hello/welcome.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    pub id: Id,
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl Payload {
    /// A payload with no attachments.
    pub fn new(id: Id, text: impl Into<String>) -> Self {
        Payload {
            id,
            text: text.into(),
            attachments: Vec::new(),
        }
    }
}

/// Reply to a callback invocation, fed to [`CallbackCall::responder`].
#[derive(Debug, Default)]
pub struct CallbackReply {
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl CallbackReply {
    /// A reply with no attachments.
    pub fn new(text: impl Into<String>) -> Self {
        CallbackReply {
            text: text.into(),
            attachments: Vec::new(),
        }
    }
}

/// An invocation of a previously handed-out callback id.
///
/// Resolving `responder` sends an `R` frame back to the invoker;
/// rejecting it (or dropping it) sends an `E` frame.
#[derive(Debug)]
pub struct CallbackCall {
    pub payload: Payload,
    pub responder: Promise<CallbackReply>,
}

/// A freshly minted one-shot callback.
///
/// Hand `id` to the remote peer inside some RPC payload; `call` settles
/// when the peer invokes that id.
#[derive(Debug)]
pub struct Callback {
    pub id: Id,
    pub call: Completion<CallbackCall>,
}

/// Convenience: an attachment that is already charged.
pub fn ready_attachment(bytes: impl Into<Bytes>) -> Attachment {
    promise::Shared::ready(bytes.into())
}
