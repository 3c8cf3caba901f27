//! Publisher-side topic handle.

use std::sync::Weak;

use crate::config::HwmBehavior;
use crate::payload::{Attachment, Id};
use crate::peer::{CloseMode, Core, Peer};

use umq_wire::Cmd;

/// One topic opened with [`Peer::begin_publish`].
///
/// Holds a weak reference into the engine: a subscription never keeps a
/// dead connection alive, and every operation on a gone engine reports
/// failure instead of panicking.
pub struct Subscription {
    core: Weak<Core>,
    id: Id,
}

impl Subscription {
    pub(crate) fn new(core: Weak<Core>, id: Id) -> Self {
        Subscription { core, id }
    }

    /// The subscription id, as minted by the subscriber.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Whether the topic is still live: not closed, not unsubscribed,
    /// connection up.
    pub fn check(&self) -> bool {
        match self.core.upgrade() {
            Some(core) => core.topic_live(self.id),
            None => false,
        }
    }

    /// Register a handler invoked when the subscriber unsubscribes or
    /// the connection dies. Returns `false` if the topic already ended.
    pub fn on_unsubscribe(&self, handler: impl FnOnce() + Send + 'static) -> bool {
        match self.core.upgrade() {
            Some(core) => core.set_unsubscribe_handler(self.id, Box::new(handler)),
            None => false,
        }
    }

    /// Publish one update.
    ///
    /// Returns `false` when the topic has ended (peer unsubscribed,
    /// topic closed, connection dead). When the channel's buffered byte
    /// count is above the topic's high-water mark, the configured
    /// [`HwmBehavior`] applies first.
    pub async fn publish(&self, data: &str, attachments: Vec<Attachment>) -> bool {
        let Some(core) = self.core.upgrade() else {
            return false;
        };
        let Some((behavior, limit)) = core.topic_params(self.id) else {
            return false;
        };
        if core.conn.buffered_amount() > limit {
            match behavior {
                HwmBehavior::Skip => return true,
                HwmBehavior::Ignore => {}
                HwmBehavior::Block => {
                    if !core.conn.flush().await {
                        return false;
                    }
                    // The topic may have ended while we were waiting.
                    if !core.topic_live(self.id) {
                        return false;
                    }
                }
                HwmBehavior::Unsubscribe => {
                    if core.remove_topic(self.id) {
                        core.send_envelope(Cmd::TopicClose, self.id, "", Vec::new());
                    }
                    return false;
                }
                HwmBehavior::Close => {
                    core.teardown(Ok(()), CloseMode::SendClose);
                    return false;
                }
            }
        }
        core.send_envelope(Cmd::TopicUpdate, self.id, data, attachments)
    }

    /// Close the topic from the publisher side: the subscriber sees
    /// `SubscriptionClosed`. Idempotent; a second close is a no-op.
    pub fn close(&self) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        if core.remove_topic(self.id) {
            core.send_envelope(Cmd::TopicClose, self.id, "", Vec::new());
        }
    }

    /// The peer this topic publishes through, if the engine is still
    /// around.
    pub fn peer(&self) -> Option<Peer> {
        self.core.upgrade().map(Peer::from_core)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("live", &self.check())
            .finish()
    }
}
