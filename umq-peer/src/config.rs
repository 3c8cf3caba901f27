//! Per-engine configuration.

/// What a publisher does when the channel's buffered byte count is above
/// the topic's high-water mark at publish time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HwmBehavior {
    /// Drop this update and report success.
    #[default]
    Skip,
    /// Await a flush of the send buffer, then send.
    Block,
    /// Send anyway, letting the buffer grow.
    Ignore,
    /// Close the topic (`D` frame) and report failure.
    Unsubscribe,
    /// Tear the whole connection down.
    Close,
}

/// What the engine does with a callback invocation whose id is unknown
/// or already consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallbackMissPolicy {
    /// Send a fatal `F` frame (code 2) and tear down.
    #[default]
    FatalError,
    /// Answer that call with `E<id>:2 Callback not found` and carry on.
    Exception,
}

/// Engine configuration. One per peer; there is no process-wide state.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Default high-water mark in bytes for topics that do not set their
    /// own.
    pub default_hwm: usize,
    /// Default back-pressure behavior for `begin_publish`.
    pub default_hwm_behavior: HwmBehavior,
    /// Policy for callback invocations naming an unknown id.
    pub callback_miss: CallbackMissPolicy,
    /// Log (at debug level) replies that arrive for calls nobody is
    /// waiting on anymore. Off by default; such replies are expected when
    /// a caller abandons its completion.
    pub log_unmatched_responses: bool,
    /// Upper bound on the attachment count a single `A` prefix may
    /// announce. Larger counts are a protocol error.
    pub max_attachments: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            default_hwm: 64 * 1024,
            default_hwm_behavior: HwmBehavior::Skip,
            callback_miss: CallbackMissPolicy::FatalError,
            log_unmatched_responses: false,
            max_attachments: 1024,
        }
    }
}
