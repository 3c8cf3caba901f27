//! The peer engine.
//!
//! A [`Peer`] owns one [`Connection`] and multiplexes four interaction
//! patterns over it: RPC, one-shot callbacks, subscriptions, and
//! attributes, each optionally carrying binary attachments.
//!
//! Concurrency model: a single reader task owns `conn.receive()` and
//! dispatches every frame synchronously. Senders run on any thread; the
//! envelope write and the enqueue of its attachments happen under one
//! send lock so the outbound attachment FIFO matches envelope order. The
//! engine mutex guards the correlation tables and is never held across a
//! send, an await, or an application callback.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use umq_wire::{self as wire, Cmd, Envelope, PROTOCOL_VERSION, codes};

use crate::PeerError;
use crate::config::{CallbackMissPolicy, HwmBehavior, PeerConfig};
use crate::connection::{Connection, Message};
use crate::payload::{Attachment, Callback, CallbackCall, CallbackReply, Id, Payload};
use crate::promise::{self, Completion, Lazy, Promise, SharedPromise};
use crate::subscription::Subscription;

/// One endpoint of a UMQ connection. Cheap to clone; all clones drive
/// the same engine.
#[derive(Clone)]
pub struct Peer {
    core: Arc<Core>,
}

pub(crate) struct Core {
    pub(crate) conn: Arc<dyn Connection>,
    pub(crate) config: PeerConfig,
    state: Mutex<State>,
    /// Serialises envelope emission with the enqueue of its attachments.
    send_lock: Mutex<()>,
    writes_closed: AtomicBool,
    torn_down: AtomicBool,
    outbound_tx: mpsc::UnboundedSender<Attachment>,
    pump: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<Core>,
}

#[derive(Default)]
struct State {
    next_id: Id,
    hello: Option<Promise<Payload>>,
    welcome: Option<Promise<Payload>>,
    rpc_waiter: Option<Promise<Payload>>,
    close_waiter: Option<Promise<()>>,
    close_outcome: Option<Result<(), PeerError>>,
    pending_rpc: HashMap<Id, Promise<Payload>>,
    pending_callbacks: HashMap<Id, Promise<CallbackCall>>,
    subscriptions: HashMap<Id, SubscriptionEntry>,
    topics: HashMap<Id, TopicEntry>,
    attributes: HashMap<String, Payload>,
    inbound_slots: VecDeque<SharedPromise<Bytes>>,
}

/// Subscriber-side state for one subscription id. `Unsubscribed` is a
/// tombstone: it keeps repeated orphan updates from emitting more than
/// one `U` frame per id.
enum SubscriptionEntry {
    Armed(Promise<Payload>),
    Idle,
    Unsubscribed,
}

pub(crate) struct TopicEntry {
    on_unsubscribe: Option<Box<dyn FnOnce() + Send>>,
    hwm_behavior: HwmBehavior,
    hwm_limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseMode {
    None,
    SendClose,
    Shutdown,
}

impl State {
    fn alloc_id(&mut self) -> Id {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl Peer {
    /// Start the client side: send `H<version>:<hello>` and return a
    /// completion that settles with the server's welcome payload, or
    /// rejects with the server's fatal error.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_client(
        conn: impl Connection + 'static,
        hello: &str,
        attachments: Vec<Attachment>,
    ) -> (Peer, Completion<Payload>) {
        Self::start_client_with(PeerConfig::default(), conn, hello, attachments)
    }

    /// [`start_client`](Peer::start_client) with explicit configuration.
    pub fn start_client_with(
        config: PeerConfig,
        conn: impl Connection + 'static,
        hello: &str,
        attachments: Vec<Attachment>,
    ) -> (Peer, Completion<Payload>) {
        let core = Core::new(Arc::new(conn), config);
        let (promise, completion) = promise::pair();
        core.state.lock().unwrap().welcome = Some(promise);
        tokio::spawn(run_reader(core.clone()));
        core.send_envelope(Cmd::Hello, PROTOCOL_VERSION, hello, attachments);
        (Peer { core }, completion)
    }

    /// Start the server side: begin reading and return a completion that
    /// settles with the client's hello payload. The host then calls
    /// [`accept_client`](Peer::accept_client) or
    /// [`reject_client`](Peer::reject_client).
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_server(conn: impl Connection + 'static) -> (Peer, Completion<Payload>) {
        Self::start_server_with(PeerConfig::default(), conn)
    }

    /// [`start_server`](Peer::start_server) with explicit configuration.
    pub fn start_server_with(
        config: PeerConfig,
        conn: impl Connection + 'static,
    ) -> (Peer, Completion<Payload>) {
        let core = Core::new(Arc::new(conn), config);
        let (promise, completion) = promise::pair();
        core.state.lock().unwrap().hello = Some(promise);
        tokio::spawn(run_reader(core.clone()));
        (Peer { core }, completion)
    }

    pub(crate) fn from_core(core: Arc<Core>) -> Peer {
        Peer { core }
    }

    /// Accept a client whose hello arrived via `start_server`.
    pub fn accept_client(&self, message: &str, attachments: Vec<Attachment>) -> bool {
        self.core
            .send_envelope(Cmd::Welcome, PROTOCOL_VERSION, message, attachments)
    }

    /// Reject a client: send fatal code 1 with the given message and
    /// tear the connection down.
    pub fn reject_client(&self, message: &str) {
        let body = format!("{} {}", codes::REJECTED, message);
        self.core.send_envelope(Cmd::Fatal, 0, &body, Vec::new());
        self.core.teardown(Ok(()), CloseMode::SendClose);
    }

    /// A completion that settles when the connection ends: resolved on
    /// orderly close, rejected with the captured error otherwise.
    ///
    /// Only one waiter is active at a time; a second call breaks the
    /// previous waiter. After teardown the outcome is delivered
    /// immediately.
    pub fn close_event(&self) -> Completion<()> {
        let (promise, completion) = promise::pair();
        let previous = {
            let mut st = self.core.state.lock().unwrap();
            if let Some(outcome) = st.close_outcome.clone() {
                drop(st);
                match outcome {
                    Ok(()) => promise.resolve(()),
                    Err(err) => promise.reject(err),
                }
                return completion;
            }
            st.close_waiter.replace(promise)
        };
        drop(previous);
        completion
    }

    /// Perform an RPC call. The completion resolves with the peer's `R`
    /// payload or rejects with the exception / execute error /
    /// disconnect.
    pub fn rpc_call(&self, message: &str, attachments: Vec<Attachment>) -> Completion<Payload> {
        self.call_with_body(message.to_string(), attachments)
    }

    /// Await the next incoming RPC call.
    ///
    /// The returned completion is lazy: until it is first polled, the
    /// engine has no RPC waiter and answers incoming calls with execute
    /// error 6. Call again after each request; there is one RPC server
    /// at a time.
    pub fn rpc_server(&self) -> Lazy<Payload> {
        let weak = Arc::downgrade(&self.core);
        Lazy::new(move |promise| {
            let Some(core) = weak.upgrade() else { return };
            let previous = core.state.lock().unwrap().rpc_waiter.replace(promise);
            drop(previous);
            // Teardown may have drained between the install and here;
            // a waiter it missed must not stay pending.
            if core.torn_down.load(Ordering::Acquire) {
                let stale = core.state.lock().unwrap().rpc_waiter.take();
                drop(stale);
            }
        })
    }

    /// Send the result of an RPC received via [`rpc_server`](Peer::rpc_server).
    pub fn rpc_result(&self, id: Id, response: &str, attachments: Vec<Attachment>) -> bool {
        self.core
            .send_envelope(Cmd::RpcResult, id, response, attachments)
    }

    /// Send an exception for an RPC received via [`rpc_server`](Peer::rpc_server).
    pub fn rpc_exception(&self, id: Id, message: &str) -> bool {
        self.core
            .send_envelope(Cmd::RpcException, id, message, Vec::new())
    }

    /// Reserve a fresh subscription id. Convey it to the peer through an
    /// RPC the peer understands; start listening before the publisher
    /// can send the first update.
    pub fn create_subscription(&self) -> Id {
        self.core.state.lock().unwrap().alloc_id()
    }

    /// Arm a one-shot waiter for the next update on `id`. Call again
    /// after each update; a subscription nobody re-arms is automatically
    /// unsubscribed when the next update arrives.
    pub fn listen_subscription(&self, id: Id) -> Completion<Payload> {
        let (promise, completion) = promise::pair();
        if self.core.torn_down.load(Ordering::Acquire) {
            promise.reject(PeerError::SubscriptionClosed);
            return completion;
        }
        let previous = {
            let mut st = self.core.state.lock().unwrap();
            st.subscriptions.insert(id, SubscriptionEntry::Armed(promise))
        };
        drop(previous);
        if self.core.torn_down.load(Ordering::Acquire) {
            let stale = self.core.state.lock().unwrap().subscriptions.remove(&id);
            if let Some(SubscriptionEntry::Armed(promise)) = stale {
                promise.reject(PeerError::SubscriptionClosed);
            }
        }
        completion
    }

    /// Open the publisher side of a subscription id received from the
    /// peer, with the engine's default high-water-mark policy.
    pub fn begin_publish(&self, id: Id) -> Subscription {
        let behavior = self.core.config.default_hwm_behavior;
        self.begin_publish_with(id, behavior, 0)
    }

    /// Open the publisher side with an explicit back-pressure policy.
    /// A `hwm_size` of zero means the engine default.
    pub fn begin_publish_with(&self, id: Id, behavior: HwmBehavior, hwm_size: usize) -> Subscription {
        let limit = if hwm_size == 0 {
            self.core.config.default_hwm
        } else {
            hwm_size
        };
        self.core.state.lock().unwrap().topics.insert(
            id,
            TopicEntry {
                on_unsubscribe: None,
                hwm_behavior: behavior,
                hwm_limit: limit,
            },
        );
        if self.core.torn_down.load(Ordering::Acquire) {
            self.core.remove_topic(id);
        }
        Subscription::new(Arc::downgrade(&self.core), id)
    }

    /// Mint a one-shot callback: hand [`Callback::id`] to the peer, await
    /// [`Callback::call`] for the invocation.
    pub fn create_callback_call(&self) -> Callback {
        let (promise, completion) = promise::pair();
        let id = {
            let mut st = self.core.state.lock().unwrap();
            let id = st.alloc_id();
            st.pending_callbacks.insert(id, promise);
            id
        };
        if self.core.torn_down.load(Ordering::Acquire) {
            self.cancel_callback_call(id);
        }
        Callback { id, call: completion }
    }

    /// Abandon a callback id. Its completion observes a broken promise.
    pub fn cancel_callback_call(&self, id: Id) {
        let promise = self.core.state.lock().unwrap().pending_callbacks.remove(&id);
        drop(promise);
    }

    /// Invoke a callback id received from the peer. The completion
    /// settles with the callback's reply.
    pub fn rpc_callback_call(
        &self,
        callback_id: Id,
        message: &str,
        attachments: Vec<Attachment>,
    ) -> Completion<Payload> {
        let mut body = wire::id_to_string(callback_id);
        body.push(':');
        body.push_str(message);
        self.call_with_body(body, attachments)
    }

    fn call_with_body(&self, body: String, attachments: Vec<Attachment>) -> Completion<Payload> {
        let (promise, completion) = promise::pair();
        if self.core.torn_down.load(Ordering::Acquire) {
            promise.reject(PeerError::Disconnected);
            return completion;
        }
        let id = {
            let mut st = self.core.state.lock().unwrap();
            let id = st.alloc_id();
            st.pending_rpc.insert(id, promise);
            id
        };
        if !self.core.send_envelope(Cmd::RpcCall, id, &body, attachments) {
            let promise = self.core.state.lock().unwrap().pending_rpc.remove(&id);
            if let Some(promise) = promise {
                promise.reject(PeerError::Disconnected);
            }
        }
        completion
    }

    /// Push an attribute to the peer. Updates are unacknowledged and
    /// visible to any message the peer receives after this one. The name
    /// must not contain `=`, `:` or newlines.
    pub fn set_attribute(&self, name: &str, value: &str, attachments: Vec<Attachment>) -> bool {
        let body = format!("{name}={value}");
        self.core
            .send_envelope(Cmd::AttributeSet, 0, &body, attachments)
    }

    /// Remove an attribute on the peer.
    pub fn clear_attribute(&self, name: &str) -> bool {
        self.core
            .send_envelope(Cmd::AttributeReset, 0, name, Vec::new())
    }

    /// Read the mirror of an attribute the peer pushed to us.
    pub fn get_attribute(&self, name: &str) -> Option<Payload> {
        self.core.state.lock().unwrap().attributes.get(name).cloned()
    }

    /// Wait until the channel's send buffer drains.
    pub async fn flush(&self) -> bool {
        self.core.conn.flush().await
    }

    /// Orderly close: drain every pending operation, then emit the
    /// channel's close message. Idempotent.
    pub fn close(&self) {
        self.core.teardown(Ok(()), CloseMode::SendClose);
    }

    /// Immediate close: like [`close`](Peer::close) but also forces the
    /// receive task to exit without waiting for the peer.
    pub fn shutdown(&self) {
        self.core.teardown(Ok(()), CloseMode::Shutdown);
    }

    /// Whether the engine is still running (no teardown yet).
    pub fn is_connected(&self) -> bool {
        !self.core.torn_down.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Core {
    fn new(conn: Arc<dyn Connection>, config: PeerConfig) -> Arc<Core> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let core = Arc::new_cyclic(|weak| Core {
            conn: conn.clone(),
            config,
            state: Mutex::new(State {
                next_id: 1,
                ..State::default()
            }),
            send_lock: Mutex::new(()),
            writes_closed: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            outbound_tx,
            pump: Mutex::new(None),
            weak_self: weak.clone(),
        });
        let pump = tokio::spawn(run_pump(conn, Arc::downgrade(&core), outbound_rx));
        *core.pump.lock().unwrap() = Some(pump);
        core
    }

    /// Emit one text envelope and enqueue its attachments for the pump.
    pub(crate) fn send_envelope(
        &self,
        cmd: Cmd,
        id: Id,
        body: &str,
        attachments: Vec<Attachment>,
    ) -> bool {
        if self.writes_closed.load(Ordering::Acquire) {
            return false;
        }
        let _guard = self.send_lock.lock().unwrap();
        let line = wire::encode_envelope(attachments.len(), cmd, id, body);
        if !self.conn.send(Message::Text(line)) {
            return false;
        }
        for slot in attachments {
            let _ = self.outbound_tx.send(slot);
        }
        true
    }

    /// Send a fatal frame and return the matching error.
    fn fatal(&self, code: u64) -> PeerError {
        let text = wire::format_error(code);
        self.send_envelope(Cmd::Fatal, 0, &text, Vec::new());
        PeerError::Fatal(text)
    }

    fn process_binary(&self, data: Bytes) {
        let slot = self.state.lock().unwrap().inbound_slots.pop_front();
        match slot {
            Some(promise) => promise.resolve(data),
            None => warn!(len = data.len(), "binary frame with no declared attachment slot"),
        }
    }

    /// Parse one text frame, peeling `A` prefixes into inbound slots,
    /// and dispatch the inner envelope. An error return is fatal: the
    /// `F` frame has already been sent.
    fn process_text(&self, text: &str) -> Result<(), PeerError> {
        let mut attachments = Vec::new();
        let mut frame = text;
        loop {
            let env = match Envelope::parse(frame) {
                Ok(env) => env,
                Err(err) => return Err(self.fatal(err.wire_code())),
            };
            if env.cmd != Cmd::Attachment {
                return self.dispatch(env, attachments);
            }
            if env.id > self.config.max_attachments as u64 {
                warn!(count = env.id, "attachment count above limit");
                return Err(self.fatal(codes::PROTOCOL_ERROR));
            }
            {
                let mut st = self.state.lock().unwrap();
                for _ in 0..env.id {
                    let (promise, slot) = promise::Shared::pair();
                    st.inbound_slots.push_back(promise);
                    attachments.push(slot);
                }
            }
            frame = env.body;
        }
    }

    fn dispatch(&self, env: Envelope<'_>, attachments: Vec<Attachment>) -> Result<(), PeerError> {
        match env.cmd {
            Cmd::Attachment => unreachable!("attachment prefixes are peeled before dispatch"),
            Cmd::AttachmentError => {
                let slot = self.state.lock().unwrap().inbound_slots.pop_front();
                match slot {
                    Some(promise) => {
                        promise.reject(PeerError::AttachmentError(env.body.to_string()))
                    }
                    None => warn!("attachment error frame with no declared slot"),
                }
            }
            Cmd::Fatal => {
                let err = PeerError::Fatal(env.body.to_string());
                let (hello, welcome) = {
                    let mut st = self.state.lock().unwrap();
                    (st.hello.take(), st.welcome.take())
                };
                if let Some(promise) = hello {
                    promise.reject(err.clone());
                }
                if let Some(promise) = welcome {
                    promise.reject(err.clone());
                }
                self.teardown(Err(err), CloseMode::None);
            }
            Cmd::Hello => {
                if env.id < PROTOCOL_VERSION {
                    return Err(self.fatal(codes::UNSUPPORTED_VERSION));
                }
                let waiter = self.state.lock().unwrap().hello.take();
                if let Some(promise) = waiter {
                    promise.resolve(Payload {
                        id: env.id,
                        text: env.body.to_string(),
                        attachments,
                    });
                }
            }
            Cmd::Welcome => {
                if env.id < PROTOCOL_VERSION {
                    return Err(self.fatal(codes::UNSUPPORTED_VERSION));
                }
                let waiter = self.state.lock().unwrap().welcome.take();
                if let Some(promise) = waiter {
                    promise.resolve(Payload {
                        id: env.id,
                        text: env.body.to_string(),
                        attachments,
                    });
                }
            }
            Cmd::RpcCall => return self.process_rpc_call(env.id, env.body, attachments),
            Cmd::CallbackCall => {
                let Some((prefix, body)) = env.body.split_once(':') else {
                    return Err(self.fatal(codes::PROTOCOL_ERROR));
                };
                let cb_id = match wire::decode_id(prefix) {
                    Ok(id) => id,
                    Err(err) => return Err(self.fatal(err.wire_code())),
                };
                return self.invoke_callback(env.id, cb_id, body, attachments);
            }
            Cmd::RpcResult => {
                if let Some(promise) = self.take_rpc_waiter(env.id, "result") {
                    promise.resolve(Payload {
                        id: env.id,
                        text: env.body.to_string(),
                        attachments,
                    });
                }
            }
            Cmd::RpcException => {
                if let Some(promise) = self.take_rpc_waiter(env.id, "exception") {
                    promise.reject(PeerError::Exception(env.body.to_string()));
                }
            }
            Cmd::RpcError => {
                if let Some(promise) = self.take_rpc_waiter(env.id, "execute error") {
                    promise.reject(PeerError::ExecuteError(env.body.to_string()));
                }
            }
            Cmd::TopicUpdate => self.process_topic_update(env.id, env.body, attachments),
            Cmd::TopicClose => {
                let entry = self.state.lock().unwrap().subscriptions.remove(&env.id);
                if let Some(SubscriptionEntry::Armed(promise)) = entry {
                    promise.reject(PeerError::SubscriptionClosed);
                }
            }
            Cmd::TopicUnsubscribe => {
                let entry = self.state.lock().unwrap().topics.remove(&env.id);
                if let Some(entry) = entry {
                    if let Some(handler) = entry.on_unsubscribe {
                        handler();
                    }
                }
            }
            Cmd::AttributeSet => {
                let Some((name, value)) = env.body.split_once('=') else {
                    return Err(self.fatal(codes::PROTOCOL_ERROR));
                };
                self.state.lock().unwrap().attributes.insert(
                    name.to_string(),
                    Payload {
                        id: 0,
                        text: value.to_string(),
                        attachments,
                    },
                );
            }
            Cmd::AttributeReset => {
                self.state.lock().unwrap().attributes.remove(env.body);
            }
        }
        Ok(())
    }

    /// Pull the pending entry for a reply frame. Unknown ids and replies
    /// whose caller walked away are both expected after cancellation.
    fn take_rpc_waiter(&self, id: Id, kind: &'static str) -> Option<Promise<Payload>> {
        let waiter = self.state.lock().unwrap().pending_rpc.remove(&id);
        match waiter {
            Some(promise) => {
                if promise.is_abandoned() && self.config.log_unmatched_responses {
                    debug!(id, kind, "discarding reply for an abandoned call");
                }
                Some(promise)
            }
            None => {
                debug!(id, kind, "reply for unknown call id");
                None
            }
        }
    }

    fn process_rpc_call(
        &self,
        id: Id,
        body: &str,
        attachments: Vec<Attachment>,
    ) -> Result<(), PeerError> {
        // A body with a `<cb36>:` prefix naming a live callback id is a
        // callback invocation; anything else goes to the RPC server.
        if let Some((prefix, rest)) = body.split_once(':') {
            if let Ok(cb_id) = wire::decode_id(prefix) {
                let target = self.state.lock().unwrap().pending_callbacks.remove(&cb_id);
                if let Some(promise) = target {
                    self.deliver_callback(id, promise, rest, attachments);
                    return Ok(());
                }
            }
        }
        let waiter = self.state.lock().unwrap().rpc_waiter.take();
        match waiter {
            Some(promise) => promise.resolve(Payload {
                id,
                text: body.to_string(),
                attachments,
            }),
            None => {
                self.send_envelope(
                    Cmd::RpcError,
                    id,
                    &wire::format_error(codes::NO_RPC_SERVER),
                    Vec::new(),
                );
            }
        }
        Ok(())
    }

    fn invoke_callback(
        &self,
        id: Id,
        cb_id: Id,
        body: &str,
        attachments: Vec<Attachment>,
    ) -> Result<(), PeerError> {
        let target = self.state.lock().unwrap().pending_callbacks.remove(&cb_id);
        match target {
            Some(promise) => {
                self.deliver_callback(id, promise, body, attachments);
                Ok(())
            }
            None => match self.config.callback_miss {
                CallbackMissPolicy::FatalError => Err(self.fatal(codes::CALLBACK_NOT_FOUND)),
                CallbackMissPolicy::Exception => {
                    self.send_envelope(
                        Cmd::RpcException,
                        id,
                        &wire::format_error(codes::CALLBACK_NOT_FOUND),
                        Vec::new(),
                    );
                    Ok(())
                }
            },
        }
    }

    fn deliver_callback(
        &self,
        id: Id,
        target: Promise<CallbackCall>,
        body: &str,
        attachments: Vec<Attachment>,
    ) {
        let (responder, reply) = promise::pair::<CallbackReply>();
        let weak = self.weak_self.clone();
        reply.on_ready(move |outcome| {
            let Some(core) = weak.upgrade() else { return };
            match outcome {
                Ok(reply) => {
                    core.send_envelope(Cmd::RpcResult, id, &reply.text, reply.attachments);
                }
                Err(err) => {
                    core.send_envelope(Cmd::RpcException, id, &reply_text(&err), Vec::new());
                }
            }
        });
        target.resolve(CallbackCall {
            payload: Payload {
                id,
                text: body.to_string(),
                attachments,
            },
            responder,
        });
    }

    fn process_topic_update(&self, id: Id, body: &str, attachments: Vec<Attachment>) {
        enum Action {
            Deliver(Promise<Payload>),
            Unsubscribe,
            Ignore,
        }
        let action = {
            let mut st = self.state.lock().unwrap();
            match st.subscriptions.get_mut(&id) {
                Some(entry) => match std::mem::replace(entry, SubscriptionEntry::Idle) {
                    SubscriptionEntry::Armed(promise) => Action::Deliver(promise),
                    SubscriptionEntry::Idle => {
                        *entry = SubscriptionEntry::Unsubscribed;
                        Action::Unsubscribe
                    }
                    SubscriptionEntry::Unsubscribed => {
                        *entry = SubscriptionEntry::Unsubscribed;
                        Action::Ignore
                    }
                },
                None => {
                    st.subscriptions.insert(id, SubscriptionEntry::Unsubscribed);
                    Action::Unsubscribe
                }
            }
        };
        match action {
            Action::Deliver(promise) => promise.resolve(Payload {
                id,
                text: body.to_string(),
                attachments,
            }),
            Action::Unsubscribe => {
                debug!(id, "topic update with no listener, unsubscribing");
                self.send_envelope(Cmd::TopicUnsubscribe, id, "", Vec::new());
            }
            Action::Ignore => debug!(id, "topic update after unsubscribe"),
        }
    }

    pub(crate) fn topic_params(&self, id: Id) -> Option<(HwmBehavior, usize)> {
        let st = self.state.lock().unwrap();
        st.topics.get(&id).map(|t| (t.hwm_behavior, t.hwm_limit))
    }

    pub(crate) fn topic_live(&self, id: Id) -> bool {
        self.state.lock().unwrap().topics.contains_key(&id)
    }

    pub(crate) fn set_unsubscribe_handler(
        &self,
        id: Id,
        handler: Box<dyn FnOnce() + Send>,
    ) -> bool {
        let mut st = self.state.lock().unwrap();
        match st.topics.get_mut(&id) {
            Some(entry) => {
                entry.on_unsubscribe = Some(handler);
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove_topic(&self, id: Id) -> bool {
        self.state.lock().unwrap().topics.remove(&id).is_some()
    }

    /// Exactly-once teardown: stop writes, drain every table, settle the
    /// close event, then apply the close mode. Draining happens under the
    /// engine mutex into locals; promises settle outside it.
    pub(crate) fn teardown(&self, reason: Result<(), PeerError>, mode: CloseMode) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            if mode == CloseMode::Shutdown {
                self.conn.shutdown();
            }
            return;
        }
        self.writes_closed.store(true, Ordering::Release);

        let mut st = self.state.lock().unwrap();
        st.close_outcome = Some(reason.clone());
        let pending_rpc = std::mem::take(&mut st.pending_rpc);
        let pending_callbacks = std::mem::take(&mut st.pending_callbacks);
        let subscriptions = std::mem::take(&mut st.subscriptions);
        let topics = std::mem::take(&mut st.topics);
        let inbound_slots = std::mem::take(&mut st.inbound_slots);
        let hello = st.hello.take();
        let welcome = st.welcome.take();
        let rpc_waiter = st.rpc_waiter.take();
        let close_waiter = st.close_waiter.take();
        drop(st);

        for (_, promise) in pending_rpc {
            promise.reject(PeerError::Disconnected);
        }
        drop(pending_callbacks);
        for (_, entry) in subscriptions {
            if let SubscriptionEntry::Armed(promise) = entry {
                promise.reject(PeerError::SubscriptionClosed);
            }
        }
        for (_, entry) in topics {
            if let Some(handler) = entry.on_unsubscribe {
                handler();
            }
        }
        for promise in inbound_slots {
            promise.reject(PeerError::Disconnected);
        }
        drop(hello);
        drop(welcome);
        drop(rpc_waiter);
        if let Some(promise) = close_waiter {
            match &reason {
                Ok(()) => promise.resolve(()),
                Err(err) => promise.reject(err.clone()),
            }
        }

        if let Some(pump) = self.pump.lock().unwrap().take() {
            pump.abort();
        }

        match mode {
            CloseMode::SendClose => {
                self.conn.send(Message::Close);
            }
            CloseMode::Shutdown => self.conn.shutdown(),
            CloseMode::None => {}
        }
    }
}

/// Error text to put on the wire for a rejection.
fn reply_text(err: &PeerError) -> String {
    match err {
        PeerError::Exception(payload) | PeerError::AttachmentError(payload) => payload.clone(),
        other => other.to_string(),
    }
}

/// The reader task: sole owner of `conn.receive()`, dispatching each
/// frame synchronously.
async fn run_reader(core: Arc<Core>) {
    let outcome = loop {
        match core.conn.receive().await {
            Ok(Message::Text(text)) => {
                if let Err(fatal) = core.process_text(&text) {
                    break Err(fatal);
                }
            }
            Ok(Message::Binary(bytes)) => core.process_binary(bytes),
            Ok(Message::Close) => break Ok(()),
            Err(err) => break Err(PeerError::Transport(err.to_string())),
        }
    };
    core.teardown(outcome, CloseMode::None);
}

/// The outbound attachment pump: awaits each enqueued slot in FIFO order
/// and emits one binary frame per slot, a `-` frame for rejected slots.
/// A failed channel send discards the whole queue and tears down.
async fn run_pump(
    conn: Arc<dyn Connection>,
    core: Weak<Core>,
    mut queue: mpsc::UnboundedReceiver<Attachment>,
) {
    while let Some(slot) = queue.recv().await {
        match slot.await {
            Ok(bytes) => {
                if conn.send(Message::Binary(bytes)) && conn.flush().await {
                    continue;
                }
                queue.close();
                while queue.try_recv().is_ok() {}
                if let Some(core) = core.upgrade() {
                    core.teardown(Err(PeerError::Disconnected), CloseMode::None);
                }
                return;
            }
            Err(err) => {
                let Some(core) = core.upgrade() else { return };
                core.send_envelope(Cmd::AttachmentError, 0, &reply_text(&err), Vec::new());
            }
        }
    }
}
