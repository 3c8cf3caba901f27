//! One-shot asynchronous value carriers.
//!
//! Every async surface of the peer engine rests on these three shapes:
//!
//! - [`Promise`]/[`Completion`]: a single-value, single-consumer pair.
//!   Dropping the promise without resolving it delivers
//!   [`PeerError::BrokenPromise`] to the waiter.
//! - [`Shared`]: a clone-able completion with any number of waiters, all
//!   observing the same outcome. Binary attachments are `Shared<Bytes>`.
//! - [`Lazy`]: a completion whose producer runs only when the first
//!   waiter polls it. The RPC server surface depends on this: until
//!   somebody actually awaits `rpc_server()`, no promise exists and
//!   incoming calls are answered with an execute error instead of being
//!   silently swallowed.
//!
//! Delivery contract: a waiter registering against an already-settled
//! carrier observes the outcome synchronously; a waiter on a pending
//! carrier is delivered by the resolving thread, exactly once, after the
//! outcome is visible. The `Mutex` around the state gives registration
//! and resolution a total order.

use std::future::Future as StdFuture;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::PeerError;

/// What a carrier settles to.
pub type Outcome<T> = Result<T, PeerError>;

enum Waiter<T> {
    None,
    Task(Waker),
    Callback(Box<dyn FnOnce(Outcome<T>) + Send>),
}

enum State<T> {
    Pending(Waiter<T>),
    Settled(Outcome<T>),
    /// Outcome already handed to the consumer.
    Taken,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    /// The consuming half was dropped while still pending.
    abandoned: std::sync::atomic::AtomicBool,
}

/// Create a connected [`Promise`]/[`Completion`] pair.
pub fn pair<T>() -> (Promise<T>, Completion<T>) {
    let inner = Arc::new(Inner {
        state: Mutex::new(State::Pending(Waiter::None)),
        abandoned: std::sync::atomic::AtomicBool::new(false),
    });
    (
        Promise {
            inner: Some(inner.clone()),
        },
        Completion { inner },
    )
}

/// The resolving half of a one-shot pair.
///
/// A promise is consumed by [`resolve`](Promise::resolve) or
/// [`reject`](Promise::reject); dropping it unresolved breaks the paired
/// [`Completion`].
pub struct Promise<T> {
    inner: Option<Arc<Inner<T>>>,
}

impl<T> Promise<T> {
    /// Settle the pair with a value.
    pub fn resolve(mut self, value: T) {
        if let Some(inner) = self.inner.take() {
            settle(&inner, Ok(value));
        }
    }

    /// Settle the pair with an error.
    pub fn reject(mut self, error: PeerError) {
        if let Some(inner) = self.inner.take() {
            settle(&inner, Err(error));
        }
    }

    /// Whether the consuming half was dropped without taking an outcome.
    /// Settling an abandoned promise discards the value.
    pub fn is_abandoned(&self) -> bool {
        match &self.inner {
            Some(inner) => inner.abandoned.load(std::sync::atomic::Ordering::Acquire),
            None => false,
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            settle(&inner, Err(PeerError::BrokenPromise));
        }
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.inner.is_some() {
            "Promise(armed)"
        } else {
            "Promise(spent)"
        })
    }
}

fn settle<T>(inner: &Inner<T>, outcome: Outcome<T>) {
    let waiter = {
        let mut state = inner.state.lock().unwrap();
        match std::mem::replace(&mut *state, State::Settled(outcome)) {
            State::Pending(waiter) => waiter,
            // A carrier settles at most once; anything else means the
            // promise half was duplicated, which the API forbids.
            other => {
                *state = other;
                return;
            }
        }
    };
    match waiter {
        Waiter::None => {}
        Waiter::Task(waker) => waker.wake(),
        Waiter::Callback(callback) => {
            // The outcome was just stored; take it back out for delivery.
            let outcome = {
                let mut state = inner.state.lock().unwrap();
                match std::mem::replace(&mut *state, State::Taken) {
                    State::Settled(outcome) => outcome,
                    _ => unreachable!("settled state vanished"),
                }
            };
            callback(outcome);
        }
    }
}

/// The consuming half of a one-shot pair.
///
/// Await it, block on it with [`wait`](Completion::wait), or attach a
/// callback with [`on_ready`](Completion::on_ready).
pub struct Completion<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Completion<T> {
    /// Register a callback invoked with the outcome.
    ///
    /// Runs synchronously if the outcome is already known, otherwise on
    /// the resolving thread. The callback must not re-enter the engine in
    /// a way that blocks on the same connection's reader.
    pub fn on_ready(self, callback: impl FnOnce(Outcome<T>) + Send + 'static) {
        let mut state = self.inner.state.lock().unwrap();
        match std::mem::replace(&mut *state, State::Taken) {
            State::Settled(outcome) => {
                drop(state);
                callback(outcome);
            }
            State::Pending(_) => {
                *state = State::Pending(Waiter::Callback(Box::new(callback)));
            }
            State::Taken => {}
        }
    }

    /// Block the current thread until the outcome arrives.
    ///
    /// For synchronous embedders only; never call this from the reader
    /// task or from an async context.
    pub fn wait(self) -> Outcome<T> {
        let unparker = Arc::new(ThreadUnparker {
            thread: std::thread::current(),
        });
        let waker = Waker::from(unparker);
        let mut cx = Context::from_waker(&waker);
        let mut this = self;
        loop {
            match Pin::new(&mut this).poll(&mut cx) {
                Poll::Ready(outcome) => return outcome,
                Poll::Pending => std::thread::park(),
            }
        }
    }
}

struct ThreadUnparker {
    thread: std::thread::Thread,
}

impl std::task::Wake for ThreadUnparker {
    fn wake(self: Arc<Self>) {
        self.thread.unpark();
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        let state = self.inner.state.lock().unwrap();
        // A stored callback still counts as a live waiter.
        if matches!(&*state, State::Pending(Waiter::None) | State::Pending(Waiter::Task(_))) {
            self.inner
                .abandoned
                .store(true, std::sync::atomic::Ordering::Release);
        }
    }
}

impl<T> StdFuture for Completion<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state.lock().unwrap();
        match std::mem::replace(&mut *state, State::Taken) {
            State::Settled(outcome) => Poll::Ready(outcome),
            State::Pending(_) => {
                *state = State::Pending(Waiter::Task(cx.waker().clone()));
                Poll::Pending
            }
            State::Taken => panic!("completion polled after it yielded its outcome"),
        }
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.write_str(match &*state {
            State::Pending(_) => "Completion(pending)",
            State::Settled(_) => "Completion(settled)",
            State::Taken => "Completion(taken)",
        })
    }
}

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

enum SharedState<T> {
    Pending(Vec<Waker>),
    Settled(Outcome<T>),
}

struct SharedInner<T> {
    state: Mutex<SharedState<T>>,
}

/// A clone-able completion: every clone observes the same outcome.
///
/// The outcome type must be `Clone`; attachment slots use
/// `Shared<bytes::Bytes>` so every reader gets the same cheaply cloned
/// buffer.
pub struct Shared<T> {
    inner: Arc<SharedInner<T>>,
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Shared {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Shared<T> {
    /// A shared completion that is already resolved.
    pub fn ready(value: T) -> Self {
        Shared {
            inner: Arc::new(SharedInner {
                state: Mutex::new(SharedState::Settled(Ok(value))),
            }),
        }
    }

    /// Create a connected [`SharedPromise`]/[`Shared`] pair.
    pub fn pair() -> (SharedPromise<T>, Shared<T>) {
        let inner = Arc::new(SharedInner {
            state: Mutex::new(SharedState::Pending(Vec::new())),
        });
        (
            SharedPromise {
                inner: Some(inner.clone()),
            },
            Shared { inner },
        )
    }

    /// The outcome, if already settled.
    pub fn peek(&self) -> Option<Outcome<T>>
    where
        T: Clone,
    {
        match &*self.inner.state.lock().unwrap() {
            SharedState::Settled(outcome) => Some(outcome.clone()),
            SharedState::Pending(_) => None,
        }
    }
}

impl<T: Clone> StdFuture for Shared<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state.lock().unwrap();
        match &mut *state {
            SharedState::Settled(outcome) => Poll::Ready(outcome.clone()),
            SharedState::Pending(wakers) => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl<T> PartialEq for Shared<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> std::fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.write_str(match &*state {
            SharedState::Pending(_) => "Shared(pending)",
            SharedState::Settled(Ok(_)) => "Shared(resolved)",
            SharedState::Settled(Err(_)) => "Shared(rejected)",
        })
    }
}

/// The resolving half of a [`Shared`] pair. Dropping it unresolved breaks
/// every waiter.
pub struct SharedPromise<T> {
    inner: Option<Arc<SharedInner<T>>>,
}

impl<T> SharedPromise<T> {
    /// Settle every current and future waiter with a value.
    pub fn resolve(mut self, value: T) {
        if let Some(inner) = self.inner.take() {
            Self::settle(&inner, Ok(value));
        }
    }

    /// Settle every current and future waiter with an error.
    pub fn reject(mut self, error: PeerError) {
        if let Some(inner) = self.inner.take() {
            Self::settle(&inner, Err(error));
        }
    }

    fn settle(inner: &SharedInner<T>, outcome: Outcome<T>) {
        let wakers = {
            let mut state = inner.state.lock().unwrap();
            match std::mem::replace(&mut *state, SharedState::Settled(outcome)) {
                SharedState::Pending(wakers) => wakers,
                settled => {
                    *state = settled;
                    return;
                }
            }
        };
        for waker in wakers {
            waker.wake();
        }
    }
}

impl<T> Drop for SharedPromise<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            Self::settle(&inner, Err(PeerError::BrokenPromise));
        }
    }
}

impl<T> std::fmt::Debug for SharedPromise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.inner.is_some() {
            "SharedPromise(armed)"
        } else {
            "SharedPromise(spent)"
        })
    }
}

// ---------------------------------------------------------------------------
// Lazy
// ---------------------------------------------------------------------------

/// A completion whose producer runs on first poll.
///
/// Until somebody awaits it, nothing happens: the producer has not been
/// called and no promise exists anywhere.
pub struct Lazy<T> {
    producer: Option<Box<dyn FnOnce(Promise<T>) + Send>>,
    armed: Option<Completion<T>>,
}

impl<T> Lazy<T> {
    /// Wrap a producer that receives the freshly minted promise when the
    /// first waiter arrives.
    pub fn new(producer: impl FnOnce(Promise<T>) + Send + 'static) -> Self {
        Lazy {
            producer: Some(Box::new(producer)),
            armed: None,
        }
    }
}

impl<T> StdFuture for Lazy<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.armed.is_none() {
            let producer = this.producer.take().expect("lazy producer present before arming");
            let (promise, completion) = pair();
            producer(promise);
            this.armed = Some(completion);
        }
        Pin::new(this.armed.as_mut().expect("armed above")).poll(cx)
    }
}

impl<T> std::fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.armed.is_some() {
            "Lazy(armed)"
        } else {
            "Lazy(unarmed)"
        })
    }
}
