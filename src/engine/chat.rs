//! The conversation engine: busy/idle phase machine, inbound dispatch,
//! send gating, cancellation, and the unhandled fan-out.

use crate::error::ChatError;
use crate::expect::Expectation;
use crate::host::{TimerHandle, TimerHost, TimerKind, TimerToken, Transport};
use crate::matcher::{is_matched, match_token, MatchSpec};
use crate::registry::Registry;
use serde_json::Value;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::time::Duration;

/// Default receive timeout.
pub const DFLT_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-instance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Default receive timeout, in seconds, used when a `receive` or `cmd`
    /// supplies none.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    /// Log every token and phase transition at debug level.
    #[serde(default)]
    pub debug: bool,
}

fn default_timeout_secs() -> f64 {
    DFLT_TIMEOUT.as_secs_f64()
}

impl Default for ChatConfig {
    fn default() -> Self {
        ChatConfig {
            timeout_secs: default_timeout_secs(),
            debug: false,
        }
    }
}

impl ChatConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }
}

/// What a receive handler asks the engine to do next.
pub enum Verdict {
    /// Stay attached and see the next token.
    Repeat,
    /// Replace the attached handler with this one.
    Swap(OnData),
    /// Complete the receive with this value.
    Done(Value),
}

impl std::fmt::Debug for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Repeat => write!(f, "Repeat"),
            Verdict::Swap(_) => write!(f, "Swap(..)"),
            Verdict::Done(v) => f.debug_tuple("Done").field(v).finish(),
        }
    }
}

/// Payload delivered to a completion callback on success.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Value produced by the receive handler or an explicit `stop`.
    Data(Value),
    /// The wait timer ran out, which is how a `wait` normally ends.
    WaitOver,
}

impl Reply {
    /// The carried value; `Null` for [`Reply::WaitOver`].
    pub fn into_value(self) -> Value {
        match self {
            Reply::Data(v) => v,
            Reply::WaitOver => Value::Null,
        }
    }
}

impl From<Value> for Reply {
    fn from(v: Value) -> Self {
        Reply::Data(v)
    }
}

/// Receive handler: sees one token, decides what happens next. The `Err`
/// arm terminates the receive with that error.
pub type OnData = Box<dyn FnMut(&Chat, &str) -> Result<Verdict, ChatError>>;

/// Completion callback for one operation. An `Err` return is re-captured
/// by the engine and routed to the unhandled sink.
pub type OnDone = Box<dyn FnOnce(&Chat, Result<Reply, ChatError>) -> Result<(), ChatError>>;

/// Sink for tokens and errors no operation claimed.
pub type OnUnhandled = Box<dyn FnMut(&Chat, Result<Value, ChatError>)>;

/// Options for a `receive` (and the receive half of `cmd`).
#[derive(Default)]
pub struct Receive {
    timeout: Option<Duration>,
    on_data: Option<OnData>,
    on_done: Option<OnDone>,
}

impl Receive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive timeout; defaults to the instance default.
    pub fn timeout(mut self, after: Duration) -> Self {
        self.timeout = Some(after);
        self
    }

    /// Token handler; the default accepts one token verbatim.
    pub fn on_data(
        mut self,
        f: impl FnMut(&Chat, &str) -> Result<Verdict, ChatError> + 'static,
    ) -> Self {
        self.on_data = Some(Box::new(f));
        self
    }

    /// Completion callback.
    pub fn on_done(
        mut self,
        f: impl FnOnce(&Chat, Result<Reply, ChatError>) -> Result<(), ChatError> + 'static,
    ) -> Self {
        self.on_done = Some(Box::new(f));
        self
    }

    /// Install a compiled expectation as the token handler.
    pub fn expect(mut self, expectation: Expectation) -> Self {
        self.on_data = Some(expectation.compile());
        self
    }
}

struct ArmedTimer {
    token: TimerToken,
    handle: TimerHandle,
}

enum Phase {
    Idle,
    Receiving {
        on_data: OnData,
        timer: ArmedTimer,
        timeout: Duration,
    },
    Waiting {
        timer: ArmedTimer,
    },
}

struct Inner {
    phase: Phase,
    on_done: Option<OnDone>,
    acc: Value,
    registry: Registry,
    unhandled: Option<OnUnhandled>,
    timer_seq: u64,
}

/// One conversation instance: owns the transport writer, the timer host,
/// the registry, the accumulator slot, and the current phase.
///
/// All methods take `&self`; handlers invoked by the engine may reenter
/// the same instance synchronously. The engine is single-threaded and
/// assumes a cooperative host.
pub struct Chat {
    transport: RefCell<Box<dyn Transport>>,
    timers: RefCell<Box<dyn TimerHost>>,
    inner: RefCell<Inner>,
    default_timeout: Cell<Duration>,
    debug: Cell<bool>,
}

impl Chat {
    pub fn new(
        transport: Box<dyn Transport>,
        timers: Box<dyn TimerHost>,
        config: ChatConfig,
    ) -> Chat {
        Chat {
            transport: RefCell::new(transport),
            timers: RefCell::new(timers),
            inner: RefCell::new(Inner {
                phase: Phase::Idle,
                on_done: None,
                acc: Value::Null,
                registry: Registry::default(),
                unhandled: None,
                timer_seq: 0,
            }),
            default_timeout: Cell::new(config.timeout()),
            debug: Cell::new(config.debug),
        }
    }

    /// Whether an operation is in flight. Inside a receive handler's
    /// invocation window the instance observes as idle, so handlers can
    /// start follow-up operations.
    pub fn busy(&self) -> bool {
        !matches!(self.inner.borrow().phase, Phase::Idle)
    }

    pub fn set_debug(&self, on: bool) {
        self.debug.set(on);
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout.get()
    }

    pub fn set_default_timeout(&self, after: Duration) {
        self.default_timeout.set(after);
    }

    /// Install the sink for tokens and errors no operation claimed.
    pub fn on_unhandled(&self, f: impl FnMut(&Chat, Result<Value, ChatError>) + 'static) {
        self.inner.borrow_mut().unhandled = Some(Box::new(f));
    }

    // ------------------------------------------------------------------
    // Accumulator slot
    // ------------------------------------------------------------------

    /// Current accumulator value. The slot is cleared to `Null` whenever
    /// an operation terminates, for any reason.
    pub fn acc(&self) -> Value {
        self.inner.borrow().acc.clone()
    }

    pub fn set_acc(&self, value: Value) {
        self.inner.borrow_mut().acc = value;
    }

    pub fn take_acc(&self) -> Value {
        std::mem::replace(&mut self.inner.borrow_mut().acc, Value::Null)
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    /// Register a persistent handler for unsolicited input. With `dedupe`,
    /// prior registrations with an equal spec are removed first.
    pub fn register(
        &self,
        spec: MatchSpec,
        dedupe: bool,
        handler: impl FnMut(&Chat, &str) -> bool + 'static,
    ) {
        self.inner
            .borrow_mut()
            .registry
            .register(spec, dedupe, Box::new(handler));
    }

    /// Remove the most recent registration with an equal spec, or all of
    /// them. Returns how many were removed.
    pub fn deregister(&self, spec: &MatchSpec, all: bool) -> usize {
        self.inner.borrow_mut().registry.deregister(spec, all)
    }

    pub fn deregister_all(&self) {
        self.inner.borrow_mut().registry.clear();
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Write a token to the transport, unless an operation is in flight,
    /// in which case the write is silently suppressed.
    pub fn send(&self, token: &str) -> Result<(), ChatError> {
        if self.busy() {
            if self.debug.get() {
                tracing::debug!(token, "send suppressed while busy");
            }
            return Ok(());
        }
        self.write(token)
    }

    /// Write a token to the transport regardless of the busy gate.
    pub fn force_send(&self, token: &str) -> Result<(), ChatError> {
        self.write(token)
    }

    fn write(&self, token: &str) -> Result<(), ChatError> {
        if self.debug.get() {
            tracing::debug!(token, "tx");
        }
        self.transport
            .borrow_mut()
            .write(token)
            .map_err(ChatError::transport)
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Begin receiving. If an operation is already in flight the options'
    /// completion callback is invoked with [`ChatError::Busy`]; with no
    /// callback the error goes to the unhandled sink.
    pub fn receive(&self, opts: Receive) {
        let Receive {
            timeout,
            on_data,
            on_done,
        } = opts;
        if self.busy() {
            self.reject_busy(on_done);
            return;
        }
        let after = timeout.unwrap_or_else(|| self.default_timeout.get());
        let timer = self.arm(TimerKind::Receive, after);
        let mut inner = self.inner.borrow_mut();
        inner.phase = Phase::Receiving {
            on_data: on_data.unwrap_or_else(|| {
                Box::new(|_, token| Ok(Verdict::Done(Value::String(token.to_string()))))
            }),
            timer,
            timeout: after,
        };
        inner.on_done = on_done;
    }

    /// Send a token, then begin receiving the reply.
    pub fn cmd(&self, token: &str, opts: Receive) -> Result<(), ChatError> {
        self.send(token)?;
        self.receive(opts);
        Ok(())
    }

    /// Spend `after` in the Waiting phase, then complete with
    /// [`Reply::WaitOver`].
    pub fn wait(&self, after: Duration) {
        self.wait_inner(after, None);
    }

    /// [`Chat::wait`] with a completion callback.
    pub fn wait_with(
        &self,
        after: Duration,
        on_done: impl FnOnce(&Chat, Result<Reply, ChatError>) -> Result<(), ChatError> + 'static,
    ) {
        self.wait_inner(after, Some(Box::new(on_done)));
    }

    fn wait_inner(&self, after: Duration, on_done: Option<OnDone>) {
        if self.busy() {
            self.reject_busy(on_done);
            return;
        }
        let timer = self.arm(TimerKind::Wait, after);
        let mut inner = self.inner.borrow_mut();
        inner.phase = Phase::Waiting { timer };
        inner.on_done = on_done;
    }

    /// Terminate the active operation, delivering `outcome` to its
    /// completion callback. While idle this is itself an error: it goes to
    /// the unhandled sink, or back to the caller when no sink is set.
    pub fn stop(&self, outcome: Result<Value, ChatError>) -> Result<(), ChatError> {
        if !self.busy() {
            if self.has_unhandled() {
                self.to_unhandled(Err(ChatError::NotBusy));
                return Ok(());
            }
            return Err(ChatError::NotBusy);
        }
        self.finish(outcome.map(Reply::Data));
        Ok(())
    }

    /// Cancel and re-arm the receive timeout, optionally with a new value
    /// (default: the value currently in force). Outside a Receiving phase
    /// there is no timer to re-arm and the call is a no-op.
    pub fn reset_timeout(&self, after: Option<Duration>) {
        let prior = {
            let inner = self.inner.borrow();
            match &inner.phase {
                Phase::Receiving { timer, timeout, .. } => Some((timer.handle, *timeout)),
                _ => None,
            }
        };
        let Some((old_handle, old_timeout)) = prior else {
            return;
        };
        self.timers.borrow_mut().cancel(old_handle);
        let after = after.unwrap_or(old_timeout);
        let fresh = self.arm(TimerKind::Receive, after);
        let mut inner = self.inner.borrow_mut();
        if let Phase::Receiving { timer, timeout, .. } = &mut inner.phase {
            *timer = fresh;
            *timeout = after;
        }
    }

    /// Splice a completion callback onto the live operation. An existing
    /// callback is wrapped: it runs first, and its failure (if any)
    /// replaces the outcome delivered to `next`.
    pub fn push_on_done(
        &self,
        next: impl FnOnce(&Chat, Result<Reply, ChatError>) -> Result<(), ChatError> + 'static,
    ) -> Result<(), ChatError> {
        let mut inner = self.inner.borrow_mut();
        if matches!(inner.phase, Phase::Idle) {
            return Err(ChatError::NotBusy);
        }
        let next: OnDone = Box::new(next);
        inner.on_done = Some(match inner.on_done.take() {
            None => next,
            Some(prev) => Box::new(move |chat, outcome| match prev(chat, outcome.clone()) {
                Ok(()) => next(chat, outcome),
                Err(e) => next(chat, Err(e)),
            }),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Dispatch one inbound token: registry first (newest registration
    /// wins), then the active receive handler, then the unhandled sink.
    /// Tokens arriving in a Waiting phase are dropped.
    pub fn feed(&self, token: &str) {
        if self.debug.get() {
            tracing::debug!(token, "rx");
        }
        if self.dispatch_registry(token) {
            return;
        }

        enum Route {
            Drop,
            Unhandled,
            Receive {
                on_data: OnData,
                timer: ArmedTimer,
                timeout: Duration,
                on_done: Option<OnDone>,
            },
        }

        let route = {
            let mut inner = self.inner.borrow_mut();
            if matches!(inner.phase, Phase::Waiting { .. }) {
                Route::Drop
            } else if matches!(inner.phase, Phase::Idle) {
                Route::Unhandled
            } else {
                let Phase::Receiving {
                    on_data,
                    timer,
                    timeout,
                } = std::mem::replace(&mut inner.phase, Phase::Idle)
                else {
                    unreachable!()
                };
                Route::Receive {
                    on_data,
                    timer,
                    timeout,
                    on_done: inner.on_done.take(),
                }
            }
        };

        match route {
            Route::Drop => {}
            Route::Unhandled => self.to_unhandled(Ok(Value::String(token.to_string()))),
            Route::Receive {
                mut on_data,
                timer,
                timeout,
                on_done,
            } => {
                // The operation is held aside on the stack; the instance
                // observes as idle while the handler runs.
                let verdict = on_data(self, token);
                self.settle(verdict, on_data, timer, timeout, on_done);
            }
        }
    }

    /// Deliver a timer expiry. Tokens that no longer match the armed timer
    /// are stale and ignored.
    pub fn on_timer(&self, token: TimerToken) {
        let expired = {
            let inner = self.inner.borrow();
            match (&inner.phase, token.kind) {
                (Phase::Receiving { timer, .. }, TimerKind::Receive) if timer.token == token => {
                    Some(TimerKind::Receive)
                }
                (Phase::Waiting { timer }, TimerKind::Wait) if timer.token == token => {
                    Some(TimerKind::Wait)
                }
                _ => None,
            }
        };
        match expired {
            Some(TimerKind::Receive) => self.finish(Err(ChatError::Timeout)),
            Some(TimerKind::Wait) => self.finish(Ok(Reply::WaitOver)),
            None => {
                if self.debug.get() {
                    tracing::debug!(?token, "stale timer fire ignored");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn arm(&self, kind: TimerKind, after: Duration) -> ArmedTimer {
        let seq = {
            let mut inner = self.inner.borrow_mut();
            inner.timer_seq += 1;
            inner.timer_seq
        };
        let token = TimerToken { kind, seq };
        let handle = self.timers.borrow_mut().schedule(after, token);
        ArmedTimer { token, handle }
    }

    fn reject_busy(&self, on_done: Option<OnDone>) {
        match on_done {
            Some(cb) => self.deliver_done(cb, Err(ChatError::Busy)),
            None => self.to_unhandled(Err(ChatError::Busy)),
        }
    }

    /// Act on a receive handler's verdict, with the operation's state held
    /// aside. If the handler started a nested operation, the held-aside
    /// state is settled without touching the nested one.
    fn settle(
        &self,
        verdict: Result<Verdict, ChatError>,
        on_data: OnData,
        timer: ArmedTimer,
        timeout: Duration,
        on_done: Option<OnDone>,
    ) {
        let nested = self.busy();
        if !nested {
            {
                let mut inner = self.inner.borrow_mut();
                inner.phase = Phase::Receiving {
                    on_data,
                    timer,
                    timeout,
                };
                inner.on_done = on_done;
            }
            match verdict {
                Ok(Verdict::Repeat) => {}
                Ok(Verdict::Swap(next)) => {
                    if let Phase::Receiving { on_data, .. } = &mut self.inner.borrow_mut().phase {
                        *on_data = next;
                    }
                }
                Ok(Verdict::Done(value)) => self.finish(Ok(Reply::Data(value))),
                Err(e) => self.finish(Err(e)),
            }
            return;
        }

        // Nested operation in flight: retire the held-aside one. The
        // accumulator now belongs to the nested operation and is left as
        // is.
        self.timers.borrow_mut().cancel(timer.handle);
        drop(on_data);
        match verdict {
            Ok(Verdict::Done(value)) => {
                if let Some(cb) = on_done {
                    self.deliver_done(cb, Ok(Reply::Data(value)));
                }
            }
            Err(e) => match on_done {
                Some(cb) => self.deliver_done(cb, Err(e)),
                None => self.to_unhandled(Err(e)),
            },
            Ok(Verdict::Repeat | Verdict::Swap(_)) => {
                tracing::warn!("receive handler asked to stay attached after starting a new operation");
                if let Some(cb) = on_done {
                    self.deliver_done(cb, Err(ChatError::Busy));
                }
            }
        }
    }

    /// Terminal transition: clear the accumulator, cancel the armed timer,
    /// drop the handler, snapshot the completion callback, establish Idle,
    /// then deliver.
    fn finish(&self, outcome: Result<Reply, ChatError>) {
        let (armed, on_done) = {
            let mut inner = self.inner.borrow_mut();
            inner.acc = Value::Null;
            let armed = match std::mem::replace(&mut inner.phase, Phase::Idle) {
                Phase::Receiving { timer, .. } => Some(timer),
                Phase::Waiting { timer } => Some(timer),
                Phase::Idle => None,
            };
            (armed, inner.on_done.take())
        };
        if let Some(armed) = armed {
            self.timers.borrow_mut().cancel(armed.handle);
        }
        if self.debug.get() {
            tracing::debug!(ok = outcome.is_ok(), "operation finished");
        }
        match (on_done, outcome) {
            (Some(cb), outcome) => self.deliver_done(cb, outcome),
            (None, Err(e)) => self.to_unhandled(Err(e)),
            // Data with no destination is dropped, wait expiry included.
            (None, Ok(_)) => {}
        }
    }

    fn deliver_done(&self, cb: OnDone, outcome: Result<Reply, ChatError>) {
        if let Err(e) = cb(self, outcome) {
            self.to_unhandled(Err(e));
        }
    }

    fn has_unhandled(&self) -> bool {
        self.inner.borrow().unhandled.is_some()
    }

    fn to_unhandled(&self, item: Result<Value, ChatError>) {
        let sink = self.inner.borrow_mut().unhandled.take();
        match sink {
            Some(mut sink) => {
                sink(self, item);
                let mut inner = self.inner.borrow_mut();
                if inner.unhandled.is_none() {
                    inner.unhandled = Some(sink);
                }
            }
            None => match item {
                Err(e) => tracing::error!(error = %e, "unroutable error dropped"),
                Ok(_) => {}
            },
        }
    }

    fn dispatch_registry(&self, token: &str) -> bool {
        let ids = self.inner.borrow().registry.snapshot_newest_first();
        for id in ids {
            let Some(spec) = self.inner.borrow().registry.spec_of(id) else {
                continue;
            };
            if !is_matched(&match_token(&spec, token)) {
                continue;
            }
            let Some(mut handler) = self.inner.borrow_mut().registry.take_handler(id) else {
                continue;
            };
            let consumed = handler(self, token);
            self.inner.borrow_mut().registry.restore_handler(id, handler);
            if consumed {
                if self.debug.get() {
                    tracing::debug!(token, "consumed by registration");
                }
                return true;
            }
        }
        false
    }
}
