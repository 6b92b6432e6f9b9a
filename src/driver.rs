//! Tokio production adapter: hosts a [`Chat`] on a current-thread runtime.
//!
//! The driver owns the byte intake, the line tokenizer with its debounce
//! flush, and a [`DelayQueue`] timer wheel backing the engine's
//! [`TimerHost`]. Everything runs on one logical thread; the engine itself
//! stays synchronous.

use crate::engine::{Chat, ChatConfig};
use crate::host::{TimerHandle, TimerHost, TimerToken, Transport};
use crate::tokenize::LineSplitter;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::task::Poll;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::time::delay_queue::{DelayQueue, Key};

type SharedQueue = Rc<RefCell<DelayQueue<TimerToken>>>;
type SharedKeys = Rc<RefCell<HashMap<u64, (Key, TimerToken)>>>;

/// [`TimerHost`] backed by the driver's shared [`DelayQueue`].
struct QueueTimers {
    queue: SharedQueue,
    keys: SharedKeys,
    next_handle: u64,
}

impl TimerHost for QueueTimers {
    fn schedule(&mut self, after: Duration, token: TimerToken) -> TimerHandle {
        let key = self.queue.borrow_mut().insert(token, after);
        self.next_handle += 1;
        self.keys.borrow_mut().insert(self.next_handle, (key, token));
        TimerHandle(self.next_handle)
    }

    fn cancel(&mut self, handle: TimerHandle) {
        if let Some((key, _)) = self.keys.borrow_mut().remove(&handle.0) {
            // Tolerates handles whose timer already fired.
            self.queue.borrow_mut().try_remove(&key);
        }
    }
}

/// Handle for interacting with a running driver: the engine itself, the
/// byte intake, and shutdown.
#[derive(Clone)]
pub struct DriverHandle {
    chat: Rc<Chat>,
    bytes_tx: mpsc::Sender<Vec<u8>>,
    shutdown: CancellationToken,
}

impl DriverHandle {
    pub fn chat(&self) -> &Rc<Chat> {
        &self.chat
    }

    /// Deliver raw inbound bytes; the driver tokenizes and feeds them.
    pub async fn feed_bytes(&self, bytes: Vec<u8>) -> Result<(), mpsc::error::SendError<Vec<u8>>> {
        self.bytes_tx.send(bytes).await
    }

    /// Ask the driver loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Event loop hosting one conversation engine.
pub struct Driver {
    chat: Rc<Chat>,
    queue: SharedQueue,
    keys: SharedKeys,
    bytes_rx: mpsc::Receiver<Vec<u8>>,
    splitter: LineSplitter,
    shutdown: CancellationToken,
}

impl Driver {
    /// Build a driver around a transport. The returned handle shares the
    /// engine; register handlers and issue commands through it.
    pub fn new(transport: Box<dyn Transport>, config: ChatConfig) -> (Driver, DriverHandle) {
        let queue: SharedQueue = Rc::new(RefCell::new(DelayQueue::new()));
        let keys: SharedKeys = Rc::new(RefCell::new(HashMap::new()));
        let timers = QueueTimers {
            queue: queue.clone(),
            keys: keys.clone(),
            next_handle: 0,
        };
        let chat = Rc::new(Chat::new(transport, Box::new(timers), config));
        let (bytes_tx, bytes_rx) = mpsc::channel(32);
        let shutdown = CancellationToken::new();
        let driver = Driver {
            chat: chat.clone(),
            queue,
            keys,
            bytes_rx,
            splitter: LineSplitter::new(),
            shutdown: shutdown.clone(),
        };
        let handle = DriverHandle {
            chat,
            bytes_tx,
            shutdown,
        };
        (driver, handle)
    }

    /// Run until shutdown or the byte source closes. Not `Send`; run it on
    /// the same thread as everything else touching the engine.
    pub async fn run(mut self) {
        tracing::debug!("driver started");
        loop {
            let queue = self.queue.clone();
            let expired_timer = std::future::poll_fn(move |cx| {
                let mut queue = queue.borrow_mut();
                if queue.is_empty() {
                    return Poll::Pending;
                }
                queue.poll_expired(cx)
            });

            tokio::select! {
                () = self.shutdown.cancelled() => break,
                chunk = self.bytes_rx.recv() => match chunk {
                    Some(chunk) => {
                        for line in self.splitter.push(&chunk) {
                            self.chat.feed(&line);
                        }
                    }
                    None => {
                        if let Some(line) = self.splitter.flush() {
                            self.chat.feed(&line);
                        }
                        break;
                    }
                },
                Some(expired) = expired_timer => {
                    let token = expired.into_inner();
                    self.keys.borrow_mut().retain(|_, (_, t)| *t != token);
                    self.chat.on_timer(token);
                }
                () = tokio::time::sleep(LineSplitter::DEBOUNCE), if self.splitter.has_partial() => {
                    if let Some(line) = self.splitter.flush() {
                        self.chat.feed(&line);
                    }
                }
            }
        }
        tracing::debug!("driver stopped");
    }
}
