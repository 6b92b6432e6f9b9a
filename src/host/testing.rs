//! Mock collaborators for deterministic tests.
//!
//! These stand in for real transports and timer facilities the way the
//! engine sees them: a transport that records every outbound token, a
//! timer host that records armings for manual firing, and a loopback
//! transport that cross-wires two engine instances.

use super::{TimerHandle, TimerHost, TimerToken, Transport};
use crate::engine::Chat;
use std::cell::RefCell;
use std::io;
use std::rc::{Rc, Weak};
use std::time::Duration;

/// Transport that appends every written token to a shared log.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    sent: Rc<RefCell<Vec<String>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far.
    pub fn sent(&self) -> Vec<String> {
        self.sent.borrow().clone()
    }

    /// Drain the log.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut self.sent.borrow_mut())
    }
}

impl Transport for RecordingTransport {
    fn write(&mut self, token: &str) -> io::Result<()> {
        self.sent.borrow_mut().push(token.to_string());
        Ok(())
    }
}

/// One timer as the host saw it scheduled.
#[derive(Debug, Clone, Copy)]
pub struct ArmedTimer {
    pub handle: TimerHandle,
    pub after: Duration,
    pub token: TimerToken,
}

/// Timer host that records armings instead of scheduling anything. Tests
/// fire a timer by popping an entry and calling
/// [`Chat::on_timer`] with its token; cancelled entries
/// are removed and therefore can never be fired.
#[derive(Clone, Default)]
pub struct ManualTimers {
    state: Rc<RefCell<ManualState>>,
}

#[derive(Default)]
struct ManualState {
    next_handle: u64,
    armed: Vec<ArmedTimer>,
}

impl ManualTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently armed timers, oldest first.
    pub fn armed(&self) -> Vec<ArmedTimer> {
        self.state.borrow().armed.clone()
    }

    /// Remove and return the timer with the nearest deadline.
    pub fn pop_soonest(&self) -> Option<ArmedTimer> {
        let mut state = self.state.borrow_mut();
        let idx = state
            .armed
            .iter()
            .enumerate()
            .min_by_key(|(_, t)| t.after)
            .map(|(i, _)| i)?;
        Some(state.armed.remove(idx))
    }
}

impl TimerHost for ManualTimers {
    fn schedule(&mut self, after: Duration, token: TimerToken) -> TimerHandle {
        let mut state = self.state.borrow_mut();
        state.next_handle += 1;
        let handle = TimerHandle(state.next_handle);
        state.armed.push(ArmedTimer {
            handle,
            after,
            token,
        });
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.state.borrow_mut().armed.retain(|t| t.handle != handle);
    }
}

/// Transport that feeds every written token straight into a peer engine,
/// for two-instance request/response scenarios.
#[derive(Clone, Default)]
pub struct Loopback {
    peer: Rc<RefCell<Option<Weak<Chat>>>>,
}

impl Loopback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire this transport to deliver into `peer`.
    pub fn connect(&self, peer: &Rc<Chat>) {
        *self.peer.borrow_mut() = Some(Rc::downgrade(peer));
    }
}

impl Transport for Loopback {
    fn write(&mut self, token: &str) -> io::Result<()> {
        let peer = self.peer.borrow().as_ref().and_then(Weak::upgrade);
        match peer {
            Some(chat) => {
                chat.feed(token);
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "loopback peer not connected",
            )),
        }
    }
}
