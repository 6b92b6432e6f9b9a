//! Injected collaborator interfaces.
//!
//! The engine consumes a byte-stream writer and a timer facility purely
//! through these traits; mock implementations live in [`crate::testing`]
//! and a Tokio-backed production adapter in [`crate::driver`].

pub mod testing;

use std::io;
use std::time::Duration;

/// Outbound half of the conversation. Called synchronously from
/// [`Chat::send`](crate::Chat::send); a failure propagates to the caller
/// of `send`.
pub trait Transport {
    fn write(&mut self, token: &str) -> io::Result<()>;
}

/// Wrap a closure as a [`Transport`].
pub fn transport_fn<F>(f: F) -> impl Transport
where
    F: FnMut(&str) -> io::Result<()>,
{
    struct FnTransport<F>(F);

    impl<F> Transport for FnTransport<F>
    where
        F: FnMut(&str) -> io::Result<()>,
    {
        fn write(&mut self, token: &str) -> io::Result<()> {
            (self.0)(token)
        }
    }

    FnTransport(f)
}

/// Which engine timer a token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Receive-timeout timer.
    Receive,
    /// Wait-phase timer.
    Wait,
}

/// Identity of one armed timer, delivered back to
/// [`Chat::on_timer`](crate::Chat::on_timer) on expiry. The sequence stamp
/// makes every arming unique, so a fire that races a cancel is recognized
/// as stale and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken {
    pub kind: TimerKind,
    pub seq: u64,
}

/// Host-assigned handle for cancelling a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u64);

/// Timer facility the engine schedules against.
///
/// A cancelled handle must never fire. Cancelling a handle that already
/// fired (or was never issued) must be a no-op: the engine cancels
/// unconditionally on every idle transition, including the one a natural
/// expiry triggers.
pub trait TimerHost {
    fn schedule(&mut self, after: Duration, token: TimerToken) -> TimerHandle;
    fn cancel(&mut self, handle: TimerHandle);
}
