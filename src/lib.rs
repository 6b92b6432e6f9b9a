//! Token-at-a-time conversation driver for byte-stream partners.
//!
//! `chatline` carries on a text-oriented, request/response "conversation"
//! with a remote partner, prototypically an AT-command modem on a serial
//! line, though the design is substrate-agnostic. An instance is fed
//! pre-tokenized input and writes outbound tokens through an injected
//! transport; it coordinates single-inflight operations, sequential
//! multi-step dialogues, unsolicited-message routing, timeouts, and early
//! cancellation.
//!
//! The engine is synchronous and single-threaded: handlers, timer fires,
//! and transport writes all run on one logical thread of control, and a
//! handler may start the next operation on the same instance before it
//! returns. Timers and I/O are injected ([`Transport`], [`TimerHost`]);
//! [`Driver`] provides a Tokio current-thread host and [`testing`]
//! provides deterministic mocks.
//!
//! ```no_run
//! use chatline::{transport_fn, ChatConfig, Driver, Receive};
//!
//! # async fn demo() {
//! let transport = transport_fn(|token| {
//!     println!("> {token}");
//!     Ok(())
//! });
//! let (driver, handle) = Driver::new(Box::new(transport), ChatConfig::default());
//!
//! handle.chat().cmd("AT", Receive::new().on_done(|_chat, outcome| {
//!     println!("< {outcome:?}");
//!     Ok(())
//! })).unwrap();
//!
//! driver.run().await;
//! # }
//! ```

mod driver;
mod engine;
mod error;
mod expect;
mod host;
mod matcher;
mod registry;
mod seq;
mod tokenize;

pub use driver::{Driver, DriverHandle};
pub use engine::{
    Chat, ChatConfig, OnData, OnDone, OnUnhandled, Receive, Reply, Verdict, DFLT_TIMEOUT,
};
pub use error::ChatError;
pub use expect::{Expectation, Flags};
pub use host::testing;
pub use host::{transport_fn, TimerHandle, TimerHost, TimerKind, TimerToken, Transport};
pub use matcher::{expect_match, is_matched, match_token, MatchSpec, Matcher};
pub use registry::UrcHandler;
pub use seq::{SeqCont, Step};
pub use tokenize::LineSplitter;
