//! Conversation engine: phase machine, dispatch pipeline, façades.

mod chat;
#[cfg(test)]
mod proptests;

pub use chat::{
    Chat, ChatConfig, OnData, OnDone, OnUnhandled, Receive, Reply, Verdict, DFLT_TIMEOUT,
};

#[cfg(test)]
pub(crate) mod test_support {
    use super::{Chat, ChatConfig, OnData, Verdict};
    use crate::error::ChatError;
    use crate::host::testing::ManualTimers;
    use crate::host::transport_fn;
    use serde_json::Value;

    /// A chat with a discarding transport and manual timers, for tests
    /// that only exercise handlers.
    pub fn idle_chat() -> Chat {
        Chat::new(
            Box::new(transport_fn(|_| Ok(()))),
            Box::new(ManualTimers::new()),
            ChatConfig::default(),
        )
    }

    /// Feed tokens through a handler directly, counting how many times it
    /// asked to stay attached, until it completes or fails.
    pub fn drive<'a>(
        mut handler: OnData,
        tokens: impl IntoIterator<Item = &'a str>,
    ) -> (usize, Result<Value, ChatError>) {
        let chat = idle_chat();
        let mut repeats = 0;
        for token in tokens {
            match handler(&chat, token) {
                Ok(Verdict::Repeat) => repeats += 1,
                Ok(Verdict::Swap(next)) => {
                    handler = next;
                    repeats += 1;
                }
                Ok(Verdict::Done(value)) => return (repeats, Ok(value)),
                Err(e) => return (repeats, Err(e)),
            }
        }
        panic!("handler consumed every token without completing");
    }
}
