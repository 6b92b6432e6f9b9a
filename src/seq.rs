//! Sequencer: drives a script of steps to completion, composing with the
//! engine whenever a step begins a receive or wait.

use crate::engine::{Chat, Reply};
use crate::error::ChatError;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;

/// Continuation handed to an async step; call it once with the step's
/// outcome to advance the sequence.
pub type SeqCont = Box<dyn FnOnce(&Chat, Result<Reply, ChatError>)>;

/// One step of a script.
pub enum Step {
    /// Async step: receives a continuation and calls it (now or later)
    /// with the step outcome. An error outcome terminates the sequence.
    Run(Box<dyn FnOnce(&Chat, SeqCont)>),
    /// Step that initiates a Receiving or Waiting phase on the instance;
    /// the sequencer splices its continuation into that phase's completion
    /// slot, after any completion callback the step itself installed.
    Start(Box<dyn FnOnce(&Chat) -> Result<(), ChatError>>),
    /// Synchronous step: the value is the step's result.
    Value(Value),
}

impl Step {
    pub fn run(f: impl FnOnce(&Chat, SeqCont) + 'static) -> Step {
        Step::Run(Box::new(f))
    }

    pub fn start(f: impl FnOnce(&Chat) -> Result<(), ChatError> + 'static) -> Step {
        Step::Start(Box::new(f))
    }

    pub fn value(v: impl Into<Value>) -> Step {
        Step::Value(v.into())
    }
}

type OnSeqDone = Box<dyn FnOnce(&Chat, Result<Reply, ChatError>)>;

struct SeqState {
    steps: Box<dyn Iterator<Item = Step>>,
    last: Reply,
    on_done: Option<OnSeqDone>,
    // True while the pump loop is on the stack; a continuation invoked
    // synchronously parks its outcome here instead of recursing.
    pumping: bool,
    parked: Option<Result<Reply, ChatError>>,
}

impl Chat {
    /// Drive `script` to completion. The completion callback receives the
    /// final step's value on success, or the first error. Requires an idle
    /// instance; each `Step::Start` consumes one idle→busy→idle cycle.
    ///
    /// `stop` does not abort a running sequence: it terminates only the
    /// current step's operation, whose outcome the sequence then observes.
    pub fn seq<I>(
        &self,
        script: I,
        on_done: impl FnOnce(&Chat, Result<Reply, ChatError>) + 'static,
    ) where
        I: IntoIterator<Item = Step>,
        I::IntoIter: 'static,
    {
        if self.busy() {
            on_done(self, Err(ChatError::Busy));
            return;
        }
        let state = Rc::new(RefCell::new(SeqState {
            steps: Box::new(script.into_iter()),
            last: Reply::Data(Value::Null),
            on_done: Some(Box::new(on_done)),
            pumping: false,
            parked: None,
        }));
        pump(self, &state);
    }
}

fn continuation(state: &Rc<RefCell<SeqState>>) -> SeqCont {
    let state = state.clone();
    Box::new(move |chat, outcome| {
        {
            let mut s = state.borrow_mut();
            if s.pumping {
                s.parked = Some(outcome);
                return;
            }
        }
        match outcome {
            Err(e) => conclude(chat, &state, Err(e)),
            Ok(reply) => {
                state.borrow_mut().last = reply;
                pump(chat, &state);
            }
        }
    })
}

fn pump(chat: &Chat, state: &Rc<RefCell<SeqState>>) {
    loop {
        let step = state.borrow_mut().steps.next();
        let Some(step) = step else {
            let last = {
                let mut s = state.borrow_mut();
                std::mem::replace(&mut s.last, Reply::Data(Value::Null))
            };
            conclude(chat, state, Ok(last));
            return;
        };
        match step {
            Step::Value(v) => {
                state.borrow_mut().last = Reply::Data(v);
            }
            Step::Run(f) => {
                state.borrow_mut().pumping = true;
                f(chat, continuation(state));
                let parked = {
                    let mut s = state.borrow_mut();
                    s.pumping = false;
                    s.parked.take()
                };
                match parked {
                    // The step went async; its continuation resumes us.
                    None => return,
                    Some(Err(e)) => {
                        conclude(chat, state, Err(e));
                        return;
                    }
                    Some(Ok(reply)) => {
                        state.borrow_mut().last = reply;
                    }
                }
            }
            Step::Start(f) => {
                if let Err(e) = f(chat) {
                    conclude(chat, state, Err(e));
                    return;
                }
                let cont = continuation(state);
                let spliced = chat.push_on_done(move |chat, outcome| {
                    cont(chat, outcome);
                    Ok(())
                });
                if let Err(e) = spliced {
                    conclude(chat, state, Err(e));
                }
                return;
            }
        }
    }
}

fn conclude(chat: &Chat, state: &Rc<RefCell<SeqState>>, outcome: Result<Reply, ChatError>) {
    if let Some(done) = state.borrow_mut().on_done.take() {
        done(chat, outcome);
    }
}
