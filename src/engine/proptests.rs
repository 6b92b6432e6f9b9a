//! Property-based tests for the engine and matcher invariants.

use super::{Chat, ChatConfig, Receive, Verdict};
use crate::expect::{Expectation, Flags};
use crate::host::testing::ManualTimers;
use crate::host::transport_fn;
use crate::matcher::{is_matched, match_token, MatchSpec};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

fn manual_chat() -> (Chat, ManualTimers) {
    let timers = ManualTimers::new();
    let chat = Chat::new(
        Box::new(transport_fn(|_| Ok(()))),
        Box::new(timers.clone()),
        ChatConfig::default(),
    );
    (chat, timers)
}

// ============================================================================
// Generators
// ============================================================================

fn arb_token() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,8}"
}

#[derive(Debug, Clone)]
enum Op {
    Feed(String),
    Receive,
    Wait(u64),
    Stop,
    FireSoonest,
    ResetTimeout(u64),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        arb_token().prop_map(Op::Feed),
        Just(Op::Receive),
        (1u64..5000).prop_map(Op::Wait),
        Just(Op::Stop),
        Just(Op::FireSoonest),
        (1u64..5000).prop_map(Op::ResetTimeout),
    ]
}

// ============================================================================
// Engine invariants
// ============================================================================

proptest! {
    /// Busy exclusivity, timer hygiene, and accumulator hygiene hold under
    /// arbitrary operation interleavings: a busy instance has exactly one
    /// armed timer, an idle one has none and a cleared accumulator.
    #[test]
    fn engine_state_invariants(ops in prop::collection::vec(arb_op(), 0..40)) {
        let (chat, timers) = manual_chat();
        for op in ops {
            match op {
                Op::Feed(token) => chat.feed(&token),
                Op::Receive => chat.receive(Receive::new().on_data(|chat, token| {
                    chat.set_acc(json!(token));
                    Ok(Verdict::Repeat)
                })),
                Op::Wait(ms) => chat.wait(Duration::from_millis(ms)),
                Op::Stop => {
                    let _ = chat.stop(Ok(Value::Null));
                }
                Op::FireSoonest => {
                    if let Some(armed) = timers.pop_soonest() {
                        chat.on_timer(armed.token);
                    }
                }
                Op::ResetTimeout(ms) => chat.reset_timeout(Some(Duration::from_millis(ms))),
            }
            let armed = timers.armed().len();
            if chat.busy() {
                prop_assert_eq!(armed, 1);
            } else {
                prop_assert_eq!(armed, 0);
                prop_assert_eq!(chat.acc(), Value::Null);
            }
        }
    }

    /// The most recently registered matching handler sees the token first,
    /// however many older matches exist.
    #[test]
    fn newest_matching_registration_wins(older in 0usize..5) {
        let (chat, _) = manual_chat();
        let seen: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));
        for i in 0..=older {
            let sink = seen.clone();
            chat.register(MatchSpec::literal("urc"), false, move |_, _| {
                sink.borrow_mut().push(i);
                true
            });
        }
        chat.feed("urc");
        prop_assert_eq!(&*seen.borrow(), &vec![older]);
    }
}

// ============================================================================
// Matcher invariants
// ============================================================================

proptest! {
    /// `match(Literal(s), s)` holds for every s; a different token fails.
    #[test]
    fn literal_round_trip(s in arb_token(), t in arb_token()) {
        let spec = MatchSpec::literal(s.clone());
        prop_assert_eq!(match_token(&spec, &s), Value::Bool(true));
        prop_assert_eq!(
            is_matched(&match_token(&spec, &t)),
            s == t
        );
    }

    /// `AnyOf([a, b])` matches exactly when either branch does.
    #[test]
    fn any_of_is_disjunction(a in arb_token(), b in arb_token(), x in arb_token()) {
        let spec_a = MatchSpec::literal(a);
        let spec_b = MatchSpec::literal(b);
        let any = MatchSpec::AnyOf(vec![spec_a.clone(), spec_b.clone()]);
        prop_assert_eq!(
            is_matched(&match_token(&any, &x)),
            is_matched(&match_token(&spec_a, &x)) || is_matched(&match_token(&spec_b, &x))
        );
    }
}

// ============================================================================
// Expectation invariants
// ============================================================================

proptest! {
    /// Ordered completion with COLLECT_ALL and no repeats collects exactly
    /// one value per spec.
    #[test]
    fn collect_all_length_matches_pattern(tokens in prop::collection::vec(arb_token(), 1..8)) {
        let specs: Vec<MatchSpec> = tokens.iter().map(|t| MatchSpec::literal(t.clone())).collect();
        let len = specs.len();
        let mut handler = Expectation::new(specs, Flags::COLLECT_ALL).unwrap().compile();
        let (chat, _) = manual_chat();
        let mut outcome = None;
        for token in &tokens {
            match handler(&chat, token).unwrap() {
                Verdict::Repeat => {}
                Verdict::Done(v) => { outcome = Some(v); }
                Verdict::Swap(_) => prop_assert!(false, "expectation handlers never swap"),
            }
        }
        let collected = outcome.expect("pattern completes on its own tokens");
        prop_assert_eq!(collected.as_array().unwrap().len(), len);
    }

    /// Unordered completion without repeats satisfies every spec exactly
    /// once: the pattern completes on the final distinct token no matter
    /// the arrival order.
    #[test]
    fn unordered_completes_on_every_permutation(
        tokens in prop::collection::hash_set("[a-z]{1,6}", 1..6),
        seed in 0usize..720
    ) {
        let tokens: Vec<String> = tokens.into_iter().collect();
        let mut order: Vec<&String> = tokens.iter().collect();
        // Cheap deterministic shuffle driven by the seed.
        for i in (1..order.len()).rev() {
            order.swap(i, seed % (i + 1));
        }

        let specs: Vec<MatchSpec> = tokens.iter().map(|t| MatchSpec::literal(t.clone())).collect();
        let mut handler = Expectation::new(specs, Flags::UNORDERED).unwrap().compile();
        let (chat, _) = manual_chat();
        let mut done_at = None;
        for (i, token) in order.iter().enumerate() {
            match handler(&chat, token).unwrap() {
                Verdict::Repeat => prop_assert!(done_at.is_none()),
                Verdict::Done(_) => { done_at = Some(i); }
                Verdict::Swap(_) => prop_assert!(false, "expectation handlers never swap"),
            }
        }
        prop_assert_eq!(done_at, Some(tokens.len() - 1));
    }
}
