//! Expectation compiler: a declarative pattern, a flag set, and a
//! select-index compiled into a stateful single-use receive handler.

use crate::engine::{OnData, Verdict};
use crate::error::ChatError;
use crate::matcher::{is_matched, match_token, MatchSpec};
use serde_json::Value;
use std::ops::{BitOr, BitOrAssign};

/// Behavior flags for an [`Expectation`]. OR-combinable; bit values are
/// part of the wire-level contract and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(pub u32);

impl Flags {
    pub const NO_FLAGS: Flags = Flags(0);
    /// Specs may be satisfied in any order.
    pub const UNORDERED: Flags = Flags(1);
    /// Tokens matching no spec are skipped instead of failing the receive.
    pub const IGNORE_NON_MATCHING: Flags = Flags(2);
    /// A token may re-match the previously satisfied spec.
    pub const ALLOW_REPEATS: Flags = Flags(4);
    /// Collect every saved value into an array instead of selecting one.
    pub const COLLECT_ALL: Flags = Flags(8);
    /// Save the raw match value instead of the token text.
    pub const USE_MATCH_RESULT: Flags = Flags(16);

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

/// A compiled-to-be pattern: a fixed sequence of specs, flags, and the
/// index of the spec whose saved value becomes the completion value when
/// [`Flags::COLLECT_ALL`] is off (default: the last spec).
pub struct Expectation {
    specs: Vec<MatchSpec>,
    flags: Flags,
    pick: usize,
}

impl Expectation {
    /// Build an expectation over a sequence of specs. Empty sequences are
    /// rejected here rather than producing a handler that can never
    /// complete meaningfully.
    pub fn new(
        specs: impl IntoIterator<Item = MatchSpec>,
        flags: Flags,
    ) -> Result<Self, ChatError> {
        let specs: Vec<MatchSpec> = specs.into_iter().collect();
        if specs.is_empty() {
            return Err(ChatError::CannotMatch {
                kind: "pattern".into(),
                repr: "[]".into(),
            });
        }
        let pick = specs.len() - 1;
        Ok(Expectation { specs, flags, pick })
    }

    /// Scalar lift: a single spec is a length-1 sequence.
    pub fn single(spec: impl Into<MatchSpec>, flags: Flags) -> Self {
        Expectation {
            specs: vec![spec.into()],
            flags,
            pick: 0,
        }
    }

    /// Select which spec's saved value completes the receive. Out-of-range
    /// indexes clamp to the last spec.
    pub fn pick(mut self, index: usize) -> Self {
        self.pick = index.min(self.specs.len() - 1);
        self
    }

    /// Compile into a receive handler. The handler is single-use: it is
    /// meant to be installed into exactly one receive.
    pub fn compile(self) -> OnData {
        if self.flags.contains(Flags::UNORDERED) {
            self.compile_unordered()
        } else {
            self.compile_ordered()
        }
    }

    fn compile_ordered(self) -> OnData {
        let Expectation { specs, flags, pick } = self;
        let mut cursor = 0usize;
        let mut state = SaveState::new(flags, pick);

        Box::new(move |_chat, token| {
            if cursor >= specs.len() {
                return Ok(Verdict::Done(state.finish()));
            }

            let result = match_token(&specs[cursor], token);

            if !is_matched(&result) {
                if flags.contains(Flags::ALLOW_REPEATS) && cursor > 0 {
                    let repeat = match_token(&specs[cursor - 1], token);
                    if is_matched(&repeat) {
                        state.save(repeat, token, false, cursor - 1);
                        return Ok(Verdict::Repeat);
                    }
                }
                if flags.contains(Flags::IGNORE_NON_MATCHING) {
                    return Ok(Verdict::Repeat);
                }
                return Err(ChatError::Mismatch {
                    expected: specs[cursor].to_string(),
                    got: token.to_string(),
                });
            }

            state.save(result, token, true, cursor);
            cursor += 1;

            if cursor == specs.len() {
                Ok(Verdict::Done(state.finish()))
            } else {
                Ok(Verdict::Repeat)
            }
        })
    }

    fn compile_unordered(self) -> OnData {
        let Expectation { specs, flags, pick } = self;
        let mut found = vec![0usize; specs.len()];
        let mut remaining = specs.len();
        let mut state = SaveState::new(flags, pick);

        Box::new(move |_chat, token| {
            let repeats = flags.contains(Flags::ALLOW_REPEATS);
            let mut hit = None;
            for (j, spec) in specs.iter().enumerate() {
                if !repeats && found[j] > 0 {
                    continue;
                }
                let result = match_token(spec, token);
                if is_matched(&result) {
                    hit = Some((j, result));
                    break;
                }
            }

            let Some((j, result)) = hit else {
                if flags.contains(Flags::IGNORE_NON_MATCHING) {
                    return Ok(Verdict::Repeat);
                }
                return Err(ChatError::NoMatch {
                    got: token.to_string(),
                });
            };

            state.save(result, token, found[j] == 0, j);
            found[j] += 1;
            if found[j] == 1 {
                remaining -= 1;
            }

            if remaining == 0 {
                Ok(Verdict::Done(state.finish()))
            } else {
                Ok(Verdict::Repeat)
            }
        })
    }
}

/// Shared save bookkeeping for both modes: `COLLECT_ALL` appends every
/// saved value; otherwise a first-time hit at the select-index is kept.
struct SaveState {
    flags: Flags,
    pick: usize,
    collected: Vec<Value>,
    kept: Value,
}

impl SaveState {
    fn new(flags: Flags, pick: usize) -> Self {
        SaveState {
            flags,
            pick,
            collected: Vec::new(),
            kept: Value::Null,
        }
    }

    fn save(&mut self, result: Value, token: &str, first: bool, index: usize) {
        let value = if self.flags.contains(Flags::USE_MATCH_RESULT) {
            result
        } else {
            Value::String(token.to_string())
        };
        if self.flags.contains(Flags::COLLECT_ALL) {
            self.collected.push(value);
        } else if first && index == self.pick {
            self.kept = value;
        }
    }

    fn finish(&mut self) -> Value {
        if self.flags.contains(Flags::COLLECT_ALL) {
            Value::Array(std::mem::take(&mut self.collected))
        } else {
            std::mem::replace(&mut self.kept, Value::Null)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::drive;
    use serde_json::json;

    #[test]
    fn flag_bits_are_fixed() {
        assert_eq!(Flags::NO_FLAGS.0, 0);
        assert_eq!(Flags::UNORDERED.0, 1);
        assert_eq!(Flags::IGNORE_NON_MATCHING.0, 2);
        assert_eq!(Flags::ALLOW_REPEATS.0, 4);
        assert_eq!(Flags::COLLECT_ALL.0, 8);
        assert_eq!(Flags::USE_MATCH_RESULT.0, 16);
        let combined = Flags::UNORDERED | Flags::COLLECT_ALL;
        assert!(combined.contains(Flags::UNORDERED));
        assert!(combined.contains(Flags::COLLECT_ALL));
        assert!(!combined.contains(Flags::ALLOW_REPEATS));
    }

    #[test]
    fn empty_pattern_is_rejected() {
        assert!(Expectation::new([], Flags::NO_FLAGS).is_err());
    }

    #[test]
    fn ordered_completes_with_selected_value() {
        let specs = ["1", "2", "3", "4"].map(MatchSpec::from);
        let handler = Expectation::new(specs, Flags::NO_FLAGS).unwrap().compile();
        let (steps, done) = drive(handler, ["1", "2", "3", "4"]);
        assert_eq!(steps, 3, "intermediate tokens ask to stay attached");
        assert_eq!(done.unwrap(), json!("4"));
    }

    #[test]
    fn ordered_mismatch_names_the_cursor_spec() {
        let specs = ["OK", "DONE"].map(MatchSpec::from);
        let mut handler = Expectation::new(specs, Flags::NO_FLAGS).unwrap().compile();
        let chat = crate::engine::test_support::idle_chat();
        assert!(matches!(handler(&chat, "OK"), Ok(Verdict::Repeat)));
        let err = handler(&chat, "ERROR").unwrap_err();
        assert_eq!(err.to_string(), "expected \"DONE\" but got \"ERROR\"");
    }

    #[test]
    fn ordered_select_index_and_clamping() {
        let specs = ["a", "b", "c"].map(MatchSpec::from);
        let handler = Expectation::new(specs.clone(), Flags::NO_FLAGS)
            .unwrap()
            .pick(1)
            .compile();
        let (_, done) = drive(handler, ["a", "b", "c"]);
        assert_eq!(done.unwrap(), json!("b"));

        let handler = Expectation::new(specs, Flags::NO_FLAGS)
            .unwrap()
            .pick(99)
            .compile();
        let (_, done) = drive(handler, ["a", "b", "c"]);
        assert_eq!(done.unwrap(), json!("c"));
    }

    #[test]
    fn unordered_with_ignore_skips_noise() {
        let specs = vec![MatchSpec::literal("a"), MatchSpec::regex("b.").unwrap()];
        let handler = Expectation::new(specs, Flags::UNORDERED | Flags::IGNORE_NON_MATCHING)
            .unwrap()
            .compile();
        let (_, done) = drive(handler, ["ba", "bb", "a"]);
        assert_eq!(done.unwrap(), json!("ba"));
    }

    #[test]
    fn unordered_without_ignore_fails_on_noise() {
        let specs = vec![MatchSpec::literal("a"), MatchSpec::literal("b")];
        let mut handler = Expectation::new(specs, Flags::UNORDERED).unwrap().compile();
        let chat = crate::engine::test_support::idle_chat();
        let err = handler(&chat, "zzz").unwrap_err();
        assert_eq!(err.to_string(), "no match for data \"zzz\"");
    }

    #[test]
    fn repeats_with_collect_all_keeps_every_hit() {
        let specs = ["a", "b"].map(MatchSpec::from);
        let handler = Expectation::new(specs, Flags::ALLOW_REPEATS | Flags::COLLECT_ALL)
            .unwrap()
            .compile();
        let (_, done) = drive(handler, ["a", "a", "b"]);
        assert_eq!(done.unwrap(), json!(["a", "a", "b"]));
    }

    #[test]
    fn collect_all_length_matches_pattern_length() {
        let specs = ["x", "y", "z"].map(MatchSpec::from);
        let handler = Expectation::new(specs, Flags::COLLECT_ALL).unwrap().compile();
        let (_, done) = drive(handler, ["x", "y", "z"]);
        assert_eq!(done.unwrap(), json!(["x", "y", "z"]));
    }

    #[test]
    fn use_match_result_saves_the_payload() {
        let specs = vec![MatchSpec::regex(r"^\+CSQ: (\d+)").unwrap()];
        let handler = Expectation::new(specs, Flags::USE_MATCH_RESULT).unwrap().compile();
        let (_, done) = drive(handler, ["+CSQ: 23"]);
        assert_eq!(done.unwrap(), json!(["+CSQ: 23", "23"]));
    }

    #[test]
    fn unordered_repeats_do_not_reselect() {
        // First hit at the select-index wins; later repeats only extend a
        // COLLECT_ALL list, never replace the selected value.
        let specs = vec![MatchSpec::regex("^b").unwrap(), MatchSpec::literal("a")];
        let handler = Expectation::new(specs, Flags::UNORDERED | Flags::ALLOW_REPEATS)
            .unwrap()
            .pick(0)
            .compile();
        let (_, done) = drive(handler, ["b1", "b2", "a"]);
        assert_eq!(done.unwrap(), json!("b1"));
    }
}
