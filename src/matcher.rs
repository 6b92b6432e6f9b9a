//! Match predicates for inbound tokens.
//!
//! A [`MatchSpec`] describes what an acceptable token looks like; evaluating
//! one against a token yields a raw match value that doubles as a boolean
//! witness and as payload (see [`is_matched`]). Specs are cheap to clone:
//! closure-carrying variants share their callable via `Rc`.

use crate::error::ChatError;
use serde_json::Value;
use std::fmt;
use std::rc::Rc;

/// User-extensible matcher, the open escape hatch of [`MatchSpec`].
///
/// Return [`Value::Bool(false)`](Value::Bool) or [`Value::Null`] for "no
/// match"; anything else is a match and is preserved as the match value.
pub trait Matcher {
    fn try_match(&self, token: &str) -> Value;
}

/// Declarative description of an acceptable token.
#[derive(Clone)]
pub enum MatchSpec {
    /// Matches every token.
    Always,
    /// Matches no token.
    Never,
    /// Exact string equality.
    Literal(String),
    /// Arbitrary predicate; the returned value is the match value.
    Predicate(Rc<dyn Fn(&str) -> Value>),
    /// Regular expression; the match value is the capture-group array
    /// (full match at index 0, `Null` for groups that did not participate).
    Regex(regex::Regex),
    /// First matching element wins; its match value is preserved.
    AnyOf(Vec<MatchSpec>),
    /// User-supplied matcher object.
    Custom(Rc<dyn Matcher>),
}

impl MatchSpec {
    /// Literal spec from anything string-like.
    pub fn literal(s: impl Into<String>) -> Self {
        MatchSpec::Literal(s.into())
    }

    /// Predicate spec from a closure.
    pub fn predicate(f: impl Fn(&str) -> Value + 'static) -> Self {
        MatchSpec::Predicate(Rc::new(f))
    }

    /// Regex spec from a pattern string.
    pub fn regex(pattern: &str) -> Result<Self, ChatError> {
        regex::Regex::new(pattern)
            .map(MatchSpec::Regex)
            .map_err(|e| ChatError::CannotMatch {
                kind: "regex".into(),
                repr: e.to_string(),
            })
    }

    /// Key equality for registry dedupe/deregister: structural for the
    /// value-carrying variants, pointer identity for the closure-carrying
    /// ones (the caller supplies the same spec object as the key).
    pub fn same_key(&self, other: &MatchSpec) -> bool {
        match (self, other) {
            (MatchSpec::Always, MatchSpec::Always) => true,
            (MatchSpec::Never, MatchSpec::Never) => true,
            (MatchSpec::Literal(a), MatchSpec::Literal(b)) => a == b,
            (MatchSpec::Regex(a), MatchSpec::Regex(b)) => a.as_str() == b.as_str(),
            (MatchSpec::Predicate(a), MatchSpec::Predicate(b)) => Rc::ptr_eq(a, b),
            (MatchSpec::Custom(a), MatchSpec::Custom(b)) => Rc::ptr_eq(a, b),
            (MatchSpec::AnyOf(a), MatchSpec::AnyOf(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_key(y))
            }
            _ => false,
        }
    }
}

impl fmt::Debug for MatchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchSpec::Always => f.write_str("Always"),
            MatchSpec::Never => f.write_str("Never"),
            MatchSpec::Literal(s) => write!(f, "Literal({s:?})"),
            MatchSpec::Predicate(_) => f.write_str("Predicate(..)"),
            MatchSpec::Regex(re) => write!(f, "Regex({:?})", re.as_str()),
            MatchSpec::AnyOf(specs) => f.debug_tuple("AnyOf").field(specs).finish(),
            MatchSpec::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl fmt::Display for MatchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchSpec::Literal(s) => f.write_str(s),
            MatchSpec::Regex(re) => f.write_str(re.as_str()),
            other => write!(f, "{other:?}"),
        }
    }
}

impl From<&str> for MatchSpec {
    fn from(s: &str) -> Self {
        MatchSpec::Literal(s.to_string())
    }
}

impl From<String> for MatchSpec {
    fn from(s: String) -> Self {
        MatchSpec::Literal(s)
    }
}

/// Decode a spec from its dynamic JSON form. Shapes with no spec reading
/// fail with [`ChatError::CannotMatch`].
impl TryFrom<&Value> for MatchSpec {
    type Error = ChatError;

    fn try_from(value: &Value) -> Result<Self, ChatError> {
        match value {
            Value::Bool(true) => Ok(MatchSpec::Always),
            Value::Bool(false) => Ok(MatchSpec::Never),
            Value::String(s) => Ok(MatchSpec::Literal(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(MatchSpec::try_from)
                .collect::<Result<Vec<_>, _>>()
                .map(MatchSpec::AnyOf),
            other => Err(ChatError::CannotMatch {
                kind: json_kind(other).into(),
                repr: other.to_string(),
            }),
        }
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Evaluate `spec` against `token`, returning the raw match value.
pub fn match_token(spec: &MatchSpec, token: &str) -> Value {
    match spec {
        MatchSpec::Always => Value::Bool(true),
        MatchSpec::Never => Value::Bool(false),
        MatchSpec::Literal(s) => Value::Bool(s == token),
        MatchSpec::Predicate(f) => f(token),
        MatchSpec::Regex(re) => match re.captures(token) {
            Some(caps) => Value::Array(
                caps.iter()
                    .map(|g| match g {
                        Some(m) => Value::String(m.as_str().to_string()),
                        None => Value::Null,
                    })
                    .collect(),
            ),
            None => Value::Bool(false),
        },
        MatchSpec::AnyOf(specs) => {
            for s in specs {
                let r = match_token(s, token);
                if is_matched(&r) {
                    return r;
                }
            }
            Value::Bool(false)
        }
        MatchSpec::Custom(m) => m.try_match(token),
    }
}

/// A match value witnesses a match iff it is neither `Null` nor `false`.
/// `0` and `""` are matches.
pub fn is_matched(result: &Value) -> bool {
    !matches!(result, Value::Null | Value::Bool(false))
}

/// Assert-style matcher for user callbacks: the match value on success,
/// a formatted [`ChatError::Mismatch`] otherwise.
pub fn expect_match(expected: &MatchSpec, token: &str) -> Result<Value, ChatError> {
    let result = match_token(expected, token);
    if is_matched(&result) {
        Ok(result)
    } else {
        Err(ChatError::Mismatch {
            expected: expected.to_string(),
            got: token.to_string(),
        })
    }
}
