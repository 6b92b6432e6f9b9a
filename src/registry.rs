//! Registry of persistent handlers for unsolicited input.
//!
//! An ordered list of `(spec, handler)` pairs modelling an override stack:
//! dispatch scans newest-first, and a handler returning `false` means "not
//! actually relevant here", letting older registrations see the token.

use crate::engine::Chat;
use crate::matcher::MatchSpec;

/// Handler for unsolicited tokens. Returning `true` consumes the token and
/// stops dispatch; `false` continues the scan as if this registration did
/// not match.
pub type UrcHandler = Box<dyn FnMut(&Chat, &str) -> bool>;

struct Entry {
    id: u64,
    spec: MatchSpec,
    // Empty only while the handler is out being invoked.
    handler: Option<UrcHandler>,
}

#[derive(Default)]
pub(crate) struct Registry {
    entries: Vec<Entry>,
    next_id: u64,
}

impl Registry {
    pub fn register(&mut self, spec: MatchSpec, dedupe: bool, handler: UrcHandler) {
        if dedupe {
            self.entries.retain(|e| !e.spec.same_key(&spec));
        }
        self.next_id += 1;
        self.entries.push(Entry {
            id: self.next_id,
            spec,
            handler: Some(handler),
        });
    }

    /// Remove the most recent registration with an equal spec, or all of
    /// them. Returns how many were removed.
    pub fn deregister(&mut self, spec: &MatchSpec, all: bool) -> usize {
        if all {
            let before = self.entries.len();
            self.entries.retain(|e| !e.spec.same_key(spec));
            before - self.entries.len()
        } else {
            match self.entries.iter().rposition(|e| e.spec.same_key(spec)) {
                Some(idx) => {
                    self.entries.remove(idx);
                    1
                }
                None => 0,
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entry ids, newest first. Dispatch iterates this snapshot so that
    /// registrations made while handling a token only apply to the next
    /// token.
    pub fn snapshot_newest_first(&self) -> Vec<u64> {
        self.entries.iter().rev().map(|e| e.id).collect()
    }

    pub fn spec_of(&self, id: u64) -> Option<MatchSpec> {
        self.entries
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.spec.clone())
    }

    pub fn take_handler(&mut self, id: u64) -> Option<UrcHandler> {
        self.entries
            .iter_mut()
            .find(|e| e.id == id)
            .and_then(|e| e.handler.take())
    }

    /// Put a handler back after invocation, unless its registration was
    /// removed in the meantime.
    pub fn restore_handler(&mut self, id: u64, handler: UrcHandler) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.handler = Some(handler);
        }
    }
}
