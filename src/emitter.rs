//! Listener tables.
//!
//! Subscriptions everywhere in the client are an explicit table of
//! `subject -> ordered callbacks`. Dispatch iterates a snapshot of the
//! subscription ids taken before the first callback runs, so removals that
//! land mid-dispatch (via the command queue) take effect without skipping
//! or double-invoking anyone.

use std::collections::HashMap;

/// Identifies one registered callback; returned by every subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

struct Entry<F: ?Sized> {
    id: SubscriptionId,
    cb: Box<F>,
}

/// `map<subject, ordered list of callbacks>` with snapshot dispatch.
pub(crate) struct Emitter<F: ?Sized> {
    next_id: u64,
    subjects: HashMap<String, Vec<Entry<F>>>,
}

impl<F: ?Sized> Emitter<F> {
    pub fn new() -> Self {
        Emitter {
            next_id: 1,
            subjects: HashMap::new(),
        }
    }

    pub fn on(&mut self, subject: &str, cb: Box<F>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subjects
            .entry(subject.to_owned())
            .or_default()
            .push(Entry { id, cb });
        id
    }

    /// Remove one callback. The subject entry disappears with its last
    /// callback so `has` reflects live subscriptions only.
    pub fn off(&mut self, subject: &str, id: SubscriptionId) -> bool {
        let Some(entries) = self.subjects.get_mut(subject) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            self.subjects.remove(subject);
        }
        removed
    }

    pub fn clear(&mut self) {
        self.subjects.clear();
    }

    pub fn has(&self, subject: &str) -> bool {
        self.subjects.contains_key(subject)
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    pub fn subjects(&self) -> impl Iterator<Item = &str> {
        self.subjects.keys().map(String::as_str)
    }

    /// Invoke `f` for every callback registered on `subject`, in
    /// registration order, over a pre-dispatch snapshot of ids.
    pub fn dispatch(&mut self, subject: &str, mut f: impl FnMut(&mut F)) {
        let Some(entries) = self.subjects.get(subject) else {
            return;
        };
        let snapshot: Vec<SubscriptionId> = entries.iter().map(|e| e.id).collect();
        for id in snapshot {
            if let Some(entry) = self
                .subjects
                .get_mut(subject)
                .and_then(|entries| entries.iter_mut().find(|e| e.id == id))
            {
                f(&mut *entry.cb);
            }
        }
    }
}
