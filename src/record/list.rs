//! List views over records: entry operations and multiset diffing.
//!
//! A list is a record whose data is an array of record names. Around every
//! change (local or remote) the handler captures the entry structure,
//! diffs it afterwards and fires added/removed/moved events per position.

use crate::emitter::{Emitter, SubscriptionId};
use serde_json::Value;
use std::collections::HashMap;

/// Which per-entry event a callback is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListEventKind {
    EntryAdded,
    EntryRemoved,
    EntryMoved,
}

impl ListEventKind {
    fn subject(self) -> &'static str {
        match self {
            ListEventKind::EntryAdded => "added",
            ListEventKind::EntryRemoved => "removed",
            ListEventKind::EntryMoved => "moved",
        }
    }
}

/// A structural change at one list position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ListChange {
    pub kind: ListEventKind,
    pub entry: String,
    pub index: usize,
}

/// Entry mutations deferred until the backing record is ready.
#[derive(Debug, Clone)]
pub(crate) enum ListOp {
    SetEntries(Vec<String>),
    AddEntry { entry: String, index: Option<usize> },
    RemoveEntry(String),
    RemoveAt(usize),
}

impl ListOp {
    /// The target entry vector produced by applying this op to `before`.
    pub fn apply(&self, before: &[String]) -> Vec<String> {
        let mut out = before.to_vec();
        match self {
            ListOp::SetEntries(entries) => out = entries.clone(),
            ListOp::AddEntry { entry, index } => match index {
                Some(i) if *i <= out.len() => out.insert(*i, entry.clone()),
                _ => out.push(entry.clone()),
            },
            ListOp::RemoveEntry(entry) => {
                if let Some(pos) = out.iter().position(|e| e == entry) {
                    out.remove(pos);
                }
            }
            ListOp::RemoveAt(index) => {
                if *index < out.len() {
                    out.remove(*index);
                }
            }
        }
        out
    }
}

pub(crate) type ListEntryCallback = dyn FnMut(String, usize) + Send;

/// Per-list listener tables and the pre-ready op queue.
pub(crate) struct ListState {
    emitter: Emitter<ListEntryCallback>,
    pub queued: Vec<ListOp>,
}

impl ListState {
    pub fn new() -> Self {
        ListState {
            emitter: Emitter::new(),
            queued: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, kind: ListEventKind, cb: Box<ListEntryCallback>) -> SubscriptionId {
        self.emitter.on(kind.subject(), cb)
    }

    pub fn unsubscribe(&mut self, kind: ListEventKind, id: SubscriptionId) {
        self.emitter.off(kind.subject(), id);
    }

    pub fn has_entry_listeners(&self) -> bool {
        !self.emitter.is_empty()
    }

    pub fn dispatch(&mut self, changes: &[ListChange]) {
        for change in changes {
            let entry = change.entry.clone();
            let index = change.index;
            self.emitter
                .dispatch(change.kind.subject(), |cb| cb(entry.clone(), index));
        }
    }
}

/// Interpret record data as list entries; anything but an array of strings
/// is normalized away.
pub(crate) fn entries_of(data: Option<&Value>) -> Vec<String> {
    data.and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default()
}

fn structure(entries: &[String]) -> HashMap<&str, Vec<usize>> {
    let mut out: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, entry) in entries.iter().enumerate() {
        out.entry(entry.as_str()).or_default().push(i);
    }
    out
}

fn first_occurrences<'a>(entries: &'a [String]) -> Vec<&'a str> {
    let mut seen = Vec::new();
    for entry in entries {
        if !seen.contains(&entry.as_str()) {
            seen.push(entry.as_str());
        }
    }
    seen
}

/// Multiset diff between two entry vectors.
///
/// Removals come first, in order of first occurrence in `before`; then,
/// per entry in `after` order, additions (when cardinality grew, for the
/// new positions only) or moves (same cardinality, changed positions).
pub(crate) fn diff(before: &[String], after: &[String]) -> Vec<ListChange> {
    let before_map = structure(before);
    let after_map = structure(after);
    let mut changes = Vec::new();

    for entry in first_occurrences(before) {
        let old_positions = &before_map[entry];
        let new_positions = after_map.get(entry);
        let shrunk = new_positions.is_none_or(|p| p.len() < old_positions.len());
        if shrunk {
            for &position in old_positions {
                if new_positions.is_none_or(|p| !p.contains(&position)) {
                    changes.push(ListChange {
                        kind: ListEventKind::EntryRemoved,
                        entry: entry.to_owned(),
                        index: position,
                    });
                }
            }
        }
    }

    for entry in first_occurrences(after) {
        let new_positions = &after_map[entry];
        match before_map.get(entry) {
            None => {
                for &position in new_positions {
                    changes.push(ListChange {
                        kind: ListEventKind::EntryAdded,
                        entry: entry.to_owned(),
                        index: position,
                    });
                }
            }
            Some(old_positions) if old_positions != new_positions => {
                let grew = old_positions.len() != new_positions.len();
                for &position in new_positions {
                    if grew {
                        if !old_positions.contains(&position) {
                            changes.push(ListChange {
                                kind: ListEventKind::EntryAdded,
                                entry: entry.to_owned(),
                                index: position,
                            });
                        }
                    } else {
                        changes.push(ListChange {
                            kind: ListEventKind::EntryMoved,
                            entry: entry.to_owned(),
                            index: position,
                        });
                    }
                }
            }
            Some(_) => {}
        }
    }

    changes
}
