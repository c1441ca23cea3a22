//! Record topic handler: the name-keyed record table, list views, pattern
//! listeners and the has/snapshot one-shot registries.

mod list;
mod merge;
mod record;

pub use list::ListEventKind;
pub use merge::{MergeFn, MergeStrategy};
pub use record::{RecordError, RecordInfo};

pub(crate) use list::{ListEntryCallback, ListOp, ListState, diff, entries_of};
pub(crate) use record::{Completion, InboundUpdate, ProviderFlagCallback, Record, RecordCallback};

use crate::ack_registry::AckTimeoutRegistry;
use crate::client::Command;
use crate::connection::Connection;
use crate::emitter::SubscriptionId;
use crate::errors::{ErrorKind, ErrorSink};
use crate::listener::{ListenCallback, Listener};
use crate::options::ClientOptions;
use crate::single_notifier::{RequestError, SingleNotifier};
use ds_protocol::{Action, Frame, Topic, Typed, error_codes};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio::time::Instant;

pub(crate) struct RecordHandler {
    options: Arc<ClientOptions>,
    cmd: UnboundedSender<Command>,
    records: HashMap<String, Record>,
    /// Records whose unsubscribe/delete is in flight; they only receive
    /// their terminal ack. A fresh `get_record` for the same name starts
    /// over in `records`.
    dying: HashMap<String, Record>,
    lists: HashMap<String, ListState>,
    listeners: HashMap<String, Listener>,
    ack_registry: AckTimeoutRegistry,
    has_notifier: SingleNotifier<bool>,
    snapshot_notifier: SingleNotifier<Value>,
}

impl RecordHandler {
    pub fn new(options: Arc<ClientOptions>, cmd: UnboundedSender<Command>) -> Self {
        let subscription_timeout = options.subscription_timeout;
        let read_timeout = options.record_read_timeout;
        RecordHandler {
            options,
            cmd,
            records: HashMap::new(),
            dying: HashMap::new(),
            lists: HashMap::new(),
            listeners: HashMap::new(),
            ack_registry: AckTimeoutRegistry::new(Topic::Record, subscription_timeout),
            has_notifier: SingleNotifier::new(Topic::Record, Action::Has, read_timeout),
            snapshot_notifier: SingleNotifier::new(Topic::Record, Action::Snapshot, read_timeout),
        }
    }

    // -----------------------------------------------------------------------
    // Record access
    // -----------------------------------------------------------------------

    /// Shared, reference-counted access: the first caller creates the
    /// record and issues the create-or-read; later callers attach to it.
    pub fn get_record(&mut self, conn: &mut Connection, name: &str, tx: Completion, now: Instant) {
        match self.records.get_mut(name) {
            Some(record) if !record.is_destroyed() => {
                record.usages += 1;
                record.when_ready(tx);
            }
            _ => {
                let mut record = Record::new(name, Arc::clone(&self.options), conn, now);
                record.usages = 1;
                record.when_ready(tx);
                self.records.insert(name.to_owned(), record);
            }
        }
    }

    pub fn get_list(&mut self, conn: &mut Connection, name: &str, tx: Completion, now: Instant) {
        self.get_record(conn, name, tx, now);
        self.lists.entry(name.to_owned()).or_insert_with(ListState::new);
    }

    fn held(&mut self, name: &str) -> Option<&mut Record> {
        self.records.get_mut(name).filter(|r| !r.is_destroyed())
    }

    pub fn get(&self, name: &str, path: Option<&str>) -> Option<Value> {
        self.records.get(name).and_then(|r| r.get(path))
    }

    pub fn info(&self, name: &str) -> Option<RecordInfo> {
        self.records.get(name).map(Record::info)
    }

    pub fn set(
        &mut self,
        conn: &mut Connection,
        errors: &mut ErrorSink,
        name: &str,
        path: Option<String>,
        data: Typed,
        ack: Option<Completion>,
    ) {
        match self.held(name) {
            Some(record) => record.set(conn, errors, path, data, ack),
            None => {
                if let Some(ack) = ack {
                    let _ = ack.send(Err(RecordError::NotHeld(name.to_owned())));
                }
            }
        }
    }

    pub fn subscribe(
        &mut self,
        name: &str,
        path: Option<&str>,
        trigger_now: bool,
        cb: Box<RecordCallback>,
    ) -> Option<SubscriptionId> {
        self.held(name).map(|r| r.subscribe(path, trigger_now, cb))
    }

    pub fn unsubscribe(&mut self, name: &str, path: Option<&str>, id: SubscriptionId) {
        if let Some(record) = self.held(name) {
            record.unsubscribe(path, id);
        }
    }

    pub fn watch_provider(
        &mut self,
        name: &str,
        cb: Box<ProviderFlagCallback>,
    ) -> Option<SubscriptionId> {
        self.held(name).map(|r| r.watch_provider(cb))
    }

    pub fn unwatch_provider(&mut self, name: &str, id: SubscriptionId) {
        if let Some(record) = self.held(name) {
            record.unwatch_provider(id);
        }
    }

    pub fn set_merge_strategy(&mut self, name: &str, strategy: MergeStrategy) {
        if let Some(record) = self.held(name) {
            record.merge_strategy = strategy;
        }
    }

    pub fn discard(
        &mut self,
        conn: &mut Connection,
        errors: &mut ErrorSink,
        name: &str,
        tx: Completion,
        now: Instant,
    ) {
        let Some(record) = self.held(name) else {
            let _ = tx.send(Err(RecordError::NotHeld(name.to_owned())));
            return;
        };
        record.discard(conn, errors, tx, now);
        self.retire_if_pending(name);
    }

    pub fn delete(
        &mut self,
        conn: &mut Connection,
        errors: &mut ErrorSink,
        name: &str,
        tx: Completion,
        now: Instant,
    ) {
        let Some(record) = self.held(name) else {
            let _ = tx.send(Err(RecordError::NotHeld(name.to_owned())));
            return;
        };
        record.delete(conn, errors, tx, now);
        self.retire_if_pending(name);
    }

    /// Once a destroy is in flight the name is free for fresh use; the
    /// dying record only waits for its terminal ack.
    fn retire_if_pending(&mut self, name: &str) {
        if self
            .records
            .get(name)
            .is_some_and(|r| r.destroy_pending)
        {
            if let Some(record) = self.records.remove(name) {
                self.dying.insert(name.to_owned(), record);
            }
        }
    }

    // -----------------------------------------------------------------------
    // has / snapshot
    // -----------------------------------------------------------------------

    pub fn has(
        &mut self,
        conn: &mut Connection,
        name: &str,
        tx: oneshot::Sender<Result<bool, RequestError>>,
        now: Instant,
    ) {
        if self.records.get(name).is_some_and(|r| !r.is_destroyed()) {
            let _ = tx.send(Ok(true));
            return;
        }
        self.has_notifier.request(conn, name, tx, now);
    }

    pub fn snapshot(
        &mut self,
        conn: &mut Connection,
        name: &str,
        tx: oneshot::Sender<Result<Value, RequestError>>,
        now: Instant,
    ) {
        if let Some(record) = self.records.get(name).filter(|r| r.is_ready()) {
            let _ = tx.send(Ok(record.get(None).unwrap_or(Value::Null)));
            return;
        }
        self.snapshot_notifier.request(conn, name, tx, now);
    }

    // -----------------------------------------------------------------------
    // Lists
    // -----------------------------------------------------------------------

    pub fn list_entries(&self, name: &str) -> Vec<String> {
        entries_of(self.records.get(name).and_then(|r| r.get(None)).as_ref())
    }

    pub fn list_op(
        &mut self,
        conn: &mut Connection,
        errors: &mut ErrorSink,
        name: &str,
        op: ListOp,
    ) {
        let Some(record) = self.records.get_mut(name).filter(|r| !r.is_destroyed()) else {
            return;
        };
        if !record.is_ready() {
            if let Some(list) = self.lists.get_mut(name) {
                list.queued.push(op);
            }
            return;
        }
        let before = entries_of(record.get(None).as_ref());
        let target = op.apply(&before);
        let payload = Value::Array(target.into_iter().map(Value::String).collect());
        record.set(conn, errors, None, Typed::Value(payload), None);
        let after = entries_of(record.get(None).as_ref());
        if let Some(list) = self.lists.get_mut(name) {
            if list.has_entry_listeners() {
                list.dispatch(&diff(&before, &after));
            }
        }
    }

    pub fn list_subscribe(
        &mut self,
        name: &str,
        kind: ListEventKind,
        cb: Box<ListEntryCallback>,
    ) -> Option<SubscriptionId> {
        self.lists.get_mut(name).map(|l| l.subscribe(kind, cb))
    }

    pub fn list_unsubscribe(&mut self, name: &str, kind: ListEventKind, id: SubscriptionId) {
        if let Some(list) = self.lists.get_mut(name) {
            list.unsubscribe(kind, id);
        }
    }

    fn flush_list_ops(&mut self, conn: &mut Connection, errors: &mut ErrorSink, name: &str) {
        let Some(list) = self.lists.get_mut(name) else {
            return;
        };
        let queued = std::mem::take(&mut list.queued);
        for op in queued {
            self.list_op(conn, errors, name, op);
        }
    }

    // -----------------------------------------------------------------------
    // Listen
    // -----------------------------------------------------------------------

    pub fn listen(
        &mut self,
        conn: &mut Connection,
        errors: &mut ErrorSink,
        pattern: &str,
        callback: Box<ListenCallback>,
        now: Instant,
    ) {
        if let Some(existing) = self.listeners.get(pattern) {
            if !existing.destroy_pending() {
                errors.raise(Topic::Record, ErrorKind::ListenerExists, pattern);
                return;
            }
            self.listeners.remove(pattern);
        }
        let listener = Listener::new(Topic::Record, pattern, callback);
        self.ack_registry.add(pattern, Action::Listen, now);
        listener.send_listen(conn);
        self.listeners.insert(pattern.to_owned(), listener);
    }

    pub fn unlisten(
        &mut self,
        conn: &mut Connection,
        errors: &mut ErrorSink,
        pattern: &str,
        now: Instant,
    ) {
        match self.listeners.get_mut(pattern) {
            None => {
                errors.raise(Topic::Record, ErrorKind::NotListening, pattern);
            }
            Some(listener) if !listener.destroy_pending() => {
                self.ack_registry.add(pattern, Action::Unlisten, now);
                listener.send_destroy(conn);
            }
            Some(_) => {
                self.listeners.remove(pattern);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound routing
    // -----------------------------------------------------------------------

    pub fn handle(
        &mut self,
        conn: &mut Connection,
        errors: &mut ErrorSink,
        frame: &Frame,
        now: Instant,
    ) {
        match frame.action {
            Action::Error => self.handle_error(conn, errors, frame),
            Action::Ack => self.handle_ack(errors, frame),
            Action::Read => self.handle_read(conn, errors, frame, now),
            Action::Update | Action::Patch => self.handle_mutation(conn, errors, frame),
            Action::Has => {
                let (Some(name), Some(raw)) = (frame.part(0), frame.part(1)) else {
                    return;
                };
                match Typed::parse(raw) {
                    Ok(typed) => {
                        let exists = typed.into_value() == Value::Bool(true);
                        self.has_notifier.receive(name, Ok(exists));
                    }
                    Err(e) => {
                        errors.raise(Topic::Record, ErrorKind::MessageParseError, e.to_string());
                    }
                }
            }
            Action::SubscriptionHasProvider => {
                let (Some(name), Some(raw)) = (frame.part(0), frame.part(1)) else {
                    return;
                };
                if let Some(record) = self.records.get_mut(name) {
                    let flag = Typed::parse(raw)
                        .map(|t| t.into_value() == Value::Bool(true))
                        .unwrap_or(false);
                    record.set_has_provider(flag);
                }
            }
            Action::SubscriptionForPatternFound | Action::SubscriptionForPatternRemoved => {
                if let Some(listener) = frame.part(0).and_then(|p| self.listeners.get_mut(p)) {
                    listener.on_frame(frame, &self.cmd);
                }
            }
            Action::WriteAcknowledgement => {
                let (Some(name), Some(versions), Some(error)) =
                    (frame.part(0), frame.part(1), frame.part(2))
                else {
                    return;
                };
                let versions = versions.to_owned();
                let error = error.to_owned();
                if let Some(record) = self.records.get_mut(name) {
                    record.on_write_ack(errors, &versions, &error);
                }
            }
            _ => {
                let name = frame.part(0).unwrap_or_default();
                errors.raise(Topic::Record, ErrorKind::UnsolicitedMessage, name);
            }
        }
    }

    fn handle_error(&mut self, conn: &mut Connection, errors: &mut ErrorSink, frame: &Frame) {
        let code = frame.part(0).unwrap_or_default().to_owned();
        let name = frame.part(1).unwrap_or_default().to_owned();

        if code == error_codes::VERSION_EXISTS {
            let version = frame.part(2).and_then(|v| v.parse::<u64>().ok());
            let data = frame.part(3).map(serde_json::from_str::<Value>);
            let config = frame.part(4).map(str::to_owned);
            match (version, data) {
                (Some(version), Some(Ok(data))) => {
                    if let Some(record) = self.records.get_mut(&name) {
                        record.recover(conn, errors, version, data, config);
                    }
                }
                _ => {
                    errors.raise(
                        Topic::Record,
                        ErrorKind::MessageParseError,
                        format!("malformed VERSION_EXISTS for {name}"),
                    );
                }
            }
        } else if code == Action::Snapshot.code() {
            let detail = frame.part(2).unwrap_or(code.as_str()).to_owned();
            self.snapshot_notifier
                .receive(&name, Err(RequestError::Remote(detail)));
        } else if code == Action::Has.code() {
            let detail = frame.part(2).unwrap_or(code.as_str()).to_owned();
            self.has_notifier
                .receive(&name, Err(RequestError::Remote(detail)));
        } else if code == error_codes::MESSAGE_DENIED {
            if let Some(record) = self.records.get_mut(&name) {
                record.on_denied();
            }
            errors.raise_code(Topic::Record, &code, name);
        } else {
            errors.raise_code(Topic::Record, &code, name);
        }
    }

    fn handle_ack(&mut self, errors: &mut ErrorSink, frame: &Frame) {
        let Some(action) = frame.part(0).and_then(Action::from_code) else {
            return;
        };
        let name = frame.part(1).unwrap_or_default().to_owned();
        match action {
            Action::Subscribe => {
                if let Some(record) = self.records.get_mut(&name) {
                    record.on_read_ack();
                }
            }
            Action::Unsubscribe | Action::Delete => {
                if let Some(record) = self.dying.get_mut(&name) {
                    record.on_destroy_ack(action);
                    if record.is_destroyed() {
                        self.dying.remove(&name);
                        if !self.records.contains_key(&name) {
                            self.lists.remove(&name);
                        }
                    }
                } else if let Some(record) =
                    self.records.get_mut(&name).filter(|r| r.destroy_pending)
                {
                    record.on_destroy_ack(action);
                    if record.is_destroyed() {
                        self.records.remove(&name);
                        self.lists.remove(&name);
                    }
                }
            }
            Action::Listen => self.ack_registry.clear(frame),
            Action::Unlisten => {
                if self
                    .listeners
                    .get(&name)
                    .is_some_and(Listener::destroy_pending)
                {
                    self.listeners.remove(&name);
                }
                self.ack_registry.clear(frame);
            }
            _ => {
                errors.raise(Topic::Record, ErrorKind::UnsolicitedMessage, name);
            }
        }
    }

    fn handle_read(
        &mut self,
        conn: &mut Connection,
        errors: &mut ErrorSink,
        frame: &Frame,
        now: Instant,
    ) {
        let Some(name) = frame.part(0).map(str::to_owned) else {
            return;
        };
        let version = frame.part(1).and_then(|v| v.parse::<u64>().ok());
        let data = frame.part(2).map(serde_json::from_str::<Value>);
        let (Some(version), Some(Ok(data))) = (version, data) else {
            errors.raise(
                Topic::Record,
                ErrorKind::MessageParseError,
                format!("malformed read for {name}"),
            );
            return;
        };

        let mut processed = false;
        if self.snapshot_notifier.has_request(&name) {
            self.snapshot_notifier.receive(&name, Ok(data.clone()));
            processed = true;
        }

        let is_list = self.lists.contains_key(&name);
        let mut became_ready = false;
        let mut list_transition = None;
        if let Some(record) = self.records.get_mut(&name) {
            processed = true;
            let was_ready = record.is_ready();
            if is_list {
                let before = entries_of(record.get(None).as_ref());
                let data = normalize_list_payload(data);
                record.on_read(conn, errors, version, data, now);
                let after = entries_of(record.get(None).as_ref());
                list_transition = Some((before, after));
            } else {
                record.on_read(conn, errors, version, data, now);
            }
            became_ready = !was_ready && record.is_ready();
        }

        if let Some((before, after)) = list_transition {
            if let Some(list) = self.lists.get_mut(&name) {
                if list.has_entry_listeners() {
                    list.dispatch(&diff(&before, &after));
                }
            }
        }
        if became_ready {
            self.flush_list_ops(conn, errors, &name);
            // A queued discard/delete may have started its teardown while
            // flushing.
            self.retire_if_pending(&name);
        }

        if !processed {
            errors.raise(Topic::Record, ErrorKind::UnsolicitedMessage, name);
        }
    }

    fn handle_mutation(&mut self, conn: &mut Connection, errors: &mut ErrorSink, frame: &Frame) {
        let Some(name) = frame.part(0).map(str::to_owned) else {
            return;
        };
        let Some(version) = frame.part(1).and_then(|v| v.parse::<u64>().ok()) else {
            errors.raise(
                Topic::Record,
                ErrorKind::MessageParseError,
                format!("malformed update for {name}"),
            );
            return;
        };

        let is_list = self.lists.contains_key(&name);
        if is_list && frame.action == Action::Patch {
            errors.raise(
                Topic::Record,
                ErrorKind::MessageParseError,
                format!("PATCH is not supported for lists ({name})"),
            );
            return;
        }

        let update = match frame.action {
            Action::Update => {
                let data = frame.part(2).map(serde_json::from_str::<Value>);
                let Some(Ok(data)) = data else {
                    errors.raise(
                        Topic::Record,
                        ErrorKind::MessageParseError,
                        format!("malformed update for {name}"),
                    );
                    return;
                };
                let data = if is_list {
                    normalize_list_payload(data)
                } else {
                    data
                };
                InboundUpdate::Full {
                    version,
                    data,
                    config: frame.part(3).map(str::to_owned),
                }
            }
            _ => {
                let (Some(path), Some(raw)) = (frame.part(2), frame.part(3)) else {
                    errors.raise(
                        Topic::Record,
                        ErrorKind::MessageParseError,
                        format!("malformed patch for {name}"),
                    );
                    return;
                };
                match Typed::parse(raw) {
                    Ok(value) => InboundUpdate::Patch {
                        version,
                        path: path.to_owned(),
                        value,
                    },
                    Err(e) => {
                        errors.raise(Topic::Record, ErrorKind::MessageParseError, e.to_string());
                        return;
                    }
                }
            }
        };

        let mut list_transition = None;
        match self.records.get_mut(&name) {
            Some(record) => {
                if is_list {
                    let before = entries_of(record.get(None).as_ref());
                    record.apply_update(conn, errors, update);
                    let after = entries_of(record.get(None).as_ref());
                    list_transition = Some((before, after));
                } else {
                    record.apply_update(conn, errors, update);
                }
            }
            None => {
                errors.raise(Topic::Record, ErrorKind::UnsolicitedMessage, name.as_str());
                return;
            }
        }

        if let Some((before, after)) = list_transition {
            if let Some(list) = self.lists.get_mut(&name) {
                if list.has_entry_listeners() {
                    list.dispatch(&diff(&before, &after));
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Timers & lifecycle
    // -----------------------------------------------------------------------

    pub fn next_deadline(&self) -> Option<Instant> {
        self.records
            .values()
            .chain(self.dying.values())
            .filter_map(Record::next_deadline)
            .chain(self.ack_registry.next_deadline())
            .chain(self.has_notifier.next_deadline())
            .chain(self.snapshot_notifier.next_deadline())
            .min()
    }

    pub fn expire(&mut self, now: Instant, errors: &mut ErrorSink) {
        for record in self.records.values_mut().chain(self.dying.values_mut()) {
            record.expire(now, errors);
        }
        self.records.retain(|_, r| !r.is_destroyed());
        self.dying.retain(|_, r| !r.is_destroyed());
        self.ack_registry.expire(now, errors);
        self.has_notifier.expire(now, errors);
        self.snapshot_notifier.expire(now, errors);
    }

    /// Replay reads, listens and one-shot requests after a reconnect.
    pub fn resubscribe(&mut self, conn: &mut Connection) {
        let mut names: Vec<&String> = self.records.keys().collect();
        names.sort();
        for name in names {
            self.records[name].resubscribe(conn);
        }
        let mut patterns: Vec<&String> = self
            .listeners
            .iter()
            .filter(|(_, l)| !l.destroy_pending())
            .map(|(p, _)| p)
            .collect();
        patterns.sort();
        for pattern in patterns {
            conn.send_frame(&Frame::new(Topic::Record, Action::Listen, [pattern.as_str()]));
        }
        self.has_notifier.resend(conn);
        self.snapshot_notifier.resend(conn);
    }

    /// Resolve every pending completion; used on deliberate close.
    pub fn fail_pending(&mut self) {
        for record in self.records.values_mut().chain(self.dying.values_mut()) {
            record.fail_pending();
        }
        self.has_notifier.fail_all();
        self.snapshot_notifier.fail_all();
    }
}

/// Lists are whole-replaced; anything that is not an array arrives as the
/// empty list.
fn normalize_list_payload(data: Value) -> Value {
    if data.is_array() {
        data
    } else {
        Value::Array(Vec::new())
    }
}
