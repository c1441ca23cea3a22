//! A single versioned record.
//!
//! Holds the document cache and version, applies local sets optimistically,
//! reconciles conflicting remote versions through the merge strategy, and
//! fans out per-path change notifications.

use crate::connection::{Connection, ConnectionState};
use crate::emitter::{Emitter, SubscriptionId};
use crate::errors::{ErrorKind, ErrorSink};
use crate::jsonpath;
use crate::options::ClientOptions;
use crate::record::merge::MergeStrategy;
use ds_protocol::{Action, Frame, Topic, Typed};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

/// Subject for whole-document subscriptions.
const ALL_SUBJECT: &str = "__all__";

const WRITE_SUCCESS_CONFIG: &str = "{\"writeSuccess\":true}";

pub(crate) type RecordCallback = dyn FnMut(Value) + Send;
pub(crate) type ProviderFlagCallback = dyn FnMut(bool) + Send;
pub(crate) type Completion = oneshot::Sender<Result<(), RecordError>>;

/// Failure of a record operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("record {0} is already destroyed")]
    Destroyed(String),
    #[error("record {0} is not in use; call get_record first")]
    NotHeld(String),
    #[error("record data must be an object or a list")]
    InvalidData,
    #[error("ACK_TIMEOUT")]
    AckTimeout,
    #[error("RESPONSE_TIMEOUT")]
    ResponseTimeout,
    #[error("DELETE_TIMEOUT")]
    DeleteTimeout,
    #[error("error updating record as connection was closed")]
    ConnectionDown,
    /// Error code delivered by the server, e.g. in a write acknowledgement.
    #[error("{0}")]
    Remote(String),
    #[error("this client's connection was closed")]
    Closed,
}

/// A point-in-time view of record metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordInfo {
    pub version: Option<u64>,
    pub is_ready: bool,
    pub has_provider: bool,
    pub usages: u32,
}

/// An inbound document mutation, parsed by the handler.
pub(crate) enum InboundUpdate {
    Full {
        version: u64,
        data: Value,
        config: Option<String>,
    },
    Patch {
        version: u64,
        path: String,
        value: Typed,
    },
}

/// Method calls made before the record is ready, flushed in order.
pub(crate) enum QueuedOp {
    Set {
        path: Option<String>,
        data: Typed,
        ack: Option<Completion>,
    },
    Discard(Completion),
    Delete(Completion),
}

pub(crate) struct Record {
    pub name: String,
    options: Arc<ClientOptions>,
    pub version: Option<u64>,
    data: Value,
    pub usages: u32,
    is_ready: bool,
    is_destroyed: bool,
    has_provider: bool,
    pub destroy_pending: bool,
    pub merge_strategy: MergeStrategy,
    subscribers: Emitter<RecordCallback>,
    provider_watchers: Emitter<ProviderFlagCallback>,
    write_waiters: HashMap<u64, Completion>,
    ready_waiters: Vec<Completion>,
    discard_waiters: Vec<Completion>,
    delete_waiters: Vec<Completion>,
    queued_ops: Vec<QueuedOp>,
    read_ack_at: Option<Instant>,
    read_response_at: Option<Instant>,
    delete_ack_at: Option<Instant>,
    discard_ack_at: Option<Instant>,
}

impl Record {
    /// Create the record and issue the initial create-or-read.
    pub fn new(
        name: &str,
        options: Arc<ClientOptions>,
        conn: &mut Connection,
        now: Instant,
    ) -> Self {
        let merge_strategy = options.merge_strategy.clone();
        let mut record = Record {
            name: name.to_owned(),
            options,
            version: None,
            data: Value::Object(Map::new()),
            usages: 0,
            is_ready: false,
            is_destroyed: false,
            has_provider: false,
            destroy_pending: false,
            merge_strategy,
            subscribers: Emitter::new(),
            provider_watchers: Emitter::new(),
            write_waiters: HashMap::new(),
            ready_waiters: Vec::new(),
            discard_waiters: Vec::new(),
            delete_waiters: Vec::new(),
            queued_ops: Vec::new(),
            read_ack_at: None,
            read_response_at: None,
            delete_ack_at: None,
            discard_ack_at: None,
        };
        record.send_read(conn);
        record.read_ack_at = Some(now + record.options.record_read_ack_timeout);
        record.read_response_at = Some(now + record.options.record_read_timeout);
        record
    }

    fn send_read(&self, conn: &mut Connection) {
        conn.send_frame(&Frame::new(
            Topic::Record,
            Action::CreateOrRead,
            [self.name.as_str()],
        ));
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready
    }

    pub fn is_destroyed(&self) -> bool {
        self.is_destroyed
    }

    pub fn info(&self) -> RecordInfo {
        RecordInfo {
            version: self.version,
            is_ready: self.is_ready,
            has_provider: self.has_provider,
            usages: self.usages,
        }
    }

    pub fn get(&self, path: Option<&str>) -> Option<Value> {
        jsonpath::get_owned(&self.data, path)
    }

    pub fn when_ready(&mut self, tx: Completion) {
        if self.is_ready {
            let _ = tx.send(Ok(()));
        } else {
            self.ready_waiters.push(tx);
        }
    }

    // -----------------------------------------------------------------------
    // Local mutation
    // -----------------------------------------------------------------------

    pub fn set(
        &mut self,
        conn: &mut Connection,
        errors: &mut ErrorSink,
        path: Option<String>,
        data: Typed,
        ack: Option<Completion>,
    ) {
        if self.guard_destroyed(errors, "set") {
            if let Some(ack) = ack {
                let _ = ack.send(Err(RecordError::Destroyed(self.name.clone())));
            }
            return;
        }
        if !self.is_ready {
            self.queued_ops.push(QueuedOp::Set { path, data, ack });
            return;
        }
        self.do_set(conn, path.as_deref(), data, ack);
    }

    fn do_set(
        &mut self,
        conn: &mut Connection,
        path: Option<&str>,
        data: Typed,
        ack: Option<Completion>,
    ) {
        let new_value = match &data {
            Typed::Value(v) => jsonpath::set(&self.data, path, v.clone()),
            Typed::Undefined => match path {
                Some(p) => jsonpath::delete(&self.data, p),
                None => {
                    if let Some(ack) = ack {
                        let _ = ack.send(Err(RecordError::InvalidData));
                    }
                    return;
                }
            },
        };

        if new_value == self.data {
            if let Some(ack) = ack {
                let _ = ack.send(Ok(()));
            }
            return;
        }

        let version = self.version.unwrap_or(0) + 1;
        self.version = Some(version);

        let mut config = None;
        if let Some(ack) = ack {
            if matches!(
                conn.state(),
                ConnectionState::Closed | ConnectionState::Reconnecting
            ) {
                let _ = ack.send(Err(RecordError::ConnectionDown));
            } else {
                self.write_waiters.insert(version, ack);
                config = Some(WRITE_SUCCESS_CONFIG.to_owned());
            }
        }

        self.send_update(conn, path, &data, version, config.as_deref());
        self.apply_change(new_value);
    }

    fn send_update(
        &mut self,
        conn: &mut Connection,
        path: Option<&str>,
        data: &Typed,
        version: u64,
        config: Option<&str>,
    ) {
        let frame = match path {
            None => {
                let body = match data {
                    Typed::Value(v) => v.to_string(),
                    Typed::Undefined => return,
                };
                let mut parts = vec![self.name.clone(), version.to_string(), body];
                parts.extend(config.map(str::to_owned));
                Frame::new(Topic::Record, Action::Update, parts)
            }
            Some(path) => {
                let mut parts = vec![
                    self.name.clone(),
                    version.to_string(),
                    path.to_owned(),
                    data.encode(),
                ];
                parts.extend(config.map(str::to_owned));
                Frame::new(Topic::Record, Action::Patch, parts)
            }
        };
        conn.send_frame(&frame);
    }

    // -----------------------------------------------------------------------
    // Subscriptions & fan-out
    // -----------------------------------------------------------------------

    pub fn subscribe(
        &mut self,
        path: Option<&str>,
        trigger_now: bool,
        cb: Box<RecordCallback>,
    ) -> SubscriptionId {
        let subject = path.unwrap_or(ALL_SUBJECT).to_owned();
        let id = self.subscribers.on(&subject, cb);
        if trigger_now && self.is_ready {
            let value = self.get(path).unwrap_or(Value::Null);
            self.subscribers.dispatch(&subject, |cb| cb(value.clone()));
        }
        id
    }

    pub fn unsubscribe(&mut self, path: Option<&str>, id: SubscriptionId) {
        self.subscribers.off(path.unwrap_or(ALL_SUBJECT), id);
    }

    pub fn watch_provider(&mut self, cb: Box<ProviderFlagCallback>) -> SubscriptionId {
        self.provider_watchers.on("has_provider", cb)
    }

    pub fn unwatch_provider(&mut self, id: SubscriptionId) {
        self.provider_watchers.off("has_provider", id);
    }

    /// Per-path "before" values for every registered subscription.
    fn begin_change(&self) -> (Option<Value>, Vec<(String, Option<Value>)>) {
        let all_old = self
            .subscribers
            .has(ALL_SUBJECT)
            .then(|| self.data.clone());
        let path_old = self
            .subscribers
            .subjects()
            .filter(|s| *s != ALL_SUBJECT)
            .map(|path| (path.to_owned(), jsonpath::get_owned(&self.data, Some(path))))
            .collect();
        (all_old, path_old)
    }

    /// Emit for every subject whose value actually changed.
    fn complete_change(&mut self, snapshot: (Option<Value>, Vec<(String, Option<Value>)>)) {
        let (all_old, path_old) = snapshot;
        if let Some(old) = all_old {
            if old != self.data {
                let value = self.data.clone();
                self.subscribers
                    .dispatch(ALL_SUBJECT, |cb| cb(value.clone()));
            }
        }
        for (path, old) in path_old {
            let new = jsonpath::get_owned(&self.data, Some(&path));
            if new != old {
                let value = new.unwrap_or(Value::Null);
                self.subscribers.dispatch(&path, |cb| cb(value.clone()));
            }
        }
    }

    fn apply_change(&mut self, new_data: Value) {
        if self.is_destroyed {
            return;
        }
        let snapshot = self.begin_change();
        self.data = new_data;
        self.complete_change(snapshot);
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Initial read or snapshot refresh: `R|R|<name>|<version>|<json>`.
    pub fn on_read(
        &mut self,
        conn: &mut Connection,
        errors: &mut ErrorSink,
        version: u64,
        data: Value,
        now: Instant,
    ) {
        if self.version.is_none() {
            self.read_ack_at = None;
            self.read_response_at = None;
            let snapshot = self.begin_change();
            self.version = Some(version);
            self.data = data;
            self.complete_change(snapshot);
            self.set_ready(conn, now);
        } else {
            self.apply_update(
                conn,
                errors,
                InboundUpdate::Full {
                    version,
                    data,
                    config: None,
                },
            );
        }
    }

    fn set_ready(&mut self, conn: &mut Connection, now: Instant) {
        self.is_ready = true;
        for waiter in self.ready_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        let queued = std::mem::take(&mut self.queued_ops);
        for op in queued {
            match op {
                QueuedOp::Set { path, data, ack } => self.do_set(conn, path.as_deref(), data, ack),
                QueuedOp::Discard(tx) => self.do_discard(conn, tx, now),
                QueuedOp::Delete(tx) => self.do_delete(conn, tx, now),
            }
        }
        debug!(name = %self.name, version = ?self.version, "record ready");
    }

    pub fn apply_update(
        &mut self,
        conn: &mut Connection,
        errors: &mut ErrorSink,
        update: InboundUpdate,
    ) {
        let version = match &update {
            InboundUpdate::Full { version, .. } | InboundUpdate::Patch { version, .. } => *version,
        };

        if let Some(local) = self.version {
            if version != local + 1 {
                match update {
                    InboundUpdate::Patch { .. } => {
                        // A gapped patch cannot be merged blindly; ask for a
                        // full refresh.
                        conn.send_frame(&Frame::new(
                            Topic::Record,
                            Action::Snapshot,
                            [self.name.as_str()],
                        ));
                    }
                    InboundUpdate::Full {
                        version,
                        data,
                        config,
                    } => {
                        self.recover(conn, errors, version, data, config);
                    }
                }
                return;
            }
        }

        let snapshot = self.begin_change();
        self.version = Some(version);
        match update {
            InboundUpdate::Full { data, .. } => self.data = data,
            InboundUpdate::Patch { path, value, .. } => {
                self.data = match value {
                    Typed::Value(v) => jsonpath::set(&self.data, Some(&path), v),
                    Typed::Undefined => jsonpath::delete(&self.data, &path),
                };
            }
        }
        self.complete_change(snapshot);
    }

    /// Version conflict: let the merge strategy produce the canonical
    /// document for the remote version.
    pub fn recover(
        &mut self,
        conn: &mut Connection,
        errors: &mut ErrorSink,
        remote_version: u64,
        remote_data: Value,
        config: Option<String>,
    ) {
        match self
            .merge_strategy
            .merge(&self.data, &remote_data, remote_version)
        {
            Ok(merged) => {
                let old_version = self.version;
                self.version = Some(remote_version);

                if merged == remote_data {
                    self.apply_change(merged);
                    if let Some(waiter) = self.write_waiters.remove(&remote_version) {
                        let _ = waiter.send(Ok(()));
                    }
                    return;
                }

                // The merged document differs from the remote: push it as
                // the next version, carrying any write-ack registration
                // forward.
                let carries_ack = config
                    .as_deref()
                    .and_then(|c| serde_json::from_str::<Value>(c).ok())
                    .is_some_and(|c| c["writeSuccess"] == Value::Bool(true));
                let carried = old_version
                    .filter(|_| carries_ack)
                    .and_then(|v| self.write_waiters.remove(&v));

                let version = remote_version + 1;
                self.version = Some(version);
                let mut send_config = None;
                if let Some(waiter) = carried {
                    self.write_waiters.insert(version, waiter);
                    send_config = Some(WRITE_SUCCESS_CONFIG.to_owned());
                }
                self.send_update(
                    conn,
                    None,
                    &Typed::Value(merged.clone()),
                    version,
                    send_config.as_deref(),
                );
                self.apply_change(merged);
            }
            Err(_) => {
                errors.raise(
                    Topic::Record,
                    ErrorKind::VersionExists,
                    format!(
                        "received update for {remote_version} but version is {}",
                        self.version.map_or_else(|| "none".to_owned(), |v| v.to_string())
                    ),
                );
            }
        }
    }

    /// `R|WA|<name>|<versions-json>|<typed-error>`.
    pub fn on_write_ack(&mut self, errors: &mut ErrorSink, versions_json: &str, raw_error: &str) {
        let versions: Vec<u64> = match serde_json::from_str(versions_json) {
            Ok(v) => v,
            Err(e) => {
                errors.raise(Topic::Record, ErrorKind::MessageParseError, e.to_string());
                return;
            }
        };
        let error = match Typed::parse(raw_error) {
            Ok(Typed::Value(Value::Null)) | Ok(Typed::Undefined) => None,
            Ok(Typed::Value(v)) => Some(match v {
                Value::String(s) => s,
                other => other.to_string(),
            }),
            Err(e) => {
                errors.raise(Topic::Record, ErrorKind::MessageParseError, e.to_string());
                return;
            }
        };
        for version in versions {
            if let Some(waiter) = self.write_waiters.remove(&version) {
                let result = match &error {
                    None => Ok(()),
                    Some(message) => Err(RecordError::Remote(message.clone())),
                };
                let _ = waiter.send(result);
            }
        }
    }

    pub fn on_read_ack(&mut self) {
        self.read_ack_at = None;
    }

    pub fn set_has_provider(&mut self, flag: bool) {
        self.has_provider = flag;
        self.provider_watchers
            .dispatch("has_provider", |cb| cb(flag));
    }

    /// `MESSAGE_DENIED` on this record cancels its pending timeouts.
    pub fn on_denied(&mut self) {
        self.clear_timers();
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn discard(
        &mut self,
        conn: &mut Connection,
        errors: &mut ErrorSink,
        tx: Completion,
        now: Instant,
    ) {
        if self.guard_destroyed(errors, "discard") {
            let _ = tx.send(Err(RecordError::Destroyed(self.name.clone())));
            return;
        }
        if !self.is_ready {
            self.queued_ops.push(QueuedOp::Discard(tx));
            return;
        }
        self.do_discard(conn, tx, now);
    }

    fn do_discard(&mut self, conn: &mut Connection, tx: Completion, now: Instant) {
        self.usages = self.usages.saturating_sub(1);
        if self.usages > 0 {
            let _ = tx.send(Ok(()));
            return;
        }
        self.destroy_pending = true;
        self.discard_ack_at = Some(now + self.options.subscription_timeout);
        conn.send_frame(&Frame::new(
            Topic::Record,
            Action::Unsubscribe,
            [self.name.as_str()],
        ));
        self.discard_waiters.push(tx);
    }

    pub fn delete(
        &mut self,
        conn: &mut Connection,
        errors: &mut ErrorSink,
        tx: Completion,
        now: Instant,
    ) {
        if self.guard_destroyed(errors, "delete") {
            let _ = tx.send(Err(RecordError::Destroyed(self.name.clone())));
            return;
        }
        if !self.is_ready {
            self.queued_ops.push(QueuedOp::Delete(tx));
            return;
        }
        self.do_delete(conn, tx, now);
    }

    fn do_delete(&mut self, conn: &mut Connection, tx: Completion, now: Instant) {
        self.destroy_pending = true;
        self.delete_ack_at = Some(now + self.options.record_delete_timeout);
        conn.send_frame(&Frame::new(
            Topic::Record,
            Action::Delete,
            [self.name.as_str()],
        ));
        self.delete_waiters.push(tx);
    }

    /// Terminal ack: `R|A|US|<name>` or `R|A|D|<name>`.
    pub fn on_destroy_ack(&mut self, action: Action) {
        match action {
            Action::Unsubscribe => {
                for waiter in self.discard_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            Action::Delete => {
                for waiter in self.delete_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            _ => return,
        }
        self.destroy();
    }

    fn destroy(&mut self) {
        self.clear_timers();
        self.subscribers.clear();
        self.provider_watchers.clear();
        self.is_destroyed = true;
        self.is_ready = false;
    }

    fn guard_destroyed(&mut self, errors: &mut ErrorSink, method: &str) -> bool {
        if self.is_destroyed {
            errors.raise_code(
                Topic::Record,
                "RECORD_DESTROYED",
                format!("Can't invoke {method}. Record {} is already destroyed", self.name),
            );
            return true;
        }
        false
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    fn clear_timers(&mut self) {
        self.read_ack_at = None;
        self.read_response_at = None;
        self.delete_ack_at = None;
        self.discard_ack_at = None;
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.read_ack_at,
            self.read_response_at,
            self.delete_ack_at,
            self.discard_ack_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn expire(&mut self, now: Instant, errors: &mut ErrorSink) {
        if self.read_ack_at.is_some_and(|at| at <= now) {
            self.read_ack_at = None;
            errors.raise(
                Topic::Record,
                ErrorKind::AckTimeout,
                format!("No ACK message received in time for {}", self.name),
            );
        }
        if self.read_response_at.is_some_and(|at| at <= now) {
            self.read_ack_at = None;
            self.read_response_at = None;
            for waiter in self.ready_waiters.drain(..) {
                let _ = waiter.send(Err(RecordError::ResponseTimeout));
            }
            errors.raise(
                Topic::Record,
                ErrorKind::ResponseTimeout,
                format!("No response received in time for {}", self.name),
            );
        }
        if self.discard_ack_at.is_some_and(|at| at <= now) {
            self.discard_ack_at = None;
            for waiter in self.discard_waiters.drain(..) {
                let _ = waiter.send(Err(RecordError::AckTimeout));
            }
            errors.raise(
                Topic::Record,
                ErrorKind::AckTimeout,
                format!("No ACK message received in time for {}", self.name),
            );
            self.destroy();
        }
        if self.delete_ack_at.is_some_and(|at| at <= now) {
            self.delete_ack_at = None;
            for waiter in self.delete_waiters.drain(..) {
                let _ = waiter.send(Err(RecordError::DeleteTimeout));
            }
            errors.raise(
                Topic::Record,
                ErrorKind::DeleteTimeout,
                format!("No ACK message received in time for deleting {}", self.name),
            );
            self.destroy();
        }
    }

    /// Re-issue the create-or-read after a reconnect.
    pub fn resubscribe(&self, conn: &mut Connection) {
        if !self.is_destroyed && !self.destroy_pending {
            self.send_read(conn);
        }
    }

    /// Resolve every pending completion; used on deliberate close.
    pub fn fail_pending(&mut self) {
        for waiter in self.ready_waiters.drain(..) {
            let _ = waiter.send(Err(RecordError::Closed));
        }
        for waiter in self.discard_waiters.drain(..) {
            let _ = waiter.send(Err(RecordError::Closed));
        }
        for waiter in self.delete_waiters.drain(..) {
            let _ = waiter.send(Err(RecordError::Closed));
        }
        for (_, waiter) in self.write_waiters.drain() {
            let _ = waiter.send(Err(RecordError::Closed));
        }
    }
}
