//! Topic-scoped handles: the public API surface for records, events,
//! RPCs and presence.

use crate::client::{Client, Command};
use crate::emitter::SubscriptionId;
use crate::errors::ClientError;
use crate::listener::ListenEvent;
use crate::record::{ListEventKind, ListOp, MergeStrategy, RecordError, RecordInfo, entries_of};
use crate::rpc::{RpcError, RpcResponder};
use crate::single_notifier::RequestError;
use ds_protocol::Typed;
use serde_json::Value;
use tokio::sync::oneshot;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Publish/subscribe and pattern listening.
#[derive(Clone)]
pub struct Events {
    client: Client,
}

impl Events {
    pub(crate) fn new(client: Client) -> Self {
        Events { client }
    }

    /// Subscribe to an event name; the callback runs on the driver task
    /// for every local emit and every inbound event.
    pub async fn subscribe(
        &self,
        name: &str,
        cb: impl FnMut(Value) + Send + 'static,
    ) -> Result<SubscriptionId, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.client.send(Command::EventSubscribe {
            name: name.to_owned(),
            cb: Box::new(cb),
            reply,
        });
        rx.await.map_err(|_| ClientError::Closed)
    }

    pub fn unsubscribe(&self, name: &str, id: SubscriptionId) {
        self.client.send(Command::EventUnsubscribe {
            name: name.to_owned(),
            id,
        });
    }

    /// Publish an event. Local subscribers fire synchronously on the
    /// driver; the frame is queued if the connection is not open.
    pub fn emit(&self, name: &str, data: Value) {
        self.client.send(Command::EventEmit {
            name: name.to_owned(),
            data,
        });
    }

    pub fn listen(&self, pattern: &str, cb: impl FnMut(ListenEvent) + Send + 'static) {
        self.client.send(Command::EventListen {
            pattern: pattern.to_owned(),
            cb: Box::new(cb),
        });
    }

    pub fn unlisten(&self, pattern: &str) {
        self.client.send(Command::EventUnlisten {
            pattern: pattern.to_owned(),
        });
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Access to versioned records and lists.
#[derive(Clone)]
pub struct Records {
    client: Client,
}

impl Records {
    pub(crate) fn new(client: Client) -> Self {
        Records { client }
    }

    /// Get (or create) a record and wait until it is ready. Concurrent
    /// callers share the record; each call counts one usage.
    pub async fn get_record(&self, name: &str) -> Result<RecordHandle, RecordError> {
        let (reply, rx) = oneshot::channel();
        self.client.send(Command::GetRecord {
            name: name.to_owned(),
            reply,
        });
        rx.await.map_err(|_| RecordError::Closed)??;
        Ok(RecordHandle {
            client: self.client.clone(),
            name: name.to_owned(),
        })
    }

    /// Get (or create) a list view over a record.
    pub async fn get_list(&self, name: &str) -> Result<ListHandle, RecordError> {
        let (reply, rx) = oneshot::channel();
        self.client.send(Command::GetList {
            name: name.to_owned(),
            reply,
        });
        rx.await.map_err(|_| RecordError::Closed)??;
        Ok(ListHandle {
            client: self.client.clone(),
            name: name.to_owned(),
        })
    }

    /// One-shot read of a record's current server state, without
    /// subscribing. Served locally when the record is cached and ready.
    pub async fn snapshot(&self, name: &str) -> Result<Value, RequestError> {
        let (reply, rx) = oneshot::channel();
        self.client.send(Command::RecordSnapshot {
            name: name.to_owned(),
            reply,
        });
        rx.await.map_err(|_| RequestError::Closed)?
    }

    /// Whether a record exists server-side.
    pub async fn has(&self, name: &str) -> Result<bool, RequestError> {
        let (reply, rx) = oneshot::channel();
        self.client.send(Command::RecordHas {
            name: name.to_owned(),
            reply,
        });
        rx.await.map_err(|_| RequestError::Closed)?
    }

    pub fn listen(&self, pattern: &str, cb: impl FnMut(ListenEvent) + Send + 'static) {
        self.client.send(Command::RecordListen {
            pattern: pattern.to_owned(),
            cb: Box::new(cb),
        });
    }

    pub fn unlisten(&self, pattern: &str) {
        self.client.send(Command::RecordUnlisten {
            pattern: pattern.to_owned(),
        });
    }
}

/// One shared record. Clones refer to the same record; use
/// [`discard`](RecordHandle::discard) per `get_record` call.
#[derive(Clone)]
pub struct RecordHandle {
    client: Client,
    name: String,
}

impl RecordHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The whole document.
    pub async fn get(&self) -> Result<Value, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.client.send(Command::RecordGet {
            name: self.name.clone(),
            path: None,
            reply,
        });
        Ok(rx.await.map_err(|_| ClientError::Closed)?.unwrap_or(Value::Null))
    }

    /// The value at a path, if present.
    pub async fn get_path(&self, path: &str) -> Result<Option<Value>, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.client.send(Command::RecordGet {
            name: self.name.clone(),
            path: Some(path.to_owned()),
            reply,
        });
        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Version, readiness and provider metadata.
    pub async fn info(&self) -> Result<Option<RecordInfo>, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.client.send(Command::RecordInfo {
            name: self.name.clone(),
            reply,
        });
        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Replace the whole document. Applied optimistically; made before the
    /// record is ready it is queued.
    pub fn set(&self, data: Value) -> Result<(), RecordError> {
        if !data.is_object() && !data.is_array() {
            return Err(RecordError::InvalidData);
        }
        self.client.send(Command::RecordSet {
            name: self.name.clone(),
            path: None,
            data: Typed::Value(data),
            ack: None,
        });
        Ok(())
    }

    /// Write the value at a path.
    pub fn set_path(&self, path: &str, data: Value) {
        self.client.send(Command::RecordSet {
            name: self.name.clone(),
            path: Some(path.to_owned()),
            data: Typed::Value(data),
            ack: None,
        });
    }

    /// Delete the value at a path (writes the undefined sentinel).
    pub fn erase(&self, path: &str) {
        self.client.send(Command::RecordSet {
            name: self.name.clone(),
            path: Some(path.to_owned()),
            data: Typed::Undefined,
            ack: None,
        });
    }

    /// Replace the whole document and wait for the server's write
    /// acknowledgement.
    pub async fn set_with_ack(&self, data: Value) -> Result<(), RecordError> {
        if !data.is_object() && !data.is_array() {
            return Err(RecordError::InvalidData);
        }
        self.set_typed_with_ack(None, Typed::Value(data)).await
    }

    /// Write a path and wait for the server's write acknowledgement.
    pub async fn set_path_with_ack(&self, path: &str, data: Value) -> Result<(), RecordError> {
        self.set_typed_with_ack(Some(path.to_owned()), Typed::Value(data))
            .await
    }

    async fn set_typed_with_ack(
        &self,
        path: Option<String>,
        data: Typed,
    ) -> Result<(), RecordError> {
        let (ack, rx) = oneshot::channel();
        self.client.send(Command::RecordSet {
            name: self.name.clone(),
            path,
            data,
            ack: Some(ack),
        });
        rx.await.map_err(|_| RecordError::Closed)?
    }

    /// Subscribe to whole-document changes.
    pub async fn subscribe(
        &self,
        cb: impl FnMut(Value) + Send + 'static,
    ) -> Result<SubscriptionId, RecordError> {
        self.subscribe_inner(None, false, Box::new(cb)).await
    }

    /// Subscribe to changes at a path. With `trigger_now` the callback
    /// fires immediately with the current value if the record is ready.
    pub async fn subscribe_path(
        &self,
        path: &str,
        trigger_now: bool,
        cb: impl FnMut(Value) + Send + 'static,
    ) -> Result<SubscriptionId, RecordError> {
        self.subscribe_inner(Some(path.to_owned()), trigger_now, Box::new(cb))
            .await
    }

    async fn subscribe_inner(
        &self,
        path: Option<String>,
        trigger_now: bool,
        cb: Box<dyn FnMut(Value) + Send>,
    ) -> Result<SubscriptionId, RecordError> {
        let (reply, rx) = oneshot::channel();
        self.client.send(Command::RecordSubscribe {
            name: self.name.clone(),
            path,
            trigger_now,
            cb,
            reply,
        });
        rx.await
            .map_err(|_| RecordError::Closed)?
            .ok_or_else(|| RecordError::NotHeld(self.name.clone()))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.client.send(Command::RecordUnsubscribe {
            name: self.name.clone(),
            path: None,
            id,
        });
    }

    pub fn unsubscribe_path(&self, path: &str, id: SubscriptionId) {
        self.client.send(Command::RecordUnsubscribe {
            name: self.name.clone(),
            path: Some(path.to_owned()),
            id,
        });
    }

    /// Watch the subscription-has-provider flag.
    pub async fn watch_provider(
        &self,
        cb: impl FnMut(bool) + Send + 'static,
    ) -> Result<SubscriptionId, RecordError> {
        let (reply, rx) = oneshot::channel();
        self.client.send(Command::RecordWatchProvider {
            name: self.name.clone(),
            cb: Box::new(cb),
            reply,
        });
        rx.await
            .map_err(|_| RecordError::Closed)?
            .ok_or_else(|| RecordError::NotHeld(self.name.clone()))
    }

    pub fn unwatch_provider(&self, id: SubscriptionId) {
        self.client.send(Command::RecordUnwatchProvider {
            name: self.name.clone(),
            id,
        });
    }

    /// Replace the conflict resolver for this record.
    pub fn set_merge_strategy(&self, strategy: MergeStrategy) {
        self.client.send(Command::RecordSetMergeStrategy {
            name: self.name.clone(),
            strategy,
        });
    }

    /// Drop this usage. The last usage unsubscribes server-side and waits
    /// for the ack.
    pub async fn discard(self) -> Result<(), RecordError> {
        let (reply, rx) = oneshot::channel();
        self.client.send(Command::RecordDiscard {
            name: self.name.clone(),
            reply,
        });
        rx.await.map_err(|_| RecordError::Closed)?
    }

    /// Delete the record server-side and wait for the ack.
    pub async fn delete(self) -> Result<(), RecordError> {
        let (reply, rx) = oneshot::channel();
        self.client.send(Command::RecordDelete {
            name: self.name.clone(),
            reply,
        });
        rx.await.map_err(|_| RecordError::Closed)?
    }
}

/// A record whose data is an array of entry names.
#[derive(Clone)]
pub struct ListHandle {
    client: Client,
    name: String,
}

impl ListHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn entries(&self) -> Result<Vec<String>, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.client.send(Command::ListEntries {
            name: self.name.clone(),
            reply,
        });
        rx.await.map_err(|_| ClientError::Closed)
    }

    pub async fn is_empty(&self) -> Result<bool, ClientError> {
        Ok(self.entries().await?.is_empty())
    }

    pub fn set_entries(&self, entries: Vec<String>) {
        self.client.send(Command::ListMutate {
            name: self.name.clone(),
            op: ListOp::SetEntries(entries),
        });
    }

    /// Append, or insert at `index`.
    pub fn add_entry(&self, entry: &str, index: Option<usize>) {
        self.client.send(Command::ListMutate {
            name: self.name.clone(),
            op: ListOp::AddEntry {
                entry: entry.to_owned(),
                index,
            },
        });
    }

    /// Remove the first occurrence of `entry`.
    pub fn remove_entry(&self, entry: &str) {
        self.client.send(Command::ListMutate {
            name: self.name.clone(),
            op: ListOp::RemoveEntry(entry.to_owned()),
        });
    }

    /// Remove the entry at `index`.
    pub fn remove_at(&self, index: usize) {
        self.client.send(Command::ListMutate {
            name: self.name.clone(),
            op: ListOp::RemoveAt(index),
        });
    }

    /// Subscribe to whole-list changes, delivered as entry vectors.
    pub async fn subscribe(
        &self,
        mut cb: impl FnMut(Vec<String>) + Send + 'static,
    ) -> Result<SubscriptionId, RecordError> {
        let (reply, rx) = oneshot::channel();
        self.client.send(Command::RecordSubscribe {
            name: self.name.clone(),
            path: None,
            trigger_now: false,
            cb: Box::new(move |value: Value| cb(entries_of(Some(&value)))),
            reply,
        });
        rx.await
            .map_err(|_| RecordError::Closed)?
            .ok_or_else(|| RecordError::NotHeld(self.name.clone()))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.client.send(Command::RecordUnsubscribe {
            name: self.name.clone(),
            path: None,
            id,
        });
    }

    pub async fn on_entry_added(
        &self,
        cb: impl FnMut(String, usize) + Send + 'static,
    ) -> Result<SubscriptionId, RecordError> {
        self.entry_subscribe(ListEventKind::EntryAdded, Box::new(cb))
            .await
    }

    pub async fn on_entry_removed(
        &self,
        cb: impl FnMut(String, usize) + Send + 'static,
    ) -> Result<SubscriptionId, RecordError> {
        self.entry_subscribe(ListEventKind::EntryRemoved, Box::new(cb))
            .await
    }

    pub async fn on_entry_moved(
        &self,
        cb: impl FnMut(String, usize) + Send + 'static,
    ) -> Result<SubscriptionId, RecordError> {
        self.entry_subscribe(ListEventKind::EntryMoved, Box::new(cb))
            .await
    }

    async fn entry_subscribe(
        &self,
        kind: ListEventKind,
        cb: Box<dyn FnMut(String, usize) + Send>,
    ) -> Result<SubscriptionId, RecordError> {
        let (reply, rx) = oneshot::channel();
        self.client.send(Command::ListSubscribe {
            name: self.name.clone(),
            kind,
            cb,
            reply,
        });
        rx.await
            .map_err(|_| RecordError::Closed)?
            .ok_or_else(|| RecordError::NotHeld(self.name.clone()))
    }

    pub fn unsubscribe_entries(&self, kind: ListEventKind, id: SubscriptionId) {
        self.client.send(Command::ListUnsubscribe {
            name: self.name.clone(),
            kind,
            id,
        });
    }

    pub async fn discard(self) -> Result<(), RecordError> {
        let (reply, rx) = oneshot::channel();
        self.client.send(Command::RecordDiscard {
            name: self.name.clone(),
            reply,
        });
        rx.await.map_err(|_| RecordError::Closed)?
    }

    pub async fn delete(self) -> Result<(), RecordError> {
        let (reply, rx) = oneshot::channel();
        self.client.send(Command::RecordDelete {
            name: self.name.clone(),
            reply,
        });
        rx.await.map_err(|_| RecordError::Closed)?
    }
}

// ---------------------------------------------------------------------------
// RPCs
// ---------------------------------------------------------------------------

/// Request/response calls and provider registration.
#[derive(Clone)]
pub struct Rpcs {
    client: Client,
}

impl Rpcs {
    pub(crate) fn new(client: Client) -> Self {
        Rpcs { client }
    }

    /// Call a remote procedure and wait for its response.
    pub async fn make(&self, name: &str, data: Value) -> Result<Value, RpcError> {
        let (reply, rx) = oneshot::channel();
        self.client.send(Command::RpcMake {
            name: name.to_owned(),
            data,
            reply,
        });
        rx.await.map_err(|_| RpcError::Closed)?
    }

    /// Register this client as a provider. The callback receives the
    /// decoded request data and an [`RpcResponder`].
    pub async fn provide(
        &self,
        name: &str,
        cb: impl FnMut(Value, RpcResponder) + Send + 'static,
    ) -> Result<(), RpcError> {
        let (reply, rx) = oneshot::channel();
        self.client.send(Command::RpcProvide {
            name: name.to_owned(),
            cb: Box::new(cb),
            reply,
        });
        rx.await.map_err(|_| RpcError::Closed)?
    }

    pub fn unprovide(&self, name: &str) {
        self.client.send(Command::RpcUnprovide {
            name: name.to_owned(),
        });
    }
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

/// Who-is-online queries and notifications.
#[derive(Clone)]
pub struct Presence {
    client: Client,
}

impl Presence {
    pub(crate) fn new(client: Client) -> Self {
        Presence { client }
    }

    /// Every authenticated user currently connected.
    pub async fn get_all(&self) -> Result<Vec<String>, RequestError> {
        let (reply, rx) = oneshot::channel();
        self.client.send(Command::PresenceGetAll { reply });
        rx.await.map_err(|_| RequestError::Closed)?
    }

    /// Which of `users` are currently connected.
    pub async fn get(&self, users: Vec<String>) -> Result<Vec<String>, RequestError> {
        let (reply, rx) = oneshot::channel();
        self.client.send(Command::PresenceGet { users, reply });
        rx.await.map_err(|_| RequestError::Closed)?
    }

    /// Subscribe to every user's joins and leaves; the callback receives
    /// `(user, online)`.
    pub async fn subscribe(
        &self,
        cb: impl FnMut(String, bool) + Send + 'static,
    ) -> Result<SubscriptionId, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.client.send(Command::PresenceSubscribe {
            cb: Box::new(cb),
            reply,
        });
        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Subscribe to one user's joins and leaves.
    pub async fn subscribe_user(
        &self,
        user: &str,
        cb: impl FnMut(String, bool) + Send + 'static,
    ) -> Result<SubscriptionId, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.client.send(Command::PresenceSubscribeUser {
            user: user.to_owned(),
            cb: Box::new(cb),
            reply,
        });
        rx.await.map_err(|_| ClientError::Closed)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.client.send(Command::PresenceUnsubscribe { id });
    }

    pub fn unsubscribe_user(&self, user: &str, id: SubscriptionId) {
        self.client.send(Command::PresenceUnsubscribeUser {
            user: user.to_owned(),
            id,
        });
    }
}
