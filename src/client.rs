//! The client handle and its command channel.
//!
//! A [`Client`] is a cheap clonable handle. All state lives in the driver
//! task; handle methods submit commands over an unbounded channel and
//! await oneshot completions resolved on the driver.

use crate::connection::{Connection, ConnectionState};
use crate::driver::Driver;
use crate::emitter::SubscriptionId;
use crate::errors::{ClientError, ErrorEvent, LoginResult};
use crate::event::EventCallback;
use crate::handles::{Events, Presence, Records, Rpcs};
use crate::listener::ListenCallback;
use crate::options::ClientOptions;
use crate::presence::PresenceCallback;
use crate::record::{
    Completion, ListEntryCallback, ListEventKind, ListOp, MergeStrategy, ProviderFlagCallback,
    RecordCallback, RecordInfo,
};
use crate::rpc::{ProviderCallback, RpcError};
use crate::single_notifier::RequestError;
use ds_protocol::{Frame, Typed};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// Everything the driver can be asked to do.
pub(crate) enum Command {
    Connect,
    Close,
    Login {
        params: Value,
        reply: oneshot::Sender<LoginResult>,
    },
    ObserveErrors {
        cb: Box<dyn FnMut(ErrorEvent) + Send>,
        reply: oneshot::Sender<SubscriptionId>,
    },
    UnobserveErrors {
        id: SubscriptionId,
    },
    /// Raw outbound frame from a responder object.
    SendFrame(Frame),

    EventSubscribe {
        name: String,
        cb: Box<EventCallback>,
        reply: oneshot::Sender<SubscriptionId>,
    },
    EventUnsubscribe {
        name: String,
        id: SubscriptionId,
    },
    EventEmit {
        name: String,
        data: Value,
    },
    EventListen {
        pattern: String,
        cb: Box<ListenCallback>,
    },
    EventUnlisten {
        pattern: String,
    },

    GetRecord {
        name: String,
        reply: Completion,
    },
    GetList {
        name: String,
        reply: Completion,
    },
    RecordGet {
        name: String,
        path: Option<String>,
        reply: oneshot::Sender<Option<Value>>,
    },
    RecordInfo {
        name: String,
        reply: oneshot::Sender<Option<RecordInfo>>,
    },
    RecordSet {
        name: String,
        path: Option<String>,
        data: Typed,
        ack: Option<Completion>,
    },
    RecordSubscribe {
        name: String,
        path: Option<String>,
        trigger_now: bool,
        cb: Box<RecordCallback>,
        reply: oneshot::Sender<Option<SubscriptionId>>,
    },
    RecordUnsubscribe {
        name: String,
        path: Option<String>,
        id: SubscriptionId,
    },
    RecordWatchProvider {
        name: String,
        cb: Box<ProviderFlagCallback>,
        reply: oneshot::Sender<Option<SubscriptionId>>,
    },
    RecordUnwatchProvider {
        name: String,
        id: SubscriptionId,
    },
    RecordSetMergeStrategy {
        name: String,
        strategy: MergeStrategy,
    },
    RecordDiscard {
        name: String,
        reply: Completion,
    },
    RecordDelete {
        name: String,
        reply: Completion,
    },
    RecordListen {
        pattern: String,
        cb: Box<ListenCallback>,
    },
    RecordUnlisten {
        pattern: String,
    },
    RecordHas {
        name: String,
        reply: oneshot::Sender<Result<bool, RequestError>>,
    },
    RecordSnapshot {
        name: String,
        reply: oneshot::Sender<Result<Value, RequestError>>,
    },

    ListEntries {
        name: String,
        reply: oneshot::Sender<Vec<String>>,
    },
    ListMutate {
        name: String,
        op: ListOp,
    },
    ListSubscribe {
        name: String,
        kind: ListEventKind,
        cb: Box<ListEntryCallback>,
        reply: oneshot::Sender<Option<SubscriptionId>>,
    },
    ListUnsubscribe {
        name: String,
        kind: ListEventKind,
        id: SubscriptionId,
    },

    RpcMake {
        name: String,
        data: Value,
        reply: oneshot::Sender<Result<Value, RpcError>>,
    },
    RpcProvide {
        name: String,
        cb: Box<ProviderCallback>,
        reply: oneshot::Sender<Result<(), RpcError>>,
    },
    RpcUnprovide {
        name: String,
    },

    PresenceGetAll {
        reply: oneshot::Sender<Result<Vec<String>, RequestError>>,
    },
    PresenceGet {
        users: Vec<String>,
        reply: oneshot::Sender<Result<Vec<String>, RequestError>>,
    },
    PresenceSubscribe {
        cb: Box<PresenceCallback>,
        reply: oneshot::Sender<SubscriptionId>,
    },
    PresenceSubscribeUser {
        user: String,
        cb: Box<PresenceCallback>,
        reply: oneshot::Sender<SubscriptionId>,
    },
    PresenceUnsubscribe {
        id: SubscriptionId,
    },
    PresenceUnsubscribeUser {
        user: String,
        id: SubscriptionId,
    },
}

/// A deepstream client.
///
/// Create one with [`Client::new`], call [`connect`](Client::connect) and
/// [`login`](Client::login), then use the topic handles from
/// [`records`](Client::records), [`events`](Client::events),
/// [`rpcs`](Client::rpcs) and [`presence`](Client::presence).
#[derive(Clone)]
pub struct Client {
    cmd: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl Client {
    /// Create a client with default options. The driver task is spawned on
    /// the current tokio runtime; no socket is opened until `connect`.
    pub fn new(url: &str) -> Self {
        Self::with_options(url, ClientOptions::default())
    }

    pub fn with_options(url: &str, options: ClientOptions) -> Self {
        let options = Arc::new(options);
        let (conn, state_rx) = Connection::new(url, Arc::clone(&options));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let driver = Driver::new(options, conn, cmd_tx.clone(), cmd_rx);
        tokio::spawn(driver.run());
        Client {
            cmd: cmd_tx,
            state_rx,
        }
    }

    pub(crate) fn send(&self, command: Command) {
        let _ = self.cmd.send(command);
    }

    /// Open the socket to the configured URL.
    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    /// Close deliberately; reconnection is suppressed and pending
    /// completions resolve as closed.
    pub fn close(&self) {
        self.send(Command::Close);
    }

    /// Authenticate. Params are sent once the connection reaches the
    /// awaiting-authentication state; a deliberately closed connection is
    /// reopened first.
    pub async fn login(&self, params: Value) -> Result<LoginResult, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Login { params, reply });
        rx.await.map_err(|_| ClientError::Closed)
    }

    /// The current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// A watch receiver broadcasting every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Register a global error observer. Without one, errors are logged at
    /// error level.
    pub async fn on_error(
        &self,
        cb: impl FnMut(ErrorEvent) + Send + 'static,
    ) -> Result<SubscriptionId, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ObserveErrors {
            cb: Box::new(cb),
            reply,
        });
        rx.await.map_err(|_| ClientError::Closed)
    }

    pub fn remove_error_observer(&self, id: SubscriptionId) {
        self.send(Command::UnobserveErrors { id });
    }

    pub fn records(&self) -> Records {
        Records::new(self.clone())
    }

    pub fn events(&self) -> Events {
        Events::new(self.clone())
    }

    pub fn rpcs(&self) -> Rpcs {
        Rpcs::new(self.clone())
    }

    pub fn presence(&self) -> Presence {
        Presence::new(self.clone())
    }
}
