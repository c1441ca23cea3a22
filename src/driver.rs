//! The driver task: one select loop owning the socket, every timer and
//! all topic-handler state.
//!
//! Each pass writes pending wire frames, then waits on the first of: a
//! command from the handle, an inbound socket event, or the earliest
//! deadline across the connection and the handlers. Dialing (initial,
//! redirect, reconnect) happens inline between passes.

use crate::client::Command;
use crate::connection::{ClosedOutcome, Connection, SocketDirective};
use crate::errors::{ErrorKind, ErrorSink};
use crate::event::EventHandler;
use crate::options::ClientOptions;
use crate::presence::PresenceHandler;
use crate::record::RecordHandler;
use crate::rpc::RpcHandler;
use ds_protocol::{Frame, Topic};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsError = tokio_tungstenite::tungstenite::Error;

enum Tick {
    Cmd(Option<Command>),
    Socket(Option<Result<Message, WsError>>),
    Timer,
}

pub(crate) struct Driver {
    conn: Connection,
    errors: ErrorSink,
    records: RecordHandler,
    events: EventHandler,
    rpcs: RpcHandler,
    presence: PresenceHandler,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    socket: Option<WsStream>,
    dial_requested: bool,
}

impl Driver {
    pub fn new(
        options: Arc<ClientOptions>,
        conn: Connection,
        cmd_tx: mpsc::UnboundedSender<Command>,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let subscription_timeout = options.subscription_timeout;
        Driver {
            conn,
            errors: ErrorSink::new(),
            records: RecordHandler::new(Arc::clone(&options), cmd_tx.clone()),
            events: EventHandler::new(subscription_timeout, cmd_tx.clone()),
            rpcs: RpcHandler::new(Arc::clone(&options), cmd_tx),
            presence: PresenceHandler::new(subscription_timeout),
            cmd_rx,
            socket: None,
            dial_requested: false,
        }
    }

    pub async fn run(mut self) {
        loop {
            if self.conn.take_resubscribe_edge() {
                self.resubscribe();
            }
            self.flush().await;

            if self.dial_requested && self.socket.is_none() {
                self.dial_requested = false;
                self.dial().await;
                continue;
            }

            let deadline = self.next_deadline();
            let tick = tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => Tick::Cmd(cmd),
                msg = next_socket_msg(&mut self.socket) => Tick::Socket(msg),
                () = sleep_opt(deadline) => Tick::Timer,
            };

            match tick {
                Tick::Cmd(None) => break,
                Tick::Cmd(Some(cmd)) => self.on_command(cmd).await,
                Tick::Socket(msg) => self.on_socket_event(msg).await,
                Tick::Timer => self.on_deadline(Instant::now()).await,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Socket management
    // -----------------------------------------------------------------------

    async fn dial(&mut self) {
        let url = self.conn.url().to_owned();
        debug!(url = %url, "dialing");
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _response)) => {
                self.socket = Some(ws);
                self.conn.on_socket_open(Instant::now());
            }
            Err(e) => {
                self.conn
                    .on_connect_failure(&mut self.errors, &e.to_string(), Instant::now());
            }
        }
        self.errors.conn_state = self.conn.state();
    }

    /// Write every pending wire frame. A failed write counts as a
    /// transport error and tears the socket down.
    async fn flush(&mut self) {
        let mut failure = None;
        if let Some(ws) = self.socket.as_mut() {
            while let Some(text) = self.conn.take_wire() {
                if let Err(e) = ws.send(Message::Text(text.into())).await {
                    failure = Some(e.to_string());
                    break;
                }
            }
        }
        if let Some(detail) = failure {
            self.conn.on_transport_error(&mut self.errors, &detail);
            self.drop_socket().await;
        }
    }

    async fn drop_socket(&mut self) {
        if let Some(mut ws) = self.socket.take() {
            let _ = ws.close(None).await;
        }
        match self.conn.on_socket_closed(Instant::now()) {
            ClosedOutcome::Redial => self.dial_requested = true,
            ClosedOutcome::ReconnectScheduled => {}
            ClosedOutcome::Stay => self.fail_pending(),
        }
        self.errors.conn_state = self.conn.state();
    }

    async fn on_socket_event(&mut self, msg: Option<Result<Message, WsError>>) {
        match msg {
            None | Some(Ok(Message::Close(_))) => self.drop_socket().await,
            Some(Err(e)) => {
                self.conn
                    .on_transport_error(&mut self.errors, &e.to_string());
                self.drop_socket().await;
            }
            Some(Ok(Message::Text(text))) => self.process_chunk(text.as_str()).await,
            Some(Ok(Message::Ping(payload))) => {
                if let Some(ws) = self.socket.as_mut() {
                    let _ = ws.send(Message::Pong(payload)).await;
                }
            }
            Some(Ok(_)) => {}
        }
    }

    async fn process_chunk(&mut self, chunk: &str) {
        let now = Instant::now();
        let frames = self.conn.feed(chunk);
        for parsed in frames {
            match parsed {
                Err(e) => {
                    self.errors
                        .raise(Topic::Error, ErrorKind::MessageParseError, e.to_string());
                }
                Ok(frame) => {
                    if self.route(&frame, now) == SocketDirective::Close {
                        self.drop_socket().await;
                        return;
                    }
                }
            }
        }
        self.errors.conn_state = self.conn.state();
    }

    fn route(&mut self, frame: &Frame, now: Instant) -> SocketDirective {
        match frame.topic {
            Topic::Connection | Topic::Auth => {
                return self.conn.handle_frame(frame, &mut self.errors, now);
            }
            Topic::Event => self.events.handle(&mut self.conn, &mut self.errors, frame),
            Topic::Record => self
                .records
                .handle(&mut self.conn, &mut self.errors, frame, now),
            Topic::Rpc => self
                .rpcs
                .handle(&mut self.conn, &mut self.errors, frame, now),
            Topic::Presence => self
                .presence
                .handle(&mut self.conn, &mut self.errors, frame),
            Topic::Error => {
                let code = frame.part(0).unwrap_or("UNKNOWN").to_owned();
                let detail = frame.part(1).unwrap_or_default().to_owned();
                self.errors.raise_code(Topic::Error, &code, detail);
            }
        }
        SocketDirective::None
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    fn next_deadline(&self) -> Option<Instant> {
        self.conn
            .next_deadline()
            .into_iter()
            .chain(self.records.next_deadline())
            .chain(self.events.next_deadline())
            .chain(self.rpcs.next_deadline())
            .chain(self.presence.next_deadline())
            .min()
    }

    async fn on_deadline(&mut self, now: Instant) {
        if self.conn.take_due_reconnect(now).is_some() {
            self.dial_requested = true;
        }
        if self.conn.on_deadline(now, &mut self.errors) == SocketDirective::Close {
            self.drop_socket().await;
        }
        self.records.expire(now, &mut self.errors);
        self.events.expire(now, &mut self.errors);
        self.rpcs.expire(now, &mut self.conn, &mut self.errors);
        self.presence.expire(now, &mut self.errors);
    }

    // -----------------------------------------------------------------------
    // Resubscription & shutdown
    // -----------------------------------------------------------------------

    fn resubscribe(&mut self) {
        debug!("replaying subscriptions after reconnect");
        self.records.resubscribe(&mut self.conn);
        self.events.resubscribe(&mut self.conn);
        self.rpcs.resubscribe(&mut self.conn);
        self.presence.resubscribe(&mut self.conn);
    }

    fn fail_pending(&mut self) {
        self.conn.fail_pending();
        self.records.fail_pending();
        self.rpcs.fail_pending();
        self.presence.fail_pending();
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn on_command(&mut self, cmd: Command) {
        let now = Instant::now();
        match cmd {
            Command::Connect => {
                if self.socket.is_none() {
                    self.dial_requested = true;
                } else {
                    warn!("connect requested while a socket is already open");
                }
            }
            Command::Close => {
                if self.conn.close() == SocketDirective::Close {
                    self.drop_socket().await;
                } else {
                    self.fail_pending();
                }
                self.errors.conn_state = self.conn.state();
            }
            Command::Login { params, reply } => {
                if self.conn.login(params, reply, &mut self.errors) {
                    self.dial_requested = true;
                }
            }
            Command::ObserveErrors { cb, reply } => {
                let _ = reply.send(self.errors.observe(cb));
            }
            Command::UnobserveErrors { id } => {
                self.errors.unobserve(id);
            }
            Command::SendFrame(frame) => self.conn.send_frame(&frame),

            Command::EventSubscribe { name, cb, reply } => {
                let _ = reply.send(self.events.subscribe(&mut self.conn, &name, cb, now));
            }
            Command::EventUnsubscribe { name, id } => {
                self.events.unsubscribe(&mut self.conn, &name, id, now);
            }
            Command::EventEmit { name, data } => {
                self.events.emit(&mut self.conn, &name, &data);
            }
            Command::EventListen { pattern, cb } => {
                self.events
                    .listen(&mut self.conn, &mut self.errors, &pattern, cb, now);
            }
            Command::EventUnlisten { pattern } => {
                self.events
                    .unlisten(&mut self.conn, &mut self.errors, &pattern, now);
            }

            Command::GetRecord { name, reply } => {
                self.records.get_record(&mut self.conn, &name, reply, now);
            }
            Command::GetList { name, reply } => {
                self.records.get_list(&mut self.conn, &name, reply, now);
            }
            Command::RecordGet { name, path, reply } => {
                let _ = reply.send(self.records.get(&name, path.as_deref()));
            }
            Command::RecordInfo { name, reply } => {
                let _ = reply.send(self.records.info(&name));
            }
            Command::RecordSet {
                name,
                path,
                data,
                ack,
            } => {
                self.records
                    .set(&mut self.conn, &mut self.errors, &name, path, data, ack);
            }
            Command::RecordSubscribe {
                name,
                path,
                trigger_now,
                cb,
                reply,
            } => {
                let _ = reply.send(self.records.subscribe(&name, path.as_deref(), trigger_now, cb));
            }
            Command::RecordUnsubscribe { name, path, id } => {
                self.records.unsubscribe(&name, path.as_deref(), id);
            }
            Command::RecordWatchProvider { name, cb, reply } => {
                let _ = reply.send(self.records.watch_provider(&name, cb));
            }
            Command::RecordUnwatchProvider { name, id } => {
                self.records.unwatch_provider(&name, id);
            }
            Command::RecordSetMergeStrategy { name, strategy } => {
                self.records.set_merge_strategy(&name, strategy);
            }
            Command::RecordDiscard { name, reply } => {
                self.records
                    .discard(&mut self.conn, &mut self.errors, &name, reply, now);
            }
            Command::RecordDelete { name, reply } => {
                self.records
                    .delete(&mut self.conn, &mut self.errors, &name, reply, now);
            }
            Command::RecordListen { pattern, cb } => {
                self.records
                    .listen(&mut self.conn, &mut self.errors, &pattern, cb, now);
            }
            Command::RecordUnlisten { pattern } => {
                self.records
                    .unlisten(&mut self.conn, &mut self.errors, &pattern, now);
            }
            Command::RecordHas { name, reply } => {
                self.records.has(&mut self.conn, &name, reply, now);
            }
            Command::RecordSnapshot { name, reply } => {
                self.records.snapshot(&mut self.conn, &name, reply, now);
            }

            Command::ListEntries { name, reply } => {
                let _ = reply.send(self.records.list_entries(&name));
            }
            Command::ListMutate { name, op } => {
                self.records
                    .list_op(&mut self.conn, &mut self.errors, &name, op);
            }
            Command::ListSubscribe {
                name,
                kind,
                cb,
                reply,
            } => {
                let _ = reply.send(self.records.list_subscribe(&name, kind, cb));
            }
            Command::ListUnsubscribe { name, kind, id } => {
                self.records.list_unsubscribe(&name, kind, id);
            }

            Command::RpcMake { name, data, reply } => {
                self.rpcs.make(&mut self.conn, &name, &data, reply, now);
            }
            Command::RpcProvide { name, cb, reply } => {
                let _ = reply.send(self.rpcs.provide(&mut self.conn, &name, cb, now));
            }
            Command::RpcUnprovide { name } => {
                self.rpcs.unprovide(&mut self.conn, &name, now);
            }

            Command::PresenceGetAll { reply } => {
                self.presence.get_all(&mut self.conn, reply);
            }
            Command::PresenceGet { users, reply } => {
                self.presence.get(&mut self.conn, &users, reply);
            }
            Command::PresenceSubscribe { cb, reply } => {
                let _ = reply.send(self.presence.subscribe(&mut self.conn, cb, now));
            }
            Command::PresenceSubscribeUser { user, cb, reply } => {
                let _ = reply.send(self.presence.subscribe_user(&mut self.conn, &user, cb, now));
            }
            Command::PresenceUnsubscribe { id } => {
                self.presence.unsubscribe(&mut self.conn, id, now);
            }
            Command::PresenceUnsubscribeUser { user, id } => {
                self.presence.unsubscribe_user(&mut self.conn, &user, id, now);
            }
        }
    }
}

async fn next_socket_msg(socket: &mut Option<WsStream>) -> Option<Result<Message, WsError>> {
    match socket.as_mut() {
        Some(ws) => ws.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
