//! Connection state machine.
//!
//! Owns everything about the session except the socket itself: the state
//! variable, the framing buffer, the FIFO queue for frames issued while
//! not open, authentication bookkeeping, heartbeat deadlines and reconnect
//! backoff. The driver performs all I/O and feeds results back in; every
//! method here is synchronous and returns directives for the driver to act
//! on.

use crate::errors::{ErrorKind, ErrorSink, LoginResult};
use crate::options::ClientOptions;
use ds_protocol::{Action, Frame, FrameReader, ParseError, Topic, Typed, error_codes};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Connection lifecycle states. Every transition is broadcast to state
/// observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    AwaitingConnection,
    Challenging,
    AwaitingAuthentication,
    Authenticating,
    Open,
    Error,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConnectionState::Closed => "closed",
            ConnectionState::AwaitingConnection => "awaiting_connection",
            ConnectionState::Challenging => "challenging",
            ConnectionState::AwaitingAuthentication => "awaiting_authentication",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Open => "open",
            ConnectionState::Error => "error",
            ConnectionState::Reconnecting => "reconnecting",
        })
    }
}

/// What the driver must do with the socket after a state-machine step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SocketDirective {
    None,
    /// Close the current socket; `on_socket_closed` decides what follows.
    Close,
}

/// What follows a socket close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ClosedOutcome {
    /// Redirect in progress: dial the (already updated) URL immediately.
    Redial,
    /// A reconnect attempt was scheduled; its deadline is in
    /// `next_deadline`.
    ReconnectScheduled,
    /// Deliberate close or reconnect exhaustion; stay down.
    Stay,
}

pub(crate) struct Connection {
    options: Arc<ClientOptions>,
    original_url: String,
    url: String,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    reader: FrameReader,
    /// Frames issued by handlers while not open, FIFO.
    queued: VecDeque<String>,
    /// Encoded frames ready for the driver to write now.
    wire_out: VecDeque<String>,
    socket_open: bool,
    deliberate_close: bool,
    redirecting: bool,
    challenge_denied: bool,
    too_many_auth_attempts: bool,
    connection_auth_timeout: bool,
    auth_params: Option<Value>,
    auth_waiters: Vec<oneshot::Sender<LoginResult>>,
    reconnect_attempt: u32,
    reconnect_at: Option<Instant>,
    last_heartbeat: Option<Instant>,
    heartbeat_check_at: Option<Instant>,
    was_reconnecting: bool,
    resubscribe_pending: bool,
}

impl Connection {
    pub fn new(url: &str, options: Arc<ClientOptions>) -> (Self, watch::Receiver<ConnectionState>) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Closed);
        let conn = Connection {
            options,
            original_url: url.to_owned(),
            url: url.to_owned(),
            state: ConnectionState::Closed,
            state_tx,
            reader: FrameReader::new(),
            queued: VecDeque::new(),
            wire_out: VecDeque::new(),
            socket_open: false,
            deliberate_close: false,
            redirecting: false,
            challenge_denied: false,
            too_many_auth_attempts: false,
            connection_auth_timeout: false,
            auth_params: None,
            auth_waiters: Vec::new(),
            reconnect_attempt: 0,
            reconnect_at: None,
            last_heartbeat: None,
            heartbeat_check_at: None,
            was_reconnecting: false,
            resubscribe_pending: false,
        };
        (conn, state_rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!(from = %self.state, to = %state, "connection state");
        self.state = state;
        if state == ConnectionState::Reconnecting {
            self.was_reconnecting = true;
        } else if state == ConnectionState::Open {
            self.reconnect_attempt = 0;
            if self.was_reconnecting {
                self.was_reconnecting = false;
                self.resubscribe_pending = true;
            }
        }
        let _ = self.state_tx.send(state);
    }

    /// True exactly once after each reconnecting→open edge; handlers replay
    /// their subscriptions when this fires.
    pub fn take_resubscribe_edge(&mut self) -> bool {
        std::mem::take(&mut self.resubscribe_pending)
    }

    fn latched(&self) -> bool {
        self.challenge_denied || self.too_many_auth_attempts || self.connection_auth_timeout
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Send a handler frame: written immediately in the open state,
    /// otherwise queued FIFO until the state next enters open.
    pub fn send_frame(&mut self, frame: &Frame) {
        let text = frame.encode();
        if self.state == ConnectionState::Open && self.socket_open {
            self.wire_out.push_back(text);
        } else {
            self.queued.push_back(text);
        }
    }

    /// Connection-level frames (challenge response, auth request, pong)
    /// bypass the open-state queue.
    fn send_now(&mut self, frame: &Frame) {
        self.wire_out.push_back(frame.encode());
    }

    /// Next encoded frame the driver should write, if any.
    pub fn take_wire(&mut self) -> Option<String> {
        self.wire_out.pop_front()
    }

    fn drain_queued(&mut self) {
        while let Some(text) = self.queued.pop_front() {
            self.wire_out.push_back(text);
        }
    }

    // -----------------------------------------------------------------------
    // Socket lifecycle (driver callbacks)
    // -----------------------------------------------------------------------

    pub fn on_socket_open(&mut self, now: Instant) {
        self.socket_open = true;
        self.reader.clear();
        self.last_heartbeat = Some(now);
        self.heartbeat_check_at = Some(now + self.options.heartbeat_interval);
        self.reconnect_at = None;
        self.set_state(ConnectionState::AwaitingConnection);
    }

    pub fn on_connect_failure(&mut self, errors: &mut ErrorSink, detail: &str, now: Instant) {
        self.on_transport_error(
            errors,
            &format!("Can't connect! Deepstream server unreachable on {}: {detail}", self.url),
        );
        self.try_reconnect(now);
    }

    pub fn on_transport_error(&mut self, errors: &mut ErrorSink, message: &str) {
        self.heartbeat_check_at = None;
        self.set_state(ConnectionState::Error);
        errors.conn_state = self.state;
        errors.raise(Topic::Connection, ErrorKind::ConnectionError, message);
    }

    pub fn on_socket_closed(&mut self, now: Instant) -> ClosedOutcome {
        self.socket_open = false;
        self.heartbeat_check_at = None;
        if self.redirecting {
            self.redirecting = false;
            ClosedOutcome::Redial
        } else if self.deliberate_close {
            self.set_state(ConnectionState::Closed);
            ClosedOutcome::Stay
        } else {
            self.try_reconnect(now)
        }
    }

    fn try_reconnect(&mut self, now: Instant) -> ClosedOutcome {
        if self.reconnect_attempt < self.options.max_reconnect_attempts {
            self.set_state(ConnectionState::Reconnecting);
            let delay = self.options.reconnect_delay(self.reconnect_attempt);
            self.reconnect_attempt += 1;
            self.reconnect_at = Some(now + delay);
            ClosedOutcome::ReconnectScheduled
        } else {
            // Exhausted: latch the connection down in the error state.
            self.reconnect_at = None;
            self.deliberate_close = true;
            self.set_state(ConnectionState::Error);
            ClosedOutcome::Stay
        }
    }

    /// If the reconnect backoff has elapsed, restore the original URL
    /// (redirects are one-shot) and return it for dialing.
    pub fn take_due_reconnect(&mut self, now: Instant) -> Option<String> {
        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect_at = None;
            self.url = self.original_url.clone();
            Some(self.url.clone())
        } else {
            None
        }
    }

    /// Deliberate close requested by the user.
    pub fn close(&mut self) -> SocketDirective {
        self.deliberate_close = true;
        self.heartbeat_check_at = None;
        self.reconnect_at = None;
        if self.socket_open {
            SocketDirective::Close
        } else {
            self.set_state(ConnectionState::Closed);
            SocketDirective::None
        }
    }

    // -----------------------------------------------------------------------
    // Authentication
    // -----------------------------------------------------------------------

    /// Record auth params and a completion. Returns true when the driver
    /// must (re)dial because the connection was deliberately closed.
    pub fn login(
        &mut self,
        params: Value,
        tx: oneshot::Sender<LoginResult>,
        errors: &mut ErrorSink,
    ) -> bool {
        if self.latched() {
            let msg = "this client's connection was closed";
            errors.raise(Topic::Error, ErrorKind::IsClosed, msg);
            let _ = tx.send(LoginResult::failure(error_codes::IS_CLOSED, None));
            return false;
        }

        self.auth_params = Some(params);
        self.auth_waiters.push(tx);

        let mut needs_dial = false;
        if self.deliberate_close && self.state == ConnectionState::Closed {
            self.deliberate_close = false;
            needs_dial = true;
        }
        if self.state == ConnectionState::AwaitingAuthentication {
            self.send_auth_params();
        }
        needs_dial
    }

    fn send_auth_params(&mut self) {
        let params = self.auth_params.clone().unwrap_or(Value::Null);
        self.set_state(ConnectionState::Authenticating);
        let body = params.to_string();
        self.send_now(&Frame::new(Topic::Auth, Action::Request, [body]));
    }

    fn resolve_auth_waiters(&mut self, result: &LoginResult) {
        for waiter in self.auth_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Feed an inbound chunk through the framing buffer.
    pub fn feed(&mut self, chunk: &str) -> Vec<Result<Frame, ParseError>> {
        self.reader.push(chunk)
    }

    /// Handle a connection- or auth-topic frame.
    pub fn handle_frame(
        &mut self,
        frame: &Frame,
        errors: &mut ErrorSink,
        now: Instant,
    ) -> SocketDirective {
        let directive = match frame.topic {
            Topic::Connection => self.handle_connection_frame(frame, errors, now),
            Topic::Auth => {
                self.handle_auth_frame(frame, errors);
                SocketDirective::None
            }
            _ => SocketDirective::None,
        };
        errors.conn_state = self.state;
        directive
    }

    fn handle_connection_frame(
        &mut self,
        frame: &Frame,
        errors: &mut ErrorSink,
        now: Instant,
    ) -> SocketDirective {
        match frame.action {
            Action::Ping => {
                self.last_heartbeat = Some(now);
                self.send_now(&Frame::new(Topic::Connection, Action::Pong, Vec::<String>::new()));
            }
            Action::Ack => {
                self.set_state(ConnectionState::AwaitingAuthentication);
                errors.conn_state = self.state;
                if self.auth_params.is_some() {
                    self.send_auth_params();
                }
            }
            Action::Challenge => {
                self.set_state(ConnectionState::Challenging);
                let url = self.url.clone();
                self.send_now(&Frame::new(Topic::Connection, Action::ChallengeResponse, [url]));
            }
            Action::Rejection => {
                self.challenge_denied = true;
                self.deliberate_close = true;
                return SocketDirective::Close;
            }
            Action::Redirect => {
                if let Some(url) = frame.part(0) {
                    self.url = url.to_owned();
                    self.redirecting = true;
                    return SocketDirective::Close;
                }
                warn!("redirect frame without a target URL");
            }
            Action::Error => {
                if frame.part(0) == Some(error_codes::CONNECTION_AUTHENTICATION_TIMEOUT) {
                    self.deliberate_close = true;
                    self.connection_auth_timeout = true;
                    let detail = frame.part(1).unwrap_or_default().to_owned();
                    errors.raise(
                        Topic::Connection,
                        ErrorKind::ConnectionAuthenticationTimeout,
                        detail,
                    );
                    let result = LoginResult::failure(
                        error_codes::CONNECTION_AUTHENTICATION_TIMEOUT,
                        None,
                    );
                    self.resolve_auth_waiters(&result);
                }
            }
            other => {
                debug!(action = %other, "ignoring connection frame");
            }
        }
        SocketDirective::None
    }

    fn handle_auth_frame(&mut self, frame: &Frame, errors: &mut ErrorSink) {
        match frame.action {
            Action::Error => {
                let code = frame.part(0).unwrap_or_default().to_owned();
                if code == error_codes::TOO_MANY_AUTH_ATTEMPTS {
                    self.deliberate_close = true;
                    self.too_many_auth_attempts = true;
                } else {
                    self.set_state(ConnectionState::AwaitingAuthentication);
                }
                let data = frame.part(1).and_then(|raw| self.decode_auth_data(raw, errors));
                let result = LoginResult {
                    success: false,
                    error: (!code.is_empty()).then_some(code),
                    data,
                };
                self.resolve_auth_waiters(&result);
            }
            Action::Ack => {
                self.set_state(ConnectionState::Open);
                let data = frame.part(0).and_then(|raw| self.decode_auth_data(raw, errors));
                let result = LoginResult {
                    success: true,
                    error: None,
                    data,
                };
                self.resolve_auth_waiters(&result);
                self.drain_queued();
            }
            other => {
                debug!(action = %other, "ignoring auth frame");
            }
        }
    }

    fn decode_auth_data(&self, raw: &str, errors: &mut ErrorSink) -> Option<Value> {
        if raw.is_empty() {
            return None;
        }
        match Typed::parse(raw) {
            Ok(typed) => Some(typed.into_value()),
            Err(e) => {
                errors.raise(Topic::Error, ErrorKind::MessageParseError, e.to_string());
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.heartbeat_check_at, self.reconnect_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Periodic heartbeat check: close the socket when the last PING is
    /// older than the tolerance, otherwise re-arm.
    pub fn on_deadline(&mut self, now: Instant, errors: &mut ErrorSink) -> SocketDirective {
        let Some(check_at) = self.heartbeat_check_at else {
            return SocketDirective::None;
        };
        if check_at > now {
            return SocketDirective::None;
        }
        let elapsed = self
            .last_heartbeat
            .map_or(self.options.heartbeat_tolerance(), |hb| now - hb);
        if elapsed >= self.options.heartbeat_tolerance() {
            self.heartbeat_check_at = None;
            self.on_transport_error(
                errors,
                &format!(
                    "heartbeat not received in the last {} ms",
                    self.options.heartbeat_tolerance().as_millis()
                ),
            );
            SocketDirective::Close
        } else {
            self.heartbeat_check_at = Some(now + self.options.heartbeat_interval);
            SocketDirective::None
        }
    }

    /// Resolve every pending completion that depends on the server.
    pub fn fail_pending(&mut self) {
        let result = LoginResult::failure(error_codes::IS_CLOSED, None);
        self.resolve_auth_waiters(&result);
    }

    /// Put the state machine straight into the open state, as if the
    /// challenge and authentication handshake had completed.
    #[cfg(test)]
    pub fn force_open(&mut self) {
        self.socket_open = true;
        self.set_state(ConnectionState::Open);
    }
}
