//! RPC coordinator: provider registry and caller correlation tracking.
//!
//! Callers get a completion with two deadlines (ack and response).
//! Providers receive an [`RpcResponder`] that auto-acks on the next driver
//! turn unless disabled, and completes through exactly one of send, reject
//! or error.

use crate::ack_registry::AckTimeoutRegistry;
use crate::client::Command;
use crate::connection::Connection;
use crate::errors::{ErrorKind, ErrorSink};
use crate::options::ClientOptions;
use ds_protocol::{Action, Frame, Topic, Typed, encode_typed, error_codes};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Failure of an RPC call or registration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("ACK_TIMEOUT")]
    AckTimeout,
    #[error("RESPONSE_TIMEOUT")]
    ResponseTimeout,
    /// Error code sent by the server or the remote provider.
    #[error("{0}")]
    Remote(String),
    #[error("rpc {0} already completed")]
    AlreadyCompleted(String),
    #[error("rpc {0} already registered")]
    AlreadyProvided(String),
    #[error("invalid rpc name")]
    InvalidName,
    #[error("this client's connection was closed")]
    Closed,
}

pub(crate) type ProviderCallback = dyn FnMut(Value, RpcResponder) + Send;

// ---------------------------------------------------------------------------
// Provider-side response object
// ---------------------------------------------------------------------------

struct ResponseState {
    acknowledged: bool,
    complete: bool,
    auto_ack: bool,
}

/// Lets an RPC provider respond to one request.
///
/// Unless [`disable_auto_ack`](RpcResponder::disable_auto_ack) is called
/// before the provider callback returns, the request is acknowledged
/// automatically on the next driver turn.
pub struct RpcResponder {
    cmd: UnboundedSender<Command>,
    name: String,
    correlation_id: String,
    state: Arc<Mutex<ResponseState>>,
}

impl RpcResponder {
    /// Keep the request unacknowledged until `ack`/`send` is called.
    pub fn disable_auto_ack(&self) {
        self.state.lock().expect("responder lock").auto_ack = false;
    }

    /// Explicitly acknowledge the request. Idempotent; the ack frame is
    /// written at most once.
    pub fn ack(&self) {
        let mut state = self.state.lock().expect("responder lock");
        if state.acknowledged {
            return;
        }
        state.acknowledged = true;
        drop(state);
        self.write(Frame::new(
            Topic::Rpc,
            Action::Ack,
            [
                Action::Request.code(),
                self.name.as_str(),
                self.correlation_id.as_str(),
            ],
        ));
    }

    /// Complete the request with response data. Implicitly acks.
    pub fn send(&self, data: &Value) -> Result<(), RpcError> {
        {
            let mut state = self.state.lock().expect("responder lock");
            if state.complete {
                return Err(RpcError::AlreadyCompleted(self.name.clone()));
            }
            state.complete = true;
        }
        self.ack();
        self.write(Frame::new(
            Topic::Rpc,
            Action::Response,
            [
                self.name.clone(),
                self.correlation_id.clone(),
                encode_typed(data),
            ],
        ));
        Ok(())
    }

    /// Reject the request so the server can reroute it.
    pub fn reject(&self) -> Result<(), RpcError> {
        {
            let mut state = self.state.lock().expect("responder lock");
            if state.complete {
                return Err(RpcError::AlreadyCompleted(self.name.clone()));
            }
            state.complete = true;
            state.acknowledged = true;
            state.auto_ack = false;
        }
        self.write(Frame::new(
            Topic::Rpc,
            Action::Rejection,
            [self.name.clone(), self.correlation_id.clone()],
        ));
        Ok(())
    }

    /// Complete the request with an error string.
    pub fn error(&self, message: &str) -> Result<(), RpcError> {
        {
            let mut state = self.state.lock().expect("responder lock");
            if state.complete {
                return Err(RpcError::AlreadyCompleted(self.name.clone()));
            }
            state.complete = true;
            state.acknowledged = true;
            state.auto_ack = false;
        }
        self.write(Frame::new(
            Topic::Rpc,
            Action::Error,
            [
                message.to_owned(),
                self.name.clone(),
                self.correlation_id.clone(),
            ],
        ));
        Ok(())
    }

    fn write(&self, frame: Frame) {
        let _ = self.cmd.send(Command::SendFrame(frame));
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

struct PendingRpc {
    name: String,
    ack_at: Option<Instant>,
    response_at: Instant,
    tx: oneshot::Sender<Result<Value, RpcError>>,
}

struct PendingAutoAck {
    at: Instant,
    name: String,
    correlation_id: String,
    state: Arc<Mutex<ResponseState>>,
}

pub(crate) struct RpcHandler {
    options: Arc<ClientOptions>,
    cmd: UnboundedSender<Command>,
    providers: HashMap<String, Box<ProviderCallback>>,
    calls: HashMap<String, PendingRpc>,
    auto_acks: Vec<PendingAutoAck>,
    ack_registry: AckTimeoutRegistry,
}

impl RpcHandler {
    pub fn new(options: Arc<ClientOptions>, cmd: UnboundedSender<Command>) -> Self {
        let subscription_timeout = options.subscription_timeout;
        RpcHandler {
            options,
            cmd,
            providers: HashMap::new(),
            calls: HashMap::new(),
            auto_acks: Vec::new(),
            ack_registry: AckTimeoutRegistry::new(Topic::Rpc, subscription_timeout),
        }
    }

    pub fn provide(
        &mut self,
        conn: &mut Connection,
        name: &str,
        callback: Box<ProviderCallback>,
        now: Instant,
    ) -> Result<(), RpcError> {
        if name.is_empty() {
            return Err(RpcError::InvalidName);
        }
        if self.providers.contains_key(name) {
            return Err(RpcError::AlreadyProvided(name.to_owned()));
        }
        self.ack_registry.add(name, Action::Subscribe, now);
        self.providers.insert(name.to_owned(), callback);
        conn.send_frame(&Frame::new(Topic::Rpc, Action::Subscribe, [name]));
        Ok(())
    }

    pub fn unprovide(&mut self, conn: &mut Connection, name: &str, now: Instant) {
        if self.providers.remove(name).is_some() {
            self.ack_registry.add(name, Action::Unsubscribe, now);
            conn.send_frame(&Frame::new(Topic::Rpc, Action::Unsubscribe, [name]));
        }
    }

    pub fn make(
        &mut self,
        conn: &mut Connection,
        name: &str,
        data: &Value,
        tx: oneshot::Sender<Result<Value, RpcError>>,
        now: Instant,
    ) {
        if name.is_empty() {
            let _ = tx.send(Err(RpcError::InvalidName));
            return;
        }
        let correlation_id = correlation_id();
        conn.send_frame(&Frame::new(
            Topic::Rpc,
            Action::Request,
            [name, correlation_id.as_str(), encode_typed(data).as_str()],
        ));
        self.calls.insert(
            correlation_id,
            PendingRpc {
                name: name.to_owned(),
                ack_at: Some(now + self.options.rpc_ack_timeout),
                response_at: now + self.options.rpc_response_timeout,
                tx,
            },
        );
    }

    pub fn handle(
        &mut self,
        conn: &mut Connection,
        errors: &mut ErrorSink,
        frame: &Frame,
        now: Instant,
    ) {
        match frame.action {
            Action::Request => {
                self.respond_to_rpc(conn, errors, frame, now);
                return;
            }
            Action::Ack
                if matches!(
                    frame.part(0),
                    Some(code) if code == Action::Subscribe.code()
                        || code == Action::Unsubscribe.code()
                ) =>
            {
                self.ack_registry.clear(frame);
                return;
            }
            Action::Error => {
                let code = frame.part(0).unwrap_or_default();
                if code == error_codes::MESSAGE_PERMISSION_ERROR {
                    return;
                }
                if code == error_codes::MESSAGE_DENIED
                    && frame.part(2) == Some(Action::Subscribe.code())
                {
                    if let Some(name) = frame.part(1) {
                        self.ack_registry.remove(name, Action::Subscribe);
                    }
                    return;
                }
            }
            _ => {}
        }

        let correlation_id = match frame.action {
            Action::Error | Action::Ack => {
                if frame.part(0) == Some(error_codes::MESSAGE_DENIED)
                    && frame.part(2) == Some(Action::Request.code())
                {
                    frame.part(3)
                } else {
                    frame.part(2)
                }
            }
            _ => frame.part(1),
        };
        let Some(correlation_id) = correlation_id else {
            errors.raise(
                Topic::Rpc,
                ErrorKind::MessageParseError,
                "rpc frame without a correlation id",
            );
            return;
        };

        if !self.calls.contains_key(correlation_id) {
            errors.raise(
                Topic::Rpc,
                ErrorKind::UnsolicitedMessage,
                format!("unsolicited rpc frame for correlation id {correlation_id}"),
            );
            return;
        }

        match frame.action {
            Action::Ack => {
                if let Some(pending) = self.calls.get_mut(correlation_id) {
                    pending.ack_at = None;
                }
            }
            Action::Response => {
                let pending = self.calls.remove(correlation_id).expect("checked above");
                let result = match frame.part(2).map(Typed::parse) {
                    Some(Ok(typed)) => Ok(typed.into_value()),
                    Some(Err(e)) => {
                        errors.raise(Topic::Rpc, ErrorKind::MessageParseError, e.to_string());
                        Err(RpcError::Remote(error_codes::MESSAGE_PARSE_ERROR.to_owned()))
                    }
                    None => Ok(Value::Null),
                };
                let _ = pending.tx.send(result);
            }
            Action::Error => {
                let pending = self.calls.remove(correlation_id).expect("checked above");
                let code = frame.part(0).unwrap_or_default().to_owned();
                let _ = pending.tx.send(Err(RpcError::Remote(code)));
            }
            _ => {}
        }
    }

    fn respond_to_rpc(
        &mut self,
        conn: &mut Connection,
        errors: &mut ErrorSink,
        frame: &Frame,
        now: Instant,
    ) {
        let (Some(name), Some(correlation_id)) = (frame.part(0), frame.part(1)) else {
            errors.raise(
                Topic::Rpc,
                ErrorKind::MessageParseError,
                "rpc request without name or correlation id",
            );
            return;
        };
        let data = match frame.part(2).map(Typed::parse) {
            Some(Ok(typed)) => typed.into_value(),
            Some(Err(e)) => {
                errors.raise(Topic::Rpc, ErrorKind::MessageParseError, e.to_string());
                return;
            }
            None => Value::Null,
        };

        if !self.providers.contains_key(name) {
            conn.send_frame(&Frame::new(
                Topic::Rpc,
                Action::Rejection,
                [name, correlation_id],
            ));
            return;
        }

        let state = Arc::new(Mutex::new(ResponseState {
            acknowledged: false,
            complete: false,
            auto_ack: true,
        }));
        let responder = RpcResponder {
            cmd: self.cmd.clone(),
            name: name.to_owned(),
            correlation_id: correlation_id.to_owned(),
            state: Arc::clone(&state),
        };
        self.auto_acks.push(PendingAutoAck {
            at: now,
            name: name.to_owned(),
            correlation_id: correlation_id.to_owned(),
            state,
        });
        let provider = self.providers.get_mut(name).expect("checked above");
        provider(data, responder);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let calls = self
            .calls
            .values()
            .flat_map(|c| c.ack_at.into_iter().chain(std::iter::once(c.response_at)));
        let auto_acks = self.auto_acks.iter().map(|a| a.at);
        calls
            .chain(auto_acks)
            .chain(self.ack_registry.next_deadline())
            .min()
    }

    pub fn expire(&mut self, now: Instant, conn: &mut Connection, errors: &mut ErrorSink) {
        // Auto-acks fire unless the provider disabled them or completed.
        let due: Vec<PendingAutoAck> = {
            let mut due = Vec::new();
            self.auto_acks.retain_mut(|a| {
                if a.at <= now {
                    due.push(PendingAutoAck {
                        at: a.at,
                        name: std::mem::take(&mut a.name),
                        correlation_id: std::mem::take(&mut a.correlation_id),
                        state: Arc::clone(&a.state),
                    });
                    false
                } else {
                    true
                }
            });
            due
        };
        for auto_ack in due {
            let mut state = auto_ack.state.lock().expect("responder lock");
            if state.auto_ack && !state.acknowledged && !state.complete {
                state.acknowledged = true;
                drop(state);
                conn.send_frame(&Frame::new(
                    Topic::Rpc,
                    Action::Ack,
                    [
                        Action::Request.code(),
                        auto_ack.name.as_str(),
                        auto_ack.correlation_id.as_str(),
                    ],
                ));
            }
        }

        // Caller deadlines: either timeout tears the call down.
        let timed_out: Vec<(String, RpcError)> = self
            .calls
            .iter()
            .filter_map(|(corr, call)| {
                if call.ack_at.is_some_and(|at| at <= now) {
                    Some((corr.clone(), RpcError::AckTimeout))
                } else if call.response_at <= now {
                    Some((corr.clone(), RpcError::ResponseTimeout))
                } else {
                    None
                }
            })
            .collect();
        for (correlation_id, error) in timed_out {
            if let Some(pending) = self.calls.remove(&correlation_id) {
                let _ = pending.tx.send(Err(error));
            }
        }

        self.ack_registry.expire(now, errors);
    }

    /// Replay provider registrations after a reconnect.
    pub fn resubscribe(&mut self, conn: &mut Connection) {
        let mut names: Vec<&String> = self.providers.keys().collect();
        names.sort();
        for name in names {
            conn.send_frame(&Frame::new(Topic::Rpc, Action::Subscribe, [name.as_str()]));
        }
    }

    /// Resolve every in-flight call; used on deliberate close.
    pub fn fail_pending(&mut self) {
        for (_, pending) in self.calls.drain() {
            let _ = pending.tx.send(Err(RpcError::Closed));
        }
        self.auto_acks.clear();
    }
}

// ---------------------------------------------------------------------------
// Correlation ids
// ---------------------------------------------------------------------------

fn to_base36(mut n: u128) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_owned();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ascii")
}

/// Locally-generated, server-opaque call token: base-36 timestamp plus a
/// base-36 random tail.
pub(crate) fn correlation_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tail: u64 = rand::random();
    format!("{}-{}", to_base36(millis), to_base36(u128::from(tail >> 16)))
}
