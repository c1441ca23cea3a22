//! Error taxonomy and the client-wide error path.
//!
//! Recoverable protocol errors resolve the originating operation's future.
//! Everything else flows through [`ErrorSink`]: registered observers get an
//! [`ErrorEvent`]; with no observer the event is logged at error level.

use crate::connection::ConnectionState;
use crate::emitter::SubscriptionId;
use ds_protocol::{Topic, error_codes};
use tracing::error;

/// Known error/event codes surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectionError,
    ConnectionAuthenticationTimeout,
    TooManyAuthAttempts,
    IsClosed,
    AckTimeout,
    ResponseTimeout,
    DeleteTimeout,
    MessageDenied,
    MessageParseError,
    MessagePermissionError,
    NotAuthenticated,
    NotSubscribed,
    UnsolicitedMessage,
    ListenerExists,
    NotListening,
    VersionExists,
    NoRpcProvider,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::ConnectionError => error_codes::CONNECTION_ERROR,
            ErrorKind::ConnectionAuthenticationTimeout => {
                error_codes::CONNECTION_AUTHENTICATION_TIMEOUT
            }
            ErrorKind::TooManyAuthAttempts => error_codes::TOO_MANY_AUTH_ATTEMPTS,
            ErrorKind::IsClosed => error_codes::IS_CLOSED,
            ErrorKind::AckTimeout => error_codes::ACK_TIMEOUT,
            ErrorKind::ResponseTimeout => error_codes::RESPONSE_TIMEOUT,
            ErrorKind::DeleteTimeout => error_codes::DELETE_TIMEOUT,
            ErrorKind::MessageDenied => error_codes::MESSAGE_DENIED,
            ErrorKind::MessageParseError => error_codes::MESSAGE_PARSE_ERROR,
            ErrorKind::MessagePermissionError => error_codes::MESSAGE_PERMISSION_ERROR,
            ErrorKind::NotAuthenticated => error_codes::NOT_AUTHENTICATED,
            ErrorKind::NotSubscribed => error_codes::NOT_SUBSCRIBED,
            ErrorKind::UnsolicitedMessage => error_codes::UNSOLICITED_MESSAGE,
            ErrorKind::ListenerExists => error_codes::LISTENER_EXISTS,
            ErrorKind::NotListening => error_codes::NOT_LISTENING,
            ErrorKind::VersionExists => error_codes::VERSION_EXISTS,
            ErrorKind::NoRpcProvider => error_codes::NO_RPC_PROVIDER,
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            error_codes::CONNECTION_ERROR => ErrorKind::ConnectionError,
            error_codes::CONNECTION_AUTHENTICATION_TIMEOUT => {
                ErrorKind::ConnectionAuthenticationTimeout
            }
            error_codes::TOO_MANY_AUTH_ATTEMPTS => ErrorKind::TooManyAuthAttempts,
            error_codes::IS_CLOSED => ErrorKind::IsClosed,
            error_codes::ACK_TIMEOUT => ErrorKind::AckTimeout,
            error_codes::RESPONSE_TIMEOUT => ErrorKind::ResponseTimeout,
            error_codes::DELETE_TIMEOUT => ErrorKind::DeleteTimeout,
            error_codes::MESSAGE_DENIED => ErrorKind::MessageDenied,
            error_codes::MESSAGE_PARSE_ERROR => ErrorKind::MessageParseError,
            error_codes::MESSAGE_PERMISSION_ERROR => ErrorKind::MessagePermissionError,
            error_codes::NOT_AUTHENTICATED => ErrorKind::NotAuthenticated,
            error_codes::NOT_SUBSCRIBED => ErrorKind::NotSubscribed,
            error_codes::UNSOLICITED_MESSAGE => ErrorKind::UnsolicitedMessage,
            error_codes::LISTENER_EXISTS => ErrorKind::ListenerExists,
            error_codes::NOT_LISTENING => ErrorKind::NotListening,
            error_codes::VERSION_EXISTS => ErrorKind::VersionExists,
            error_codes::NO_RPC_PROVIDER => ErrorKind::NoRpcProvider,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// An error broadcast to error observers.
///
/// `code` is usually one of [`ErrorKind`]'s codes but is kept as a string
/// so unrecognized server codes pass through untouched.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub topic: Topic,
    pub code: String,
    pub message: String,
}

/// Failures of client-side operations that never reached the server.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The client was closed (or its driver task is gone).
    #[error("this client's connection was closed")]
    Closed,
}

/// Outcome of a `login` call.
#[derive(Debug, Clone)]
pub struct LoginResult {
    pub success: bool,
    /// Error code on failure, e.g. `TOO_MANY_AUTH_ATTEMPTS` or `IS_CLOSED`.
    pub error: Option<String>,
    /// Optional server-supplied payload (auth data or error detail).
    pub data: Option<serde_json::Value>,
}

impl LoginResult {
    pub(crate) fn failure(error: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        LoginResult {
            success: false,
            error: Some(error.into()),
            data,
        }
    }
}

type ErrorObserver = Box<dyn FnMut(ErrorEvent) + Send>;

/// Dispatches global errors to registered observers.
///
/// Tracks the current connection state so ack/response timeouts raised
/// before authentication can carry the not-authenticated hint.
pub(crate) struct ErrorSink {
    observers: Vec<(SubscriptionId, ErrorObserver)>,
    next_id: u64,
    pub(crate) conn_state: ConnectionState,
}

impl ErrorSink {
    pub fn new() -> Self {
        ErrorSink {
            observers: Vec::new(),
            next_id: 1,
            conn_state: ConnectionState::Closed,
        }
    }

    pub fn observe(&mut self, cb: ErrorObserver) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.observers.push((id, cb));
        id
    }

    pub fn unobserve(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(sid, _)| *sid != id);
        self.observers.len() != before
    }

    pub fn raise(&mut self, topic: Topic, kind: ErrorKind, message: impl Into<String>) {
        if matches!(kind, ErrorKind::AckTimeout | ErrorKind::ResponseTimeout)
            && self.conn_state == ConnectionState::AwaitingAuthentication
        {
            self.dispatch(ErrorEvent {
                topic: Topic::Error,
                code: ErrorKind::NotAuthenticated.code().to_owned(),
                message: "Your message timed out because you're not authenticated. \
                          Have you called login()?"
                    .to_owned(),
            });
        }
        self.dispatch(ErrorEvent {
            topic,
            code: kind.code().to_owned(),
            message: message.into(),
        });
    }

    /// Raise with a raw wire code (which may be unknown to this client).
    pub fn raise_code(&mut self, topic: Topic, code: &str, message: impl Into<String>) {
        match ErrorKind::from_code(code) {
            Some(kind) => self.raise(topic, kind, message),
            None => self.dispatch(ErrorEvent {
                topic,
                code: code.to_owned(),
                message: message.into(),
            }),
        }
    }

    fn dispatch(&mut self, event: ErrorEvent) {
        if self.observers.is_empty() {
            error!(topic = %event.topic, code = %event.code, message = %event.message,
                "unobserved client error");
            return;
        }
        let ids: Vec<SubscriptionId> = self.observers.iter().map(|(id, _)| *id).collect();
        for id in ids {
            if let Some((_, cb)) = self.observers.iter_mut().find(|(sid, _)| *sid == id) {
                cb(event.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn collect(sink: &mut ErrorSink) -> Arc<Mutex<Vec<ErrorEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        sink.observe(Box::new(move |e| seen2.lock().unwrap().push(e)));
        seen
    }

    #[test]
    fn kind_codes_roundtrip() {
        for kind in [
            ErrorKind::ConnectionError,
            ErrorKind::AckTimeout,
            ErrorKind::VersionExists,
            ErrorKind::NoRpcProvider,
        ] {
            assert_eq!(ErrorKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(ErrorKind::from_code("SOMETHING_NEW"), None);
    }

    #[test]
    fn observers_receive_events() {
        let mut sink = ErrorSink::new();
        let seen = collect(&mut sink);
        sink.raise(Topic::Event, ErrorKind::AckTimeout, "no ack for news");
        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].code, "ACK_TIMEOUT");
    }

    #[test]
    fn timeout_before_auth_adds_hint() {
        let mut sink = ErrorSink::new();
        let seen = collect(&mut sink);
        sink.conn_state = ConnectionState::AwaitingAuthentication;
        sink.raise(Topic::Rpc, ErrorKind::AckTimeout, "no ack for addTwo");
        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].code, "NOT_AUTHENTICATED");
        assert_eq!(events[1].code, "ACK_TIMEOUT");
    }

    #[test]
    fn unknown_codes_pass_through() {
        let mut sink = ErrorSink::new();
        let seen = collect(&mut sink);
        sink.raise_code(Topic::Record, "FUTURE_CODE", "something new");
        assert_eq!(seen.lock().unwrap()[0].code, "FUTURE_CODE");
    }

    #[test]
    fn unobserve_stops_delivery() {
        let mut sink = ErrorSink::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let id = sink.observe(Box::new(move |e| seen2.lock().unwrap().push(e)));
        assert!(sink.unobserve(id));
        sink.raise(Topic::Event, ErrorKind::NotSubscribed, "x");
        assert!(seen.lock().unwrap().is_empty());
    }
}
