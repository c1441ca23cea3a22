//! Presence topic handler: who-is-online queries and notifications.

use crate::ack_registry::AckTimeoutRegistry;
use crate::connection::Connection;
use crate::emitter::{Emitter, SubscriptionId};
use crate::errors::{ErrorKind, ErrorSink};
use crate::single_notifier::RequestError;
use ds_protocol::{Action, Frame, Topic, error_codes};
use tokio::sync::oneshot;
use tokio::time::Instant;

pub(crate) type PresenceCallback = dyn FnMut(String, bool) + Send;

/// Subject for callbacks interested in every user.
const ALL_USERS: &str = "__all__";

pub(crate) struct PresenceHandler {
    emitter: Emitter<PresenceCallback>,
    query_waiters: Vec<oneshot::Sender<Result<Vec<String>, RequestError>>>,
    ack_registry: AckTimeoutRegistry,
}

impl PresenceHandler {
    pub fn new(subscription_timeout: std::time::Duration) -> Self {
        PresenceHandler {
            emitter: Emitter::new(),
            query_waiters: Vec::new(),
            ack_registry: AckTimeoutRegistry::new(Topic::Presence, subscription_timeout),
        }
    }

    /// Query every user currently online.
    pub fn get_all(
        &mut self,
        conn: &mut Connection,
        tx: oneshot::Sender<Result<Vec<String>, RequestError>>,
    ) {
        if self.query_waiters.is_empty() {
            conn.send_frame(&Frame::new(
                Topic::Presence,
                Action::Query,
                [Action::Query.code()],
            ));
        }
        self.query_waiters.push(tx);
    }

    /// Query specific users.
    pub fn get(
        &mut self,
        conn: &mut Connection,
        users: &[String],
        tx: oneshot::Sender<Result<Vec<String>, RequestError>>,
    ) {
        conn.send_frame(&Frame::new(Topic::Presence, Action::Query, [users.join(",")]));
        self.query_waiters.push(tx);
    }

    /// Subscribe to every user's joins and leaves.
    pub fn subscribe(
        &mut self,
        conn: &mut Connection,
        callback: Box<PresenceCallback>,
        now: Instant,
    ) -> SubscriptionId {
        if !self.emitter.has(ALL_USERS) {
            self.ack_registry
                .add(Action::Subscribe.code(), Action::Subscribe, now);
            conn.send_frame(&Frame::new(
                Topic::Presence,
                Action::Subscribe,
                [Action::Subscribe.code()],
            ));
        }
        self.emitter.on(ALL_USERS, callback)
    }

    /// Subscribe to one user's joins and leaves.
    pub fn subscribe_user(
        &mut self,
        conn: &mut Connection,
        user: &str,
        callback: Box<PresenceCallback>,
        now: Instant,
    ) -> SubscriptionId {
        if !self.emitter.has(user) {
            self.ack_registry.add(user, Action::Subscribe, now);
            conn.send_frame(&Frame::new(Topic::Presence, Action::Subscribe, [user]));
        }
        self.emitter.on(user, callback)
    }

    pub fn unsubscribe(&mut self, conn: &mut Connection, id: SubscriptionId, now: Instant) {
        self.emitter.off(ALL_USERS, id);
        if !self.emitter.has(ALL_USERS) {
            self.ack_registry
                .add(Action::Unsubscribe.code(), Action::Unsubscribe, now);
            conn.send_frame(&Frame::new(
                Topic::Presence,
                Action::Unsubscribe,
                [Action::Unsubscribe.code()],
            ));
        }
    }

    pub fn unsubscribe_user(
        &mut self,
        conn: &mut Connection,
        user: &str,
        id: SubscriptionId,
        now: Instant,
    ) {
        self.emitter.off(user, id);
        if !self.emitter.has(user) {
            self.ack_registry.add(user, Action::Unsubscribe, now);
            conn.send_frame(&Frame::new(Topic::Presence, Action::Unsubscribe, [user]));
        }
    }

    pub fn handle(&mut self, _conn: &mut Connection, errors: &mut ErrorSink, frame: &Frame) {
        match frame.action {
            Action::Error => {
                let code = frame.part(0).unwrap_or_default().to_owned();
                let name = frame.part(1).unwrap_or_default().to_owned();
                if code == error_codes::MESSAGE_DENIED {
                    let action = frame
                        .part(2)
                        .and_then(Action::from_code)
                        .unwrap_or(Action::Subscribe);
                    self.ack_registry.remove(&name, action);
                }
                errors.raise_code(Topic::Presence, &code, name);
            }
            Action::Ack => self.ack_registry.clear(frame),
            Action::PresenceJoin => self.dispatch_presence(frame, true),
            Action::PresenceLeave => self.dispatch_presence(frame, false),
            Action::Query => {
                let users = Self::parse_query(frame, errors);
                for tx in self.query_waiters.drain(..) {
                    let _ = tx.send(Ok(users.clone()));
                }
            }
            other => {
                errors.raise(
                    Topic::Presence,
                    ErrorKind::UnsolicitedMessage,
                    other.code(),
                );
            }
        }
    }

    fn dispatch_presence(&mut self, frame: &Frame, online: bool) {
        let Some(user) = frame.part(0) else {
            return;
        };
        let user = user.to_owned();
        let subject = user.clone();
        self.emitter
            .dispatch(ALL_USERS, |cb| cb(user.clone(), online));
        self.emitter.dispatch(&subject, |cb| cb(user.clone(), online));
    }

    /// Query payloads arrive either as a digit marker followed by a JSON
    /// list, or as the raw split user names.
    fn parse_query(frame: &Frame, errors: &mut ErrorSink) -> Vec<String> {
        let digit_marker = frame
            .part(0)
            .is_some_and(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));
        if digit_marker {
            if let Some(raw) = frame.part(1) {
                match serde_json::from_str::<Vec<String>>(raw) {
                    Ok(users) => return users,
                    Err(e) => {
                        errors.raise(
                            Topic::Presence,
                            ErrorKind::MessageParseError,
                            e.to_string(),
                        );
                        return Vec::new();
                    }
                }
            }
        }
        frame
            .data
            .iter()
            .filter(|part| !part.is_empty())
            .cloned()
            .collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.ack_registry.next_deadline()
    }

    pub fn expire(&mut self, now: Instant, errors: &mut ErrorSink) {
        self.ack_registry.expire(now, errors);
    }

    /// Replay presence subscriptions after a reconnect.
    pub fn resubscribe(&mut self, conn: &mut Connection) {
        let mut subjects: Vec<String> = self.emitter.subjects().map(str::to_owned).collect();
        subjects.sort();
        for subject in subjects {
            let payload = if subject == ALL_USERS {
                Action::Subscribe.code().to_owned()
            } else {
                subject
            };
            conn.send_frame(&Frame::new(
                Topic::Presence,
                Action::Subscribe,
                [payload.as_str()],
            ));
        }
    }

    /// Resolve pending queries; used on deliberate close.
    pub fn fail_pending(&mut self) {
        for tx in self.query_waiters.drain(..) {
            let _ = tx.send(Err(RequestError::Closed));
        }
    }
}
