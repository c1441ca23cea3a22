//! Event topic handler: subscribe, emit and pattern listening.

use crate::ack_registry::AckTimeoutRegistry;
use crate::client::Command;
use crate::connection::Connection;
use crate::emitter::{Emitter, SubscriptionId};
use crate::errors::{ErrorKind, ErrorSink};
use crate::listener::{ListenCallback, Listener};
use ds_protocol::{Action, Frame, Topic, Typed, encode_typed, error_codes};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

pub(crate) type EventCallback = dyn FnMut(Value) + Send;

pub(crate) struct EventHandler {
    emitter: Emitter<EventCallback>,
    listeners: HashMap<String, Listener>,
    ack_registry: AckTimeoutRegistry,
    cmd: UnboundedSender<Command>,
}

impl EventHandler {
    pub fn new(subscription_timeout: std::time::Duration, cmd: UnboundedSender<Command>) -> Self {
        EventHandler {
            emitter: Emitter::new(),
            listeners: HashMap::new(),
            ack_registry: AckTimeoutRegistry::new(Topic::Event, subscription_timeout),
            cmd,
        }
    }

    /// Register a callback; the first local subscriber for a name sends
    /// the wire subscription.
    pub fn subscribe(
        &mut self,
        conn: &mut Connection,
        name: &str,
        callback: Box<EventCallback>,
        now: Instant,
    ) -> SubscriptionId {
        if !self.emitter.has(name) {
            self.ack_registry.add(name, Action::Subscribe, now);
            conn.send_frame(&Frame::new(Topic::Event, Action::Subscribe, [name]));
        }
        self.emitter.on(name, callback)
    }

    /// Remove a callback; the last local unsubscriber sends the wire
    /// unsubscription.
    pub fn unsubscribe(
        &mut self,
        conn: &mut Connection,
        name: &str,
        id: SubscriptionId,
        now: Instant,
    ) {
        self.emitter.off(name, id);
        if !self.emitter.has(name) {
            self.ack_registry.add(name, Action::Unsubscribe, now);
            conn.send_frame(&Frame::new(Topic::Event, Action::Unsubscribe, [name]));
        }
    }

    /// Publish an event; local subscribers are invoked synchronously.
    pub fn emit(&mut self, conn: &mut Connection, name: &str, data: &Value) {
        conn.send_frame(&Frame::new(
            Topic::Event,
            Action::Event,
            [name, encode_typed(data).as_str()],
        ));
        self.emitter.dispatch(name, |cb| cb(data.clone()));
    }

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
                errors.raise(Topic::Event, ErrorKind::ListenerExists, pattern);
                return;
            }
            self.listeners.remove(pattern);
        }
        let listener = Listener::new(Topic::Event, pattern, callback);
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
                errors.raise(Topic::Event, ErrorKind::NotListening, pattern);
            }
            Some(listener) if !listener.destroy_pending() => {
                self.ack_registry.add(pattern, Action::Unlisten, now);
                listener.send_destroy(conn);
            }
            Some(_) => {
                // Teardown already in flight; drop it without waiting.
                self.listeners.remove(pattern);
            }
        }
    }

    pub fn handle(&mut self, _conn: &mut Connection, errors: &mut ErrorSink, frame: &Frame) {
        match frame.action {
            Action::Event => {
                let Some(name) = frame.part(0) else {
                    return;
                };
                let value = match frame.part(1).map(Typed::parse) {
                    Some(Ok(typed)) => typed.into_value(),
                    Some(Err(e)) => {
                        errors.raise(Topic::Event, ErrorKind::MessageParseError, e.to_string());
                        return;
                    }
                    None => Value::Null,
                };
                self.emitter.dispatch(name, |cb| cb(value.clone()));
            }
            Action::Ack => {
                if frame.part(0) == Some(Action::Unlisten.code()) {
                    if let Some(pattern) = frame.part(1) {
                        if self
                            .listeners
                            .get(pattern)
                            .is_some_and(Listener::destroy_pending)
                        {
                            self.listeners.remove(pattern);
                        }
                    }
                }
                self.ack_registry.clear(frame);
            }
            Action::SubscriptionForPatternFound | Action::SubscriptionForPatternRemoved => {
                if let Some(listener) = frame.part(0).and_then(|p| self.listeners.get_mut(p)) {
                    listener.on_frame(frame, &self.cmd);
                }
            }
            Action::SubscriptionHasProvider => {}
            Action::Error => {
                let code = frame.part(0).unwrap_or_default().to_owned();
                let name = frame.part(1).unwrap_or_default().to_owned();
                if code == error_codes::MESSAGE_DENIED {
                    if let Some(action) = frame.part(2).and_then(Action::from_code) {
                        self.ack_registry.remove(&name, action);
                    }
                } else if code == error_codes::NOT_SUBSCRIBED {
                    self.ack_registry.remove(&name, Action::Unsubscribe);
                }
                errors.raise_code(Topic::Event, &code, name);
            }
            _ => {
                let name = frame.part(0).unwrap_or_default();
                errors.raise(Topic::Event, ErrorKind::UnsolicitedMessage, name);
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.ack_registry.next_deadline()
    }

    pub fn expire(&mut self, now: Instant, errors: &mut ErrorSink) {
        self.ack_registry.expire(now, errors);
    }

    /// Replay subscriptions and listens after a reconnect.
    pub fn resubscribe(&mut self, conn: &mut Connection) {
        let mut names: Vec<String> = self.emitter.subjects().map(str::to_owned).collect();
        names.sort();
        for name in names {
            conn.send_frame(&Frame::new(Topic::Event, Action::Subscribe, [name.as_str()]));
        }
        let mut patterns: Vec<&String> = self
            .listeners
            .iter()
            .filter(|(_, l)| !l.destroy_pending())
            .map(|(p, _)| p)
            .collect();
        patterns.sort();
        for pattern in patterns {
            conn.send_frame(&Frame::new(Topic::Event, Action::Listen, [pattern.as_str()]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ClientOptions;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    fn wire(s: &str) -> String {
        s.replace('|', "\u{1f}").replace('+', "\u{1e}")
    }

    fn frame(raw: &str) -> Frame {
        ds_protocol::parse_frame(&raw.replace('|', "\u{1f}")).unwrap()
    }

    struct Fixture {
        conn: Connection,
        errors: ErrorSink,
        handler: EventHandler,
        error_log: Arc<Mutex<Vec<String>>>,
    }

    fn fixture() -> Fixture {
        let (mut conn, _rx) =
            Connection::new("ws://localhost:6020", Arc::new(ClientOptions::default()));
        conn.force_open();
        let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel();
        let mut errors = ErrorSink::new();
        let error_log = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&error_log);
        errors.observe(Box::new(move |e| log.lock().unwrap().push(e.code)));
        Fixture {
            conn,
            errors,
            handler: EventHandler::new(std::time::Duration::from_secs(2), cmd_tx),
            error_log,
        }
    }

    fn sent(conn: &mut Connection) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(text) = conn.take_wire() {
            out.push(text);
        }
        out
    }

    #[test]
    fn first_subscriber_sends_the_subscription() {
        let mut fx = fixture();
        let now = Instant::now();
        fx.handler
            .subscribe(&mut fx.conn, "news", Box::new(|_| {}), now);
        fx.handler
            .subscribe(&mut fx.conn, "news", Box::new(|_| {}), now);
        assert_eq!(sent(&mut fx.conn), vec![wire("E|S|news+")]);
    }

    #[test]
    fn last_unsubscriber_sends_the_unsubscription() {
        let mut fx = fixture();
        let now = Instant::now();
        let first = fx
            .handler
            .subscribe(&mut fx.conn, "news", Box::new(|_| {}), now);
        let second = fx
            .handler
            .subscribe(&mut fx.conn, "news", Box::new(|_| {}), now);
        sent(&mut fx.conn);

        fx.handler.unsubscribe(&mut fx.conn, "news", first, now);
        assert!(sent(&mut fx.conn).is_empty());
        fx.handler.unsubscribe(&mut fx.conn, "news", second, now);
        assert_eq!(sent(&mut fx.conn), vec![wire("E|US|news+")]);
    }

    #[test]
    fn emit_sends_typed_data_and_dispatches_locally() {
        let mut fx = fixture();
        let now = Instant::now();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        fx.handler.subscribe(
            &mut fx.conn,
            "news",
            Box::new(move |v| seen2.lock().unwrap().push(v)),
            now,
        );
        sent(&mut fx.conn);

        fx.handler.emit(&mut fx.conn, "news", &json!("hello"));
        assert_eq!(sent(&mut fx.conn), vec![wire("E|EVT|news|Shello+")]);
        assert_eq!(*seen.lock().unwrap(), vec![json!("hello")]);
    }

    #[test]
    fn inbound_events_dispatch_decoded_payloads() {
        let mut fx = fixture();
        let now = Instant::now();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        fx.handler.subscribe(
            &mut fx.conn,
            "scores",
            Box::new(move |v| seen2.lock().unwrap().push(v)),
            now,
        );
        fx.handler
            .handle(&mut fx.conn, &mut fx.errors, &frame("E|EVT|scores|N23"));
        fx.handler
            .handle(&mut fx.conn, &mut fx.errors, &frame("E|EVT|scores"));
        assert_eq!(*seen.lock().unwrap(), vec![json!(23), Value::Null]);
    }

    #[test]
    fn ack_clears_the_timeout_entry() {
        let mut fx = fixture();
        let now = Instant::now();
        fx.handler
            .subscribe(&mut fx.conn, "news", Box::new(|_| {}), now);
        fx.handler
            .handle(&mut fx.conn, &mut fx.errors, &frame("E|A|S|news"));
        fx.handler
            .expire(now + std::time::Duration::from_secs(10), &mut fx.errors);
        assert!(fx.error_log.lock().unwrap().is_empty());
    }

    #[test]
    fn missing_ack_times_out() {
        let mut fx = fixture();
        let now = Instant::now();
        fx.handler
            .subscribe(&mut fx.conn, "news", Box::new(|_| {}), now);
        fx.handler
            .expire(now + std::time::Duration::from_secs(2), &mut fx.errors);
        assert_eq!(*fx.error_log.lock().unwrap(), vec!["ACK_TIMEOUT"]);
    }

    #[test]
    fn duplicate_listen_raises_listener_exists() {
        let mut fx = fixture();
        let now = Instant::now();
        fx.handler
            .listen(&mut fx.conn, &mut fx.errors, "news/*", Box::new(|_| {}), now);
        fx.handler
            .listen(&mut fx.conn, &mut fx.errors, "news/*", Box::new(|_| {}), now);
        assert_eq!(*fx.error_log.lock().unwrap(), vec!["LISTENER_EXISTS"]);
    }

    #[test]
    fn unlisten_completes_on_ack() {
        let mut fx = fixture();
        let now = Instant::now();
        fx.handler
            .listen(&mut fx.conn, &mut fx.errors, "news/*", Box::new(|_| {}), now);
        fx.handler
            .handle(&mut fx.conn, &mut fx.errors, &frame("E|A|L|news/*"));
        sent(&mut fx.conn);

        fx.handler.unlisten(&mut fx.conn, &mut fx.errors, "news/*", now);
        assert_eq!(sent(&mut fx.conn), vec![wire("E|UL|news/*+")]);
        fx.handler
            .handle(&mut fx.conn, &mut fx.errors, &frame("E|A|UL|news/*"));
        assert!(fx.handler.listeners.is_empty());
    }

    #[test]
    fn unlisten_of_unknown_pattern_raises() {
        let mut fx = fixture();
        let now = Instant::now();
        fx.handler
            .unlisten(&mut fx.conn, &mut fx.errors, "ghost/*", now);
        assert_eq!(*fx.error_log.lock().unwrap(), vec!["NOT_LISTENING"]);
    }

    #[test]
    fn message_denied_removes_the_pending_entry_and_surfaces() {
        let mut fx = fixture();
        let now = Instant::now();
        fx.handler
            .subscribe(&mut fx.conn, "secret", Box::new(|_| {}), now);
        fx.handler.handle(
            &mut fx.conn,
            &mut fx.errors,
            &frame("E|E|MESSAGE_DENIED|secret|S"),
        );
        fx.handler
            .expire(now + std::time::Duration::from_secs(10), &mut fx.errors);
        assert_eq!(*fx.error_log.lock().unwrap(), vec!["MESSAGE_DENIED"]);
    }

    #[test]
    fn resubscribe_replays_subscriptions_and_listens() {
        let mut fx = fixture();
        let now = Instant::now();
        fx.handler
            .subscribe(&mut fx.conn, "news", Box::new(|_| {}), now);
        fx.handler
            .listen(&mut fx.conn, &mut fx.errors, "news/*", Box::new(|_| {}), now);
        sent(&mut fx.conn);

        fx.handler.resubscribe(&mut fx.conn);
        assert_eq!(
            sent(&mut fx.conn),
            vec![wire("E|S|news+"), wire("E|L|news/*+")]
        );
    }
}
