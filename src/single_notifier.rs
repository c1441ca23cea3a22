//! Duplicate collapse for one-shot request/response exchanges
//! (record `has` and `snapshot`).
//!
//! The first request for a name sends the frame; concurrent requests for
//! the same name attach to the in-flight exchange. Every waiter carries its
//! own response deadline.

use crate::connection::Connection;
use crate::errors::{ErrorKind, ErrorSink};
use ds_protocol::{Action, Frame, Topic};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Failure of a one-shot request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("RESPONSE_TIMEOUT")]
    ResponseTimeout,
    #[error("{0}")]
    Remote(String),
    #[error("this client's connection was closed")]
    Closed,
}

struct Waiter<T> {
    deadline: Instant,
    tx: oneshot::Sender<Result<T, RequestError>>,
}

pub(crate) struct SingleNotifier<T> {
    topic: Topic,
    action: Action,
    timeout: Duration,
    requests: HashMap<String, Vec<Waiter<T>>>,
}

impl<T: Clone> SingleNotifier<T> {
    pub fn new(topic: Topic, action: Action, timeout: Duration) -> Self {
        SingleNotifier {
            topic,
            action,
            timeout,
            requests: HashMap::new(),
        }
    }

    pub fn has_request(&self, name: &str) -> bool {
        self.requests.contains_key(name)
    }

    /// Attach `tx` to the exchange for `name`, sending the request frame
    /// only when none is in flight.
    pub fn request(
        &mut self,
        conn: &mut Connection,
        name: &str,
        tx: oneshot::Sender<Result<T, RequestError>>,
        now: Instant,
    ) {
        if !self.requests.contains_key(name) {
            conn.send_frame(&Frame::new(self.topic, self.action, [name]));
        }
        self.requests
            .entry(name.to_owned())
            .or_default()
            .push(Waiter {
                deadline: now + self.timeout,
                tx,
            });
    }

    /// Resolve every waiter for `name`.
    pub fn receive(&mut self, name: &str, result: Result<T, RequestError>) {
        let Some(waiters) = self.requests.remove(name) else {
            return;
        };
        for waiter in waiters {
            let _ = waiter.tx.send(result.clone());
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.requests
            .values()
            .flat_map(|waiters| waiters.iter().map(|w| w.deadline))
            .min()
    }

    /// Time out individual waiters whose deadline has passed.
    pub fn expire(&mut self, now: Instant, errors: &mut ErrorSink) {
        let mut timed_out = Vec::new();
        for (name, waiters) in &mut self.requests {
            let mut kept = Vec::new();
            for waiter in waiters.drain(..) {
                if waiter.deadline <= now {
                    let _ = waiter.tx.send(Err(RequestError::ResponseTimeout));
                    timed_out.push(name.clone());
                } else {
                    kept.push(waiter);
                }
            }
            *waiters = kept;
        }
        self.requests.retain(|_, waiters| !waiters.is_empty());
        timed_out.sort();
        timed_out.dedup();
        for name in timed_out {
            errors.raise(
                self.topic,
                ErrorKind::ResponseTimeout,
                format!(
                    "No response received in time for {}|{}|{name}",
                    self.topic, self.action
                ),
            );
        }
    }

    /// Resolve every waiter with `Closed`; used on deliberate close.
    pub fn fail_all(&mut self) {
        for (_, waiters) in self.requests.drain() {
            for waiter in waiters {
                let _ = waiter.tx.send(Err(RequestError::Closed));
            }
        }
    }

    /// Replay outstanding request frames after a reconnect.
    pub fn resend(&mut self, conn: &mut Connection) {
        let mut names: Vec<&String> = self.requests.keys().collect();
        names.sort();
        for name in names {
            conn.send_frame(&Frame::new(self.topic, self.action, [name.as_str()]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ClientOptions;
    use std::sync::Arc;

    fn conn() -> Connection {
        Connection::new("ws://localhost:6020", Arc::new(ClientOptions::default())).0
    }

    fn outbound(conn: &mut Connection) -> usize {
        let mut n = 0;
        while conn.take_wire().is_some() {
            n += 1;
        }
        n
    }

    #[test]
    fn duplicate_requests_send_one_frame() {
        let mut conn = conn();
        let mut notifier: SingleNotifier<bool> =
            SingleNotifier::new(Topic::Record, Action::Has, Duration::from_secs(1));
        let now = Instant::now();

        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        notifier.request(&mut conn, "someRecord", tx1, now);
        notifier.request(&mut conn, "someRecord", tx2, now);
        // Frames are queued (connection not open), one per distinct name.
        assert!(notifier.has_request("someRecord"));

        notifier.receive("someRecord", Ok(true));
        assert_eq!(rx1.try_recv().unwrap(), Ok(true));
        assert_eq!(rx2.try_recv().unwrap(), Ok(true));
        assert!(!notifier.has_request("someRecord"));
        assert_eq!(outbound(&mut conn), 0);
    }

    #[test]
    fn expiry_resolves_waiters_and_raises() {
        let mut conn = conn();
        let mut notifier: SingleNotifier<bool> =
            SingleNotifier::new(Topic::Record, Action::Has, Duration::from_secs(1));
        let mut errors = ErrorSink::new();
        let now = Instant::now();

        let (tx, mut rx) = oneshot::channel();
        notifier.request(&mut conn, "gone", tx, now);
        notifier.expire(now + Duration::from_secs(2), &mut errors);
        assert_eq!(rx.try_recv().unwrap(), Err(RequestError::ResponseTimeout));
        assert!(!notifier.has_request("gone"));
    }

    #[test]
    fn resend_replays_outstanding_names() {
        let mut conn = conn();
        let mut notifier: SingleNotifier<bool> =
            SingleNotifier::new(Topic::Record, Action::Has, Duration::from_secs(1));
        let now = Instant::now();
        let (tx, _rx) = oneshot::channel();
        notifier.request(&mut conn, "someRecord", tx, now);
        let before = outbound(&mut conn);
        notifier.resend(&mut conn);
        // One original + one replayed frame, both queued.
        assert_eq!(before, 0);
        assert!(notifier.has_request("someRecord"));
    }
}
