//! Per-(name, action) ack deadlines.
//!
//! Handlers arm an entry when they send a frame the server must ack and
//! clear it from the inbound ack. Expired entries raise `ACK_TIMEOUT`
//! through the owning topic's error path.

use crate::errors::{ErrorKind, ErrorSink};
use ds_protocol::{Action, Frame, Topic};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

pub(crate) struct AckTimeoutRegistry {
    topic: Topic,
    timeout: Duration,
    entries: HashMap<(String, Action), Instant>,
}

impl AckTimeoutRegistry {
    pub fn new(topic: Topic, timeout: Duration) -> Self {
        AckTimeoutRegistry {
            topic,
            timeout,
            entries: HashMap::new(),
        }
    }

    pub fn add(&mut self, name: &str, action: Action, now: Instant) {
        self.entries
            .insert((name.to_owned(), action), now + self.timeout);
    }

    /// Cancel from an inbound ack frame: `<topic>|A|<action>|<name>`.
    pub fn clear(&mut self, frame: &Frame) {
        let action = frame.part(0).and_then(Action::from_code);
        let name = frame.part(1);
        if let (Some(action), Some(name)) = (action, name) {
            self.entries.remove(&(name.to_owned(), action));
        }
    }

    /// Cancel without firing.
    pub fn remove(&mut self, name: &str, action: Action) {
        self.entries.remove(&(name.to_owned(), action));
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().min().copied()
    }

    /// Fire every expired entry.
    pub fn expire(&mut self, now: Instant, errors: &mut ErrorSink) {
        let mut expired: Vec<(String, Action)> = self
            .entries
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        expired.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.code().cmp(b.1.code())));
        for key in expired {
            self.entries.remove(&key);
            errors.raise(
                self.topic,
                ErrorKind::AckTimeout,
                format!("No ACK message received in time for {}", key.0),
            );
        }
    }
}
