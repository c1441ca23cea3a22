//! Pattern-listen machinery shared by records and events.
//!
//! A listener announces interest in a subscription pattern; the server
//! calls back when a matching subscription appears or disappears, and the
//! client may accept or reject providership for each match.

use crate::client::Command;
use crate::connection::Connection;
use ds_protocol::{Action, Frame, Topic};
use tokio::sync::mpsc::UnboundedSender;

/// A match notification delivered to a listen callback.
pub struct ListenEvent {
    /// The concrete subscription name that matched the pattern.
    pub name: String,
    /// True when the subscription appeared, false when it went away.
    pub is_subscribed: bool,
    /// Present for appearances; accept or reject providership.
    pub responder: Option<ListenResponder>,
}

/// Accept/reject handle for one pattern match.
pub struct ListenResponder {
    cmd: UnboundedSender<Command>,
    topic: Topic,
    pattern: String,
    name: String,
}

impl ListenResponder {
    pub fn accept(self) {
        let frame = Frame::new(
            self.topic,
            Action::ListenAccept,
            [self.pattern, self.name],
        );
        let _ = self.cmd.send(Command::SendFrame(frame));
    }

    pub fn reject(self) {
        let frame = Frame::new(
            self.topic,
            Action::ListenReject,
            [self.pattern, self.name],
        );
        let _ = self.cmd.send(Command::SendFrame(frame));
    }
}

pub(crate) type ListenCallback = dyn FnMut(ListenEvent) + Send;

pub(crate) struct Listener {
    topic: Topic,
    pattern: String,
    callback: Box<ListenCallback>,
    destroy_pending: bool,
}

impl Listener {
    pub fn new(topic: Topic, pattern: &str, callback: Box<ListenCallback>) -> Self {
        Listener {
            topic,
            pattern: pattern.to_owned(),
            callback,
            destroy_pending: false,
        }
    }

    pub fn destroy_pending(&self) -> bool {
        self.destroy_pending
    }

    pub fn send_listen(&self, conn: &mut Connection) {
        conn.send_frame(&Frame::new(self.topic, Action::Listen, [self.pattern.as_str()]));
    }

    /// Begin graceful teardown; the unlisten ack completes it.
    pub fn send_destroy(&mut self, conn: &mut Connection) {
        self.destroy_pending = true;
        conn.send_frame(&Frame::new(self.topic, Action::Unlisten, [self.pattern.as_str()]));
    }

    /// Handle a pattern-found / pattern-removed frame for this pattern.
    pub fn on_frame(&mut self, frame: &Frame, cmd: &UnboundedSender<Command>) {
        let Some(name) = frame.part(1) else {
            return;
        };
        match frame.action {
            Action::SubscriptionForPatternFound => {
                let responder = ListenResponder {
                    cmd: cmd.clone(),
                    topic: self.topic,
                    pattern: self.pattern.clone(),
                    name: name.to_owned(),
                };
                (self.callback)(ListenEvent {
                    name: name.to_owned(),
                    is_subscribed: true,
                    responder: Some(responder),
                });
            }
            Action::SubscriptionForPatternRemoved => {
                (self.callback)(ListenEvent {
                    name: name.to_owned(),
                    is_subscribed: false,
                    responder: None,
                });
            }
            _ => {}
        }
    }
}
