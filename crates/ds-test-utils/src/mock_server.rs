// mock_server: scriptable deepstream server endpoint.
//
// Protocol behavior (per connection):
// - On accept, send `C|CH`; reply `C|A` to the challenge response.
// - `A|REQ|...` answers according to the configured AuthBehavior.
// - `C|PO` is swallowed; `C|PI` is never sent unprompted (tests inject it).
// - Subscribe/unsubscribe/listen frames are acked when auto-ack is on.
// - `R|CR` answers `R|A|S|<name>` plus `R|R|<name>|<v>|<body>` from the
//   record store; updates/patches advance the stored version.
// - Scripted rules (topic, action, optional first data part) take
//   precedence over all defaults.

use ds_protocol::{Action, FRAME_SEPARATOR, Frame, Topic, parse_frame};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;

/// How the server answers auth requests.
#[derive(Debug, Clone)]
pub enum AuthBehavior {
    /// `A|A`, optionally with a typed payload.
    Accept { data: Option<String> },
    /// `A|E|<code>|<typed-message>`.
    Reject { code: String, message: String },
    /// No response at all.
    Silent,
}

impl Default for AuthBehavior {
    fn default() -> Self {
        AuthBehavior::Accept { data: None }
    }
}

/// A scripted response: when an inbound frame matches, the responses are
/// sent verbatim.
#[derive(Debug, Clone)]
pub struct Rule {
    pub topic: Topic,
    pub action: Action,
    /// Match on the first data part when set.
    pub name: Option<String>,
    pub responses: Vec<Frame>,
}

#[derive(Default)]
struct Config {
    auth: AuthBehavior,
    auto_ack: bool,
    records: HashMap<String, (u64, String)>,
    presence_users: Vec<String>,
    rules: Vec<Rule>,
}

enum ConnMsg {
    Frame(String),
    Close,
}

struct Shared {
    config: Mutex<Config>,
    received: Mutex<Vec<Frame>>,
    conns: Mutex<Vec<mpsc::UnboundedSender<ConnMsg>>>,
    connection_count: AtomicUsize,
}

/// A mock deepstream server bound to a random local port.
///
/// Each test spins up its own isolated instance; the accept loop runs in
/// a background task until the server is dropped.
pub struct MockServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl Drop for MockServer {
    /// Stop accepting, free the port and close every live connection.
    fn drop(&mut self) {
        self.accept_task.abort();
        self.drop_connections();
    }
}

impl MockServer {
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            config: Mutex::new(Config {
                auto_ack: true,
                ..Config::default()
            }),
            received: Mutex::new(Vec::new()),
            conns: Mutex::new(Vec::new()),
            connection_count: AtomicUsize::new(0),
        });

        let accept_shared = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let shared = Arc::clone(&accept_shared);
                        tokio::spawn(async move {
                            let _ = handle_connection(stream, shared).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(MockServer {
            addr,
            shared,
            accept_task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    // -- configuration --

    pub fn set_auth(&self, auth: AuthBehavior) {
        self.shared.config.lock().unwrap().auth = auth;
    }

    pub fn set_auto_ack(&self, auto_ack: bool) {
        self.shared.config.lock().unwrap().auto_ack = auto_ack;
    }

    /// Seed the record store: `R|CR|<name>` answers with this version and
    /// JSON body.
    pub fn set_record(&self, name: &str, version: u64, body: &str) {
        self.shared
            .config
            .lock()
            .unwrap()
            .records
            .insert(name.to_owned(), (version, body.to_owned()));
    }

    pub fn set_presence_users(&self, users: &[&str]) {
        self.shared.config.lock().unwrap().presence_users =
            users.iter().map(|u| (*u).to_owned()).collect();
    }

    pub fn add_rule(&self, rule: Rule) {
        self.shared.config.lock().unwrap().rules.push(rule);
    }

    // -- observation & control --

    /// Every frame received so far, across all connections.
    pub fn received(&self) -> Vec<Frame> {
        self.shared.received.lock().unwrap().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connection_count.load(Ordering::SeqCst)
    }

    /// Push a frame to every live connection.
    pub fn send_frame(&self, frame: &Frame) {
        let conns = self.shared.conns.lock().unwrap();
        for conn in conns.iter() {
            let _ = conn.send(ConnMsg::Frame(frame.encode()));
        }
    }

    /// Close every live connection (client-side reconnect kicks in).
    pub fn drop_connections(&self) {
        let mut conns = self.shared.conns.lock().unwrap();
        for conn in conns.drain(..) {
            let _ = conn.send(ConnMsg::Close);
        }
    }

    /// Wait until a frame matching `(topic, action, name)` has been
    /// received, polling the capture buffer.
    pub async fn wait_for(
        &self,
        topic: Topic,
        action: Action,
        name: Option<&str>,
    ) -> Option<Frame> {
        for _ in 0..500 {
            let hit = self
                .received()
                .into_iter()
                .find(|f| {
                    f.topic == topic
                        && f.action == action
                        && name.is_none_or(|n| f.part(0) == Some(n))
                });
            if hit.is_some() {
                return hit;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        None
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    shared: Arc<Shared>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws.split();
    shared.connection_count.fetch_add(1, Ordering::SeqCst);

    let (tx, mut rx) = mpsc::unbounded_channel();
    shared.conns.lock().unwrap().push(tx);

    // Open with the connection challenge.
    let challenge = Frame::new(Topic::Connection, Action::Challenge, Vec::<String>::new());
    write.send(Message::Text(challenge.encode().into())).await?;

    loop {
        tokio::select! {
            pushed = rx.recv() => match pushed {
                Some(ConnMsg::Frame(text)) => {
                    write.send(Message::Text(text.into())).await?;
                }
                Some(ConnMsg::Close) | None => {
                    let _ = write.close().await;
                    break;
                }
            },
            msg = read.next() => {
                let msg = match msg {
                    None => break,
                    Some(Err(_)) => break,
                    Some(Ok(m)) => m,
                };
                let text = match msg {
                    Message::Text(t) => t,
                    Message::Close(_) => break,
                    Message::Ping(data) => {
                        write.send(Message::Pong(data)).await?;
                        continue;
                    }
                    _ => continue,
                };
                for raw in text.split(FRAME_SEPARATOR).filter(|r| !r.is_empty()) {
                    let Ok(frame) = parse_frame(raw) else { continue };
                    shared.received.lock().unwrap().push(frame.clone());
                    for response in respond(&shared, &frame) {
                        write.send(Message::Text(response.encode().into())).await?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Compute the scripted or default responses for one inbound frame.
fn respond(shared: &Shared, frame: &Frame) -> Vec<Frame> {
    let mut config = shared.config.lock().unwrap();

    // Scripted rules first. Response parts may reference inbound data
    // parts as `${0}`, `${1}`, ... (e.g. to echo a correlation id).
    let scripted: Vec<Frame> = config
        .rules
        .iter()
        .filter(|rule| {
            rule.topic == frame.topic
                && rule.action == frame.action
                && rule.name.as_deref().is_none_or(|n| frame.part(0) == Some(n))
        })
        .flat_map(|rule| rule.responses.iter().map(|r| substitute(r, frame)))
        .collect();
    if !scripted.is_empty() {
        return scripted;
    }

    match (frame.topic, frame.action) {
        (Topic::Connection, Action::ChallengeResponse) => {
            vec![Frame::new(Topic::Connection, Action::Ack, Vec::<String>::new())]
        }
        (Topic::Auth, Action::Request) => match &config.auth {
            AuthBehavior::Accept { data } => {
                let data: Vec<String> = data.iter().cloned().collect();
                vec![Frame::new(Topic::Auth, Action::Ack, data)]
            }
            AuthBehavior::Reject { code, message } => {
                vec![Frame::new(
                    Topic::Auth,
                    Action::Error,
                    [code.clone(), format!("S{message}")],
                )]
            }
            AuthBehavior::Silent => vec![],
        },
        (Topic::Record, Action::CreateOrRead) => {
            let name = frame.part(0).unwrap_or_default().to_owned();
            let (version, body) = config
                .records
                .entry(name.clone())
                .or_insert((0, "{}".to_owned()))
                .clone();
            vec![
                Frame::new(
                    Topic::Record,
                    Action::Ack,
                    [Action::Subscribe.code(), name.as_str()],
                ),
                Frame::new(
                    Topic::Record,
                    Action::Read,
                    [name, version.to_string(), body],
                ),
            ]
        }
        (Topic::Record, Action::Snapshot) => {
            let name = frame.part(0).unwrap_or_default().to_owned();
            let (version, body) = config
                .records
                .get(&name)
                .cloned()
                .unwrap_or((0, "{}".to_owned()));
            vec![Frame::new(
                Topic::Record,
                Action::Read,
                [name, version.to_string(), body],
            )]
        }
        (Topic::Record, Action::Update) => {
            let name = frame.part(0).unwrap_or_default().to_owned();
            let version = frame
                .part(1)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            let body = frame.part(2).unwrap_or("{}").to_owned();
            config.records.insert(name.clone(), (version, body));
            if frame.part(3).is_some_and(|c| c.contains("writeSuccess")) {
                vec![Frame::new(
                    Topic::Record,
                    Action::WriteAcknowledgement,
                    [name, format!("[{version}]"), "L".to_owned()],
                )]
            } else {
                vec![]
            }
        }
        (Topic::Record, Action::Patch) => {
            let name = frame.part(0).unwrap_or_default().to_owned();
            let version = frame
                .part(1)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            if let Some(entry) = config.records.get_mut(&name) {
                entry.0 = version;
            }
            if frame.part(4).is_some_and(|c| c.contains("writeSuccess")) {
                vec![Frame::new(
                    Topic::Record,
                    Action::WriteAcknowledgement,
                    [name, format!("[{version}]"), "L".to_owned()],
                )]
            } else {
                vec![]
            }
        }
        (Topic::Record, Action::Has) => {
            let name = frame.part(0).unwrap_or_default().to_owned();
            let exists = config.records.contains_key(&name);
            vec![Frame::new(
                Topic::Record,
                Action::Has,
                [name, (if exists { "T" } else { "F" }).to_owned()],
            )]
        }
        (Topic::Presence, Action::Query) => {
            let users = config.presence_users.clone();
            vec![Frame::new(Topic::Presence, Action::Query, users)]
        }
        (topic, action) if config.auto_ack => ack_for(topic, action, frame),
        _ => vec![],
    }
}

fn substitute(response: &Frame, inbound: &Frame) -> Frame {
    let data = response
        .data
        .iter()
        .map(|part| {
            let mut out = part.clone();
            for (i, value) in inbound.data.iter().enumerate() {
                out = out.replace(&format!("${{{i}}}"), value);
            }
            out
        })
        .collect();
    Frame {
        topic: response.topic,
        action: response.action,
        data,
    }
}

/// Default acks for subscribe-like frames.
fn ack_for(topic: Topic, action: Action, frame: &Frame) -> Vec<Frame> {
    let ackable = matches!(
        action,
        Action::Subscribe
            | Action::Unsubscribe
            | Action::Listen
            | Action::Unlisten
            | Action::Delete
    );
    if !ackable {
        return vec![];
    }
    let name = frame.part(0).unwrap_or_default();
    vec![Frame::new(topic, Action::Ack, [action.code(), name])]
}
