// ds-protocol: deepstream wire protocol -- topic/action codes, separator
// framing and typed-value coding.
//
// A frame on the wire is `TOPIC <US> ACTION <US> [DATA <US> ...] <RS>`
// where US is 0x1F (unit separator) and RS is 0x1E (record separator).
// Topic and action codes are frozen one-to-three letter strings.

use serde_json::Value;

/// Field separator between frame parts (unit separator).
pub const PART_SEPARATOR: char = '\u{001f}';

/// Frame terminator (record separator).
pub const FRAME_SEPARATOR: char = '\u{001e}';

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// The major addressing dimension of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Connection,
    Auth,
    Event,
    Record,
    Rpc,
    Presence,
    Error,
}

impl Topic {
    pub fn code(self) -> &'static str {
        match self {
            Topic::Connection => "C",
            Topic::Auth => "A",
            Topic::Event => "E",
            Topic::Record => "R",
            Topic::Rpc => "P",
            Topic::Presence => "U",
            Topic::Error => "X",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "C" => Topic::Connection,
            "A" => Topic::Auth,
            "E" => Topic::Event,
            "R" => Topic::Record,
            "P" => Topic::Rpc,
            "U" => Topic::Presence,
            "X" => Topic::Error,
            _ => return None,
        })
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// The verb within a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Ack,
    Error,
    Ping,
    Pong,
    Challenge,
    ChallengeResponse,
    Redirect,
    Rejection,
    Read,
    Create,
    Update,
    Patch,
    Delete,
    Subscribe,
    Unsubscribe,
    Has,
    Snapshot,
    CreateOrRead,
    Query,
    Listen,
    Unlisten,
    ListenAccept,
    ListenReject,
    SubscriptionForPatternFound,
    SubscriptionForPatternRemoved,
    SubscriptionHasProvider,
    Request,
    Response,
    Event,
    PresenceJoin,
    PresenceLeave,
    WriteAcknowledgement,
}

impl Action {
    pub fn code(self) -> &'static str {
        match self {
            Action::Ack => "A",
            Action::Error => "E",
            Action::Ping => "PI",
            Action::Pong => "PO",
            Action::Challenge => "CH",
            Action::ChallengeResponse => "CHR",
            Action::Redirect => "RED",
            Action::Rejection => "REJ",
            Action::Read => "R",
            Action::Create => "C",
            Action::Update => "U",
            Action::Patch => "P",
            Action::Delete => "D",
            Action::Subscribe => "S",
            Action::Unsubscribe => "US",
            Action::Has => "H",
            Action::Snapshot => "SN",
            Action::CreateOrRead => "CR",
            Action::Query => "Q",
            Action::Listen => "L",
            Action::Unlisten => "UL",
            Action::ListenAccept => "LA",
            Action::ListenReject => "LR",
            Action::SubscriptionForPatternFound => "SP",
            Action::SubscriptionForPatternRemoved => "SR",
            Action::SubscriptionHasProvider => "SH",
            Action::Request => "REQ",
            Action::Response => "RES",
            Action::Event => "EVT",
            Action::PresenceJoin => "PNJ",
            Action::PresenceLeave => "PNL",
            Action::WriteAcknowledgement => "WA",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "A" => Action::Ack,
            "E" => Action::Error,
            "PI" => Action::Ping,
            "PO" => Action::Pong,
            "CH" => Action::Challenge,
            "CHR" => Action::ChallengeResponse,
            "RED" => Action::Redirect,
            "REJ" => Action::Rejection,
            "R" => Action::Read,
            "C" => Action::Create,
            "U" => Action::Update,
            "P" => Action::Patch,
            "D" => Action::Delete,
            "S" => Action::Subscribe,
            "US" => Action::Unsubscribe,
            "H" => Action::Has,
            "SN" => Action::Snapshot,
            "CR" => Action::CreateOrRead,
            "Q" => Action::Query,
            "L" => Action::Listen,
            "UL" => Action::Unlisten,
            "LA" => Action::ListenAccept,
            "LR" => Action::ListenReject,
            "SP" => Action::SubscriptionForPatternFound,
            "SR" => Action::SubscriptionForPatternRemoved,
            "SH" => Action::SubscriptionHasProvider,
            "REQ" => Action::Request,
            "RES" => Action::Response,
            "EVT" => Action::Event,
            "PNJ" => Action::PresenceJoin,
            "PNL" => Action::PresenceLeave,
            "WA" => Action::WriteAcknowledgement,
            _ => return None,
        })
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

// ---------------------------------------------------------------------------
// Wire error codes
// ---------------------------------------------------------------------------

/// Frozen error/event codes carried in error frames and surfaced to users.
pub mod error_codes {
    pub const CONNECTION_ERROR: &str = "CONNECTION_ERROR";
    pub const CONNECTION_AUTHENTICATION_TIMEOUT: &str = "CONNECTION_AUTHENTICATION_TIMEOUT";
    pub const TOO_MANY_AUTH_ATTEMPTS: &str = "TOO_MANY_AUTH_ATTEMPTS";
    pub const IS_CLOSED: &str = "IS_CLOSED";
    pub const ACK_TIMEOUT: &str = "ACK_TIMEOUT";
    pub const RESPONSE_TIMEOUT: &str = "RESPONSE_TIMEOUT";
    pub const DELETE_TIMEOUT: &str = "DELETE_TIMEOUT";
    pub const MESSAGE_DENIED: &str = "MESSAGE_DENIED";
    pub const MESSAGE_PARSE_ERROR: &str = "MESSAGE_PARSE_ERROR";
    pub const MESSAGE_PERMISSION_ERROR: &str = "MESSAGE_PERMISSION_ERROR";
    pub const NOT_AUTHENTICATED: &str = "NOT_AUTHENTICATED";
    pub const NOT_SUBSCRIBED: &str = "NOT_SUBSCRIBED";
    pub const UNSOLICITED_MESSAGE: &str = "UNSOLICITED_MESSAGE";
    pub const LISTENER_EXISTS: &str = "LISTENER_EXISTS";
    pub const NOT_LISTENING: &str = "NOT_LISTENING";
    pub const VERSION_EXISTS: &str = "VERSION_EXISTS";
    pub const NO_RPC_PROVIDER: &str = "NO_RPC_PROVIDER";
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// A single protocol message.
///
/// `data` holds the raw string parts after the action. Interpretation of
/// the parts (names, versions, typed values, JSON bodies) is per-topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub topic: Topic,
    pub action: Action,
    pub data: Vec<String>,
}

impl Frame {
    pub fn new<I, S>(topic: Topic, action: Action, data: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Frame {
            topic,
            action,
            data: data.into_iter().map(Into::into).collect(),
        }
    }

    /// Encode to the wire representation, including the trailing record
    /// separator.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push_str(self.topic.code());
        out.push(PART_SEPARATOR);
        out.push_str(self.action.code());
        for part in &self.data {
            out.push(PART_SEPARATOR);
            out.push_str(part);
        }
        out.push(FRAME_SEPARATOR);
        out
    }

    /// The data part at `index`, if present.
    pub fn part(&self, index: usize) -> Option<&str> {
        self.data.get(index).map(String::as_str)
    }
}

/// Parse a single frame body (no trailing record separator).
pub fn parse_frame(raw: &str) -> Result<Frame, ParseError> {
    let mut parts = raw.split(PART_SEPARATOR);
    let topic_code = parts.next().unwrap_or_default();
    let Some(action_code) = parts.next() else {
        return Err(ParseError::InsufficientParts { raw: raw.to_owned() });
    };
    let topic = Topic::from_code(topic_code).ok_or_else(|| ParseError::UnknownTopic {
        code: topic_code.to_owned(),
    })?;
    let action = Action::from_code(action_code).ok_or_else(|| ParseError::UnknownAction {
        code: action_code.to_owned(),
    })?;
    Ok(Frame {
        topic,
        action,
        data: parts.map(str::to_owned).collect(),
    })
}

/// Frame-level parse failures. These never tear down the connection; the
/// offending frame is reported and dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("insufficient message parts in {raw:?}")]
    InsufficientParts { raw: String },
    #[error("unknown topic {code:?}")]
    UnknownTopic { code: String },
    #[error("unknown action {code:?}")]
    UnknownAction { code: String },
}

// ---------------------------------------------------------------------------
// FrameReader
// ---------------------------------------------------------------------------

/// Reassembles frames from arbitrarily-chunked inbound text.
///
/// The trailing fragment after the last record separator (possibly empty)
/// is retained for the next chunk.
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: String,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete frame it unlocked.
    pub fn push(&mut self, chunk: &str) -> Vec<Result<Frame, ParseError>> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.find(FRAME_SEPARATOR) {
            if pos > 0 {
                out.push(parse_frame(&self.buffer[..pos]));
            }
            self.buffer.drain(..=pos);
        }
        out
    }

    /// Drop any buffered partial frame.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

// ---------------------------------------------------------------------------
// Typed values
// ---------------------------------------------------------------------------

/// A typed wire value: a JSON value or the explicit undefined sentinel.
///
/// Undefined is distinct from null -- writing undefined through a record
/// patch deletes the addressed path.
#[derive(Debug, Clone, PartialEq)]
pub enum Typed {
    Value(Value),
    Undefined,
}

impl Typed {
    /// Encode with the single-byte type tag.
    pub fn encode(&self) -> String {
        match self {
            Typed::Undefined => "U".to_owned(),
            Typed::Value(Value::Null) => "L".to_owned(),
            Typed::Value(Value::Bool(true)) => "T".to_owned(),
            Typed::Value(Value::Bool(false)) => "F".to_owned(),
            Typed::Value(Value::String(s)) => format!("S{s}"),
            Typed::Value(Value::Number(n)) => format!("N{n}"),
            Typed::Value(v @ (Value::Object(_) | Value::Array(_))) => format!("O{v}"),
        }
    }

    /// Decode a tagged value. Numeric payloads are tried as integer first,
    /// then float.
    pub fn parse(raw: &str) -> Result<Typed, TypedError> {
        let Some(tag) = raw.chars().next() else {
            return Err(TypedError::Empty);
        };
        let payload = &raw[tag.len_utf8()..];
        match tag {
            'S' => Ok(Typed::Value(Value::String(payload.to_owned()))),
            'N' => {
                if let Ok(i) = payload.parse::<i64>() {
                    return Ok(Typed::Value(Value::Number(i.into())));
                }
                let f = payload
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .ok_or_else(|| TypedError::BadNumber {
                        raw: raw.to_owned(),
                    })?;
                Ok(Typed::Value(Value::Number(f)))
            }
            'O' => {
                let value: Value =
                    serde_json::from_str(payload).map_err(|e| TypedError::BadJson {
                        raw: raw.to_owned(),
                        detail: e.to_string(),
                    })?;
                Ok(Typed::Value(value))
            }
            'T' => Ok(Typed::Value(Value::Bool(true))),
            'F' => Ok(Typed::Value(Value::Bool(false))),
            'L' => Ok(Typed::Value(Value::Null)),
            'U' => Ok(Typed::Undefined),
            _ => Err(TypedError::UnknownType {
                raw: raw.to_owned(),
            }),
        }
    }

    /// The contained JSON value; undefined decodes as null.
    pub fn into_value(self) -> Value {
        match self {
            Typed::Value(v) => v,
            Typed::Undefined => Value::Null,
        }
    }
}

impl From<Value> for Typed {
    fn from(v: Value) -> Self {
        Typed::Value(v)
    }
}

/// Shorthand for encoding a plain JSON value.
pub fn encode_typed(value: &Value) -> String {
    Typed::Value(value.clone()).encode()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypedError {
    #[error("empty typed value")]
    Empty,
    #[error("UNKNOWN_TYPE ({raw})")]
    UnknownType { raw: String },
    #[error("non-numeric payload in {raw}")]
    BadNumber { raw: String },
    #[error("invalid JSON payload in {raw}: {detail}")]
    BadJson { raw: String, detail: String },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
