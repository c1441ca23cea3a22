//! Client for the deepstream realtime server.
//!
//! Multiplexes four topic families over one WebSocket: records
//! (versioned JSON documents with partial updates and conflict
//! resolution), events (pub/sub), RPCs (request/response with provider
//! registration) and presence, plus the connection state machine that
//! handles challenge/redirect, authentication, heartbeating, buffering
//! and reconnection with resubscription.
//!
//! All state lives on a single driver task; [`Client`] is a clonable
//! handle whose async methods resolve on that task.
//!
//! ```no_run
//! use deepstream_client::Client;
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new("ws://localhost:6020/deepstream");
//! client.connect();
//! client.login(json!({"username": "alice"})).await?;
//!
//! let record = client.records().get_record("profile/alice").await?;
//! record.set_path("firstname", json!("Alice"));
//!
//! let sum = client.rpcs().make("add-two", json!({"numA": 3, "numB": 8})).await?;
//! # let _ = sum;
//! # Ok(())
//! # }
//! ```

mod ack_registry;
mod client;
mod connection;
mod driver;
mod emitter;
mod errors;
mod event;
mod handles;
pub mod jsonpath;
mod listener;
mod options;
mod presence;
mod record;
mod rpc;
mod single_notifier;

pub use client::Client;
pub use connection::ConnectionState;
pub use ds_protocol as protocol;
pub use emitter::SubscriptionId;
pub use errors::{ClientError, ErrorEvent, ErrorKind, LoginResult};
pub use handles::{Events, ListHandle, Presence, RecordHandle, Records, Rpcs};
pub use listener::{ListenEvent, ListenResponder};
pub use options::ClientOptions;
pub use record::{ListEventKind, MergeFn, MergeStrategy, RecordError, RecordInfo};
pub use rpc::{RpcError, RpcResponder};
pub use single_notifier::RequestError;
