// ds-test-utils: a mock deepstream server for integration testing the
// client.
//
// Binds 127.0.0.1:0 and speaks the real wire protocol: challenge on
// connect, scripted auth responses, automatic acks, record reads from a
// configurable store, plus arbitrary per-frame scripted responses and
// frame injection for server-push scenarios.

pub mod mock_server;

pub use mock_server::{AuthBehavior, MockServer, Rule};
