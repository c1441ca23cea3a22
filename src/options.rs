//! Client configuration.
//!
//! All knobs are process-wide and fixed at client creation. The struct
//! derives `Deserialize` so applications can embed it in their own config
//! files; durations deserialize from integer milliseconds.

use crate::record::MergeStrategy;
use serde::Deserialize;
use std::time::Duration;

/// Tunables for timeouts, reconnection and record merging.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Ack timeout for subscribe/unsubscribe/listen.
    #[serde(with = "duration_ms", rename = "subscription_timeout_ms")]
    pub subscription_timeout: Duration,
    /// Ack timeout after CREATEORREAD.
    #[serde(with = "duration_ms", rename = "record_read_ack_timeout_ms")]
    pub record_read_ack_timeout: Duration,
    /// Response timeout for the initial READ.
    #[serde(with = "duration_ms", rename = "record_read_timeout_ms")]
    pub record_read_timeout: Duration,
    /// Ack timeout after DELETE.
    #[serde(with = "duration_ms", rename = "record_delete_timeout_ms")]
    pub record_delete_timeout: Duration,
    /// Per-call RPC ack deadline.
    #[serde(with = "duration_ms", rename = "rpc_ack_timeout_ms")]
    pub rpc_ack_timeout: Duration,
    /// Per-call RPC response deadline.
    #[serde(with = "duration_ms", rename = "rpc_response_timeout_ms")]
    pub rpc_response_timeout: Duration,
    /// Expected server PING cadence; miss tolerance is twice this.
    #[serde(with = "duration_ms", rename = "heartbeat_interval_ms")]
    pub heartbeat_interval: Duration,
    /// Reconnect cap before the connection goes to the error state.
    pub max_reconnect_attempts: u32,
    /// Base delay per reconnect attempt.
    #[serde(with = "duration_ms", rename = "reconnect_interval_increment_ms")]
    pub reconnect_interval_increment: Duration,
    /// Upper cap on the reconnect delay.
    #[serde(with = "duration_ms", rename = "max_reconnect_interval_ms")]
    pub max_reconnect_interval: Duration,
    /// Default conflict resolver for records.
    #[serde(skip)]
    pub merge_strategy: MergeStrategy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            subscription_timeout: Duration::from_secs(2),
            record_read_ack_timeout: Duration::from_secs(1),
            record_read_timeout: Duration::from_secs(3),
            record_delete_timeout: Duration::from_secs(3),
            rpc_ack_timeout: Duration::from_secs(6),
            rpc_response_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            max_reconnect_attempts: 3,
            reconnect_interval_increment: Duration::from_secs(4),
            max_reconnect_interval: Duration::from_secs(18),
            merge_strategy: MergeStrategy::RemoteWins,
        }
    }
}

impl ClientOptions {
    /// Heartbeat miss tolerance: two full intervals.
    pub(crate) fn heartbeat_tolerance(&self) -> Duration {
        self.heartbeat_interval * 2
    }

    /// Backoff before reconnect attempt number `attempt` (1-based),
    /// capped at `max_reconnect_interval`.
    pub(crate) fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_interval_increment
            .saturating_mul(attempt)
            .min(self.max_reconnect_interval)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
