//! Conflict resolution for record version clashes.

use serde_json::Value;
use std::sync::Arc;

/// Signature for custom resolvers: `(local, remote, remote_version)` to
/// the canonical document, or an error message that surfaces as
/// `VERSION_EXISTS`.
pub type MergeFn = dyn Fn(&Value, &Value, u64) -> Result<Value, String> + Send + Sync;

/// How a record reconciles a conflicting remote version.
#[derive(Clone, Default)]
pub enum MergeStrategy {
    /// Adopt the remote document unchanged.
    #[default]
    RemoteWins,
    /// Keep the local document and push it at the remote version.
    LocalWins,
    Custom(Arc<MergeFn>),
}

impl MergeStrategy {
    pub fn merge(&self, local: &Value, remote: &Value, remote_version: u64) -> Result<Value, String> {
        match self {
            MergeStrategy::RemoteWins => Ok(remote.clone()),
            MergeStrategy::LocalWins => Ok(local.clone()),
            MergeStrategy::Custom(f) => f(local, remote, remote_version),
        }
    }
}

impl std::fmt::Debug for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeStrategy::RemoteWins => f.write_str("RemoteWins"),
            MergeStrategy::LocalWins => f.write_str("LocalWins"),
            MergeStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remote_wins_returns_the_remote_document() {
        let merged = MergeStrategy::RemoteWins
            .merge(&json!({"a": 1}), &json!({"a": 2}), 5)
            .unwrap();
        assert_eq!(merged, json!({"a": 2}));
    }

    #[test]
    fn local_wins_returns_the_local_document() {
        let merged = MergeStrategy::LocalWins
            .merge(&json!({"a": 1}), &json!({"a": 2}), 5)
            .unwrap();
        assert_eq!(merged, json!({"a": 1}));
    }

    #[test]
    fn custom_strategies_can_combine_and_fail() {
        let combine = MergeStrategy::Custom(Arc::new(|local, remote, _| {
            let mut out = local.clone();
            out["b"] = remote["b"].clone();
            Ok(out)
        }));
        let merged = combine
            .merge(&json!({"a": 1, "b": 0}), &json!({"b": 9}), 3)
            .unwrap();
        assert_eq!(merged, json!({"a": 1, "b": 9}));

        let failing = MergeStrategy::Custom(Arc::new(|_, _, _| Err("no merge".to_owned())));
        assert!(failing.merge(&json!({}), &json!({}), 1).is_err());
    }
}
