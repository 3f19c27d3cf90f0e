//! Operations: the unit of history kept in working memory

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Approximate bytes per token for context estimation
pub const APPROX_BYTES_PER_TOKEN: usize = 4;

/// Tag: safe to drop first when shrinking context
pub const TAG_TRANSIENT: &str = "transient";
/// Tag: debug-only output, dropped with transient items
pub const TAG_DEBUG: &str = "debug";
/// Tag: belongs to a completed phase of history, may be summarized
pub const TAG_COMPLETED: &str = "completed";

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

fn next_sequence() -> u64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Keep fresh sequence numbers above one loaded from disk
pub(crate) fn observe_sequence(seq: u64) {
    NEXT_SEQUENCE.fetch_max(seq.saturating_add(1), Ordering::Relaxed);
}

/// Estimates the token cost of text
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// Fixed bytes-per-token ratio, rounded up so non-empty text costs at least one token
#[derive(Debug, Clone, Copy)]
pub struct ByteRatioEstimator {
    pub bytes_per_token: usize,
}

impl Default for ByteRatioEstimator {
    fn default() -> Self {
        Self {
            bytes_per_token: APPROX_BYTES_PER_TOKEN,
        }
    }
}

impl TokenEstimator for ByteRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.len().div_ceil(self.bytes_per_token.max(1))
    }
}

/// A recorded orchestration event (task start, agent response, decision, error).
///
/// The payload is opaque; `token_cost` is supplied by the caller or an
/// estimator and never recomputed here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Process-unique, increasing in creation order
    #[serde(default = "next_sequence")]
    pub seq: u64,
    pub kind: String,
    pub payload: serde_json::Value,
    pub token_cost: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Operation {
    /// Create an operation with a caller-supplied token cost
    pub fn new(kind: impl Into<String>, payload: serde_json::Value, token_cost: usize) -> Self {
        Self {
            seq: next_sequence(),
            kind: kind.into(),
            payload,
            token_cost,
            timestamp: Utc::now(),
            tags: Vec::new(),
        }
    }

    /// Create an operation whose cost is estimated from its text form
    pub fn estimated(
        kind: impl Into<String>,
        payload: serde_json::Value,
        estimator: &dyn TokenEstimator,
    ) -> Self {
        let cost = estimator.estimate(&payload_text(&payload));
        Self::new(kind, payload, cost)
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Text representation used for search and summarization
    pub fn text(&self) -> String {
        payload_text(&self.payload)
    }
}

/// Strings render verbatim, everything else as compact JSON
pub fn payload_text(payload: &serde_json::Value) -> String {
    match payload {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_estimator_rounds_up() {
        let estimator = ByteRatioEstimator::default();
        assert_eq!(estimator.estimate(""), 0);
        assert_eq!(estimator.estimate("abc"), 1);
        assert_eq!(estimator.estimate("abcdefgh"), 2);
        assert_eq!(estimator.estimate("abcdefghi"), 3);
    }

    #[test]
    fn test_estimated_operation() {
        let op = Operation::estimated("agent_response", json!("x".repeat(400)), &ByteRatioEstimator::default());
        assert_eq!(op.token_cost, 100);
    }

    #[test]
    fn test_tags_are_deduplicated() {
        let op = Operation::new("debug_log", json!("trace"), 2)
            .with_tag(TAG_DEBUG)
            .with_tag(TAG_DEBUG);
        assert_eq!(op.tags, vec![TAG_DEBUG.to_string()]);
        assert!(op.has_tag(TAG_DEBUG));
        assert!(!op.has_tag(TAG_COMPLETED));
    }

    #[test]
    fn test_sequence_is_unique_and_increasing() {
        let ops: Vec<Operation> = (0..1000)
            .map(|_| Operation::new("state_snapshot", json!({}), 1))
            .collect();
        assert!(ops.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn test_loaded_sequence_advances_counter() {
        let loaded: Operation = serde_json::from_value(json!({
            "seq": 1_000_000_000u64,
            "kind": "decision",
            "payload": "x",
            "token_cost": 1,
            "timestamp": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        observe_sequence(loaded.seq);
        assert!(Operation::new("decision", json!("y"), 1).seq > loaded.seq);

        // checkpoints written before sequences existed still load
        let legacy: Operation = serde_json::from_value(json!({
            "kind": "decision",
            "payload": "x",
            "token_cost": 1,
            "timestamp": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(legacy.seq > 0);
    }

    #[test]
    fn test_text_representation() {
        let op = Operation::new("task_start", json!("Implement login"), 3);
        assert_eq!(op.text(), "Implement login");

        let op = Operation::new("decision", json!({"action": "retry"}), 3);
        assert_eq!(op.text(), r#"{"action":"retry"}"#);
    }
}
