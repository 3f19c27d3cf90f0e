//! The synchronous reduction techniques.
//!
//! Each one works toward `target` (the total token count to get down to),
//! stops as soon as it is reached, and leaves pinned items alone. A technique
//! that finds nothing to do leaves the context untouched.

use super::context::{Context, ContextItem, ItemKind};
use super::store::{content_hash, ContentStore};
use crate::memory::operation::TokenEstimator;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

/// What a single technique did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Outcome {
    pub items: usize,
    pub tokens_saved: usize,
}

impl Outcome {
    fn record(&mut self, saved: usize) {
        self.items += 1;
        self.tokens_saved += saved;
    }

    pub fn applied(&self) -> bool {
        self.items > 0
    }
}

/// Drop transient and debug items, oldest first
pub(crate) fn prune(ctx: &mut Context, target: usize) -> Outcome {
    let mut total = ctx.total_tokens();
    let mut outcome = Outcome::default();
    ctx.items.retain(|item| {
        if total <= target || item.pinned || !item.is_transient() {
            return true;
        }
        total = total.saturating_sub(item.tokens);
        outcome.record(item.tokens);
        false
    });
    outcome
}

/// Indices of items passing `filter`, largest first
fn largest_first(ctx: &Context, filter: impl Fn(&ContextItem) -> bool) -> Vec<usize> {
    let mut indices: Vec<usize> = ctx
        .items
        .iter()
        .enumerate()
        .filter(|(_, item)| !item.pinned && filter(item))
        .map(|(idx, _)| idx)
        .collect();
    indices.sort_by(|a, b| ctx.items[*b].tokens.cmp(&ctx.items[*a].tokens));
    indices
}

/// Replace file contents with `{path, hash, size}` metadata
pub(crate) fn register_artifacts(
    ctx: &mut Context,
    target: usize,
    eligible: &dyn Fn(&ContextItem) -> bool,
    estimator: &dyn TokenEstimator,
) -> Outcome {
    let mut total = ctx.total_tokens();
    let mut outcome = Outcome::default();
    let candidates = largest_first(ctx, |item| {
        matches!(item.kind, ItemKind::FileContent { .. }) && eligible(item)
    });

    for idx in candidates {
        if total <= target {
            break;
        }
        let item = &mut ctx.items[idx];
        let ItemKind::FileContent { path } = &item.kind else {
            continue;
        };
        let path = path.clone();
        let body = item.content_text();
        let hash = content_hash(body.as_bytes());
        let size = body.len();

        let content = json!({ "path": path, "hash": hash, "size": size });
        let tokens = estimator.estimate(&content.to_string());
        if tokens >= item.tokens {
            continue;
        }

        let saved = item.tokens - tokens;
        debug!("Registered {} as artifact ({} tokens saved)", path, saved);
        item.kind = ItemKind::Artifact { path, hash, size };
        item.content = content;
        item.tokens = tokens;
        total -= saved;
        outcome.record(saved);
    }
    outcome
}

/// Indices of the items external storage may move, largest first
pub(crate) fn external_candidates(
    ctx: &Context,
    threshold: usize,
    eligible: &dyn Fn(&ContextItem) -> bool,
) -> Vec<usize> {
    largest_first(ctx, |item| {
        !item.kind.is_rewritten() && item.tokens >= threshold && eligible(item)
    })
}

/// Move the candidate items into the content store, leaving a reference behind.
///
/// An item the store refuses is dropped instead.
pub(crate) async fn store_externally(
    ctx: &mut Context,
    target: usize,
    candidates: Vec<usize>,
    estimator: &dyn TokenEstimator,
    store: &dyn ContentStore,
) -> Outcome {
    let mut total = ctx.total_tokens();
    let mut outcome = Outcome::default();
    let mut dropped = Vec::new();

    for idx in candidates {
        if total <= target {
            break;
        }
        let stored = match serde_json::to_vec(&ctx.items[idx].content) {
            Ok(bytes) => store.put(&bytes).await,
            Err(e) => Err(e.into()),
        };
        let item = &mut ctx.items[idx];

        match stored {
            Ok(reference) => {
                let content = json!({
                    "reference": reference,
                    "type": item.kind.type_name(),
                    "original_tokens": item.tokens,
                });
                let tokens = estimator.estimate(&content.to_string());
                if tokens >= item.tokens {
                    continue;
                }
                let saved = item.tokens - tokens;
                debug!("Stored {} externally ({} tokens saved)", item.id, saved);
                item.kind = ItemKind::ExternalRef {
                    reference,
                    original_tokens: item.tokens,
                };
                item.content = content;
                item.tokens = tokens;
                total -= saved;
                outcome.record(saved);
            }
            Err(e) => {
                warn!("External store rejected {}, dropping it: {}", item.id, e);
                total = total.saturating_sub(item.tokens);
                outcome.record(item.tokens);
                dropped.push(idx);
            }
        }
    }

    dropped.sort_unstable_by(|a, b| b.cmp(a));
    for idx in dropped {
        ctx.items.remove(idx);
    }
    outcome
}

/// Delta of `current` against `prior`.
///
/// Objects diff by top-level key; any other pair only yields a delta when
/// the two are equal.
pub(crate) fn state_delta(prior: &Value, current: &Value) -> Option<Value> {
    let (Value::Object(prev), Value::Object(cur)) = (prior, current) else {
        return (prior == current).then(|| json!({ "unchanged": true }));
    };

    let set: Map<String, Value> = cur
        .iter()
        .filter(|(key, value)| prev.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    let removed: Vec<&String> = prev.keys().filter(|key| !cur.contains_key(*key)).collect();

    Some(json!({ "set": set, "removed": removed }))
}

/// Rewrite later snapshots of a key as deltas against the previous one
pub(crate) fn diff_state(
    ctx: &mut Context,
    target: usize,
    eligible: &dyn Fn(&ContextItem) -> bool,
    estimator: &dyn TokenEstimator,
) -> Outcome {
    let mut total = ctx.total_tokens();
    let mut outcome = Outcome::default();
    // key -> (id, full state) of the most recent snapshot seen
    let mut last: HashMap<String, (String, Value)> = HashMap::new();

    for item in ctx.items.iter_mut() {
        if total <= target {
            break;
        }
        let ItemKind::StateSnapshot { key } = &item.kind else {
            continue;
        };
        let key = key.clone();
        let full = item.content.clone();

        if let Some((base_id, prior)) = last.get(&key) {
            if !item.pinned && eligible(&*item) {
                if let Some(Value::Object(mut delta)) = state_delta(prior, &item.content) {
                    delta.insert("base".to_string(), Value::String(base_id.clone()));
                    let delta = Value::Object(delta);
                    let tokens = estimator.estimate(&delta.to_string());
                    if tokens < item.tokens {
                        let saved = item.tokens - tokens;
                        debug!("Snapshot {} of '{}' replaced by delta", item.id, key);
                        item.kind = ItemKind::StateDelta { key: key.clone() };
                        item.content = delta;
                        item.tokens = tokens;
                        total -= saved;
                        outcome.record(saved);
                    }
                }
            }
        }

        last.insert(key, (item.id.clone(), full));
    }
    outcome
}
