//! Working memory: a bounded FIFO buffer of recent operations

use super::operation::Operation;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::OnceLock;
use tracing::debug;

static WORD: OnceLock<Regex> = OnceLock::new();

/// Count and token totals of the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingMemoryStatus {
    pub count: usize,
    pub tokens: usize,
    pub capacity: usize,
    pub token_budget: usize,
}

/// Recent operations, bounded by both an item capacity and a token budget.
///
/// After every insert the oldest operations are dropped while either bound
/// is exceeded, regardless of kind or size.
#[derive(Debug, Clone)]
pub struct WorkingMemory {
    operations: VecDeque<Operation>,
    capacity: usize,
    token_budget: usize,
    tokens: usize,
}

impl WorkingMemory {
    pub fn new(capacity: usize, token_budget: usize) -> Self {
        Self {
            operations: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            token_budget,
            tokens: 0,
        }
    }

    /// Insert an operation, returning whatever was evicted (oldest first).
    ///
    /// An operation larger than the whole token budget evicts everything,
    /// itself included.
    pub fn add_operation(&mut self, op: Operation) -> Vec<Operation> {
        self.tokens = self.tokens.saturating_add(op.token_cost);
        self.operations.push_back(op);
        self.enforce_bounds()
    }

    fn enforce_bounds(&mut self) -> Vec<Operation> {
        let mut evicted = Vec::new();
        while self.operations.len() > self.capacity || self.tokens > self.token_budget {
            let Some(oldest) = self.operations.pop_front() else {
                break;
            };
            self.tokens = self.tokens.saturating_sub(oldest.token_cost);
            evicted.push(oldest);
        }

        if !evicted.is_empty() {
            debug!(
                "Evicted {} operation(s) from working memory ({} left, {} tokens)",
                evicted.len(),
                self.operations.len(),
                self.tokens
            );
        }
        evicted
    }

    /// Change the bounds, evicting as needed
    pub fn resize(&mut self, capacity: usize, token_budget: usize) -> Vec<Operation> {
        self.capacity = capacity;
        self.token_budget = token_budget;
        self.enforce_bounds()
    }

    /// The last `limit` operations (all when `None`), oldest first
    pub fn get_recent(&self, limit: Option<usize>) -> Vec<Operation> {
        let take = limit.unwrap_or(self.operations.len()).min(self.operations.len());
        self.operations
            .iter()
            .skip(self.operations.len() - take)
            .cloned()
            .collect()
    }

    /// The last `limit` operations of `kind`, oldest first
    pub fn get_by_kind(&self, kind: &str, limit: usize) -> Vec<Operation> {
        let mut matches: Vec<Operation> = self
            .operations
            .iter()
            .rev()
            .filter(|op| op.kind == kind)
            .take(limit)
            .cloned()
            .collect();
        matches.reverse();
        matches
    }

    /// Case-insensitive scan over payload text, newest matches first.
    ///
    /// An operation matches when its text contains the whole query, or every
    /// keyword of it. No ranking beyond match presence; O(n) in the buffer
    /// size, which is bounded.
    pub fn search(&self, query: &str, max_results: usize) -> Vec<Operation> {
        let query = query.trim().to_lowercase();
        if query.is_empty() || max_results == 0 {
            return Vec::new();
        }
        let keywords = keywords(&query);

        self.operations
            .iter()
            .rev()
            .filter(|op| {
                let text = op.text().to_lowercase();
                text.contains(&query)
                    || (!keywords.is_empty() && keywords.iter().all(|k| text.contains(k.as_str())))
            })
            .take(max_results)
            .cloned()
            .collect()
    }

    pub fn status(&self) -> WorkingMemoryStatus {
        WorkingMemoryStatus {
            count: self.operations.len(),
            tokens: self.tokens,
            capacity: self.capacity,
            token_budget: self.token_budget,
        }
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn tokens(&self) -> usize {
        self.tokens
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.operations.iter()
    }

    pub fn clear(&mut self) {
        self.operations.clear();
        self.tokens = 0;
    }
}

/// Split a lowercased query into word keywords
fn keywords(query: &str) -> Vec<String> {
    WORD.get_or_init(|| Regex::new(r"\w+").expect("valid word pattern"))
        .find_iter(query)
        .map(|m| m.as_str().to_string())
        .collect()
}
