//! Context payloads: the ordered items sent to the next model call

use crate::memory::operation::{payload_text, Operation, TAG_COMPLETED, TAG_DEBUG, TAG_TRANSIENT};
use serde::{Deserialize, Serialize};

/// Operation kind lifted into a file-content item (payload `{path, content}`)
pub const KIND_FILE_CONTENT: &str = "file_content";
/// Operation kind lifted into a state-snapshot item (payload `{key, state}`)
pub const KIND_STATE_SNAPSHOT: &str = "state_snapshot";

/// Shape of a context item, which decides the techniques that apply to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ItemKind {
    /// Free text supplied by the caller
    Text,
    /// A recorded operation with an opaque payload
    Operation { op_kind: String },
    /// Full file content
    FileContent { path: String },
    /// Full state snapshot for `key`
    StateSnapshot { key: String },
    /// File content replaced by registry metadata
    Artifact { path: String, hash: String, size: usize },
    /// Content moved to the external store
    ExternalRef { reference: String, original_tokens: usize },
    /// Snapshot replaced by a delta against the previous one
    StateDelta { key: String },
    /// Summary of completed history
    Summary { replaced: usize },
}

impl ItemKind {
    /// Stable type name, passed to per-item optimization checks
    pub fn type_name(&self) -> &str {
        match self {
            Self::Text => "text",
            Self::Operation { op_kind } => op_kind,
            Self::FileContent { .. } => KIND_FILE_CONTENT,
            Self::StateSnapshot { .. } => KIND_STATE_SNAPSHOT,
            Self::Artifact { .. } => "artifact",
            Self::ExternalRef { .. } => "external_ref",
            Self::StateDelta { .. } => "state_delta",
            Self::Summary { .. } => "summary",
        }
    }

    /// True for kinds produced by the optimizer itself
    pub fn is_rewritten(&self) -> bool {
        matches!(
            self,
            Self::Artifact { .. } | Self::ExternalRef { .. } | Self::StateDelta { .. } | Self::Summary { .. }
        )
    }
}

/// One entry of a context payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub id: String,
    pub kind: ItemKind,
    pub content: serde_json::Value,
    pub tokens: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Pinned items are never rewritten or dropped
    #[serde(default)]
    pub pinned: bool,
}

impl ContextItem {
    pub fn text(id: impl Into<String>, content: impl Into<String>, tokens: usize) -> Self {
        Self {
            id: id.into(),
            kind: ItemKind::Text,
            content: serde_json::Value::String(content.into()),
            tokens,
            tags: Vec::new(),
            pinned: false,
        }
    }

    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
        self
    }

    /// Lift an operation into a context item, keeping its token cost.
    ///
    /// `file_content` and `state_snapshot` operations with the expected
    /// payload shape become typed items; everything else stays opaque.
    pub fn from_operation(op: &Operation) -> Self {
        let id = format!("{}#{}", op.kind, op.seq);
        let field = |name: &str| op.payload.get(name);

        let (kind, content) = match op.kind.as_str() {
            KIND_FILE_CONTENT => match (field("path").and_then(|p| p.as_str()), field("content")) {
                (Some(path), Some(content)) => (
                    ItemKind::FileContent {
                        path: path.to_string(),
                    },
                    content.clone(),
                ),
                _ => Self::opaque(op),
            },
            KIND_STATE_SNAPSHOT => match (field("key").and_then(|k| k.as_str()), field("state")) {
                (Some(key), Some(state)) => (
                    ItemKind::StateSnapshot {
                        key: key.to_string(),
                    },
                    state.clone(),
                ),
                _ => Self::opaque(op),
            },
            _ => Self::opaque(op),
        };

        Self {
            id,
            kind,
            content,
            tokens: op.token_cost,
            tags: op.tags.clone(),
            pinned: false,
        }
    }

    fn opaque(op: &Operation) -> (ItemKind, serde_json::Value) {
        (
            ItemKind::Operation {
                op_kind: op.kind.clone(),
            },
            op.payload.clone(),
        )
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Transient and debug-only items are the first to go
    pub fn is_transient(&self) -> bool {
        self.has_tag(TAG_TRANSIENT) || self.has_tag(TAG_DEBUG)
    }

    pub fn is_completed(&self) -> bool {
        self.has_tag(TAG_COMPLETED)
    }

    pub fn content_text(&self) -> String {
        payload_text(&self.content)
    }
}

/// Ordered context payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub items: Vec<ContextItem>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: Vec<ContextItem>) -> Self {
        Self { items }
    }

    pub fn push(&mut self, item: ContextItem) {
        self.items.push(item);
    }

    pub fn total_tokens(&self) -> usize {
        self.items
            .iter()
            .fold(0usize, |acc, i| acc.saturating_add(i.tokens))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Render as prompt text, one `[type] content` block per item
    pub fn render(&self) -> String {
        self.items
            .iter()
            .map(|item| format!("[{}] {}", item.kind.type_name(), item.content_text()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}
