//! Context Warden - context-window budgeting for LLM orchestration loops
//!
//! Keeps the most useful history in front of the model without overflowing
//! its input budget:
//! - Detect the model's context window (live, static table, config, default)
//! - Track cumulative usage against a utilization limit, by zone
//! - Pick an optimization profile from the window size
//! - Hold recent operations in a bounded working memory
//! - Shrink context payloads with an ordered technique pipeline
//! - Checkpoint and restore a session across process handoffs

pub mod config;
pub mod memory;
pub mod optimizer;
pub mod profile;
pub mod window;

pub use config::WardenConfig;
pub use memory::{
    BuiltContext, Checkpoint, ManagerStatus, MemoryManager, ModelConfig, Operation,
    WorkingMemory,
};
pub use optimizer::{
    Context, ContextItem, ContextOptimizer, ItemKind, OptimizationResult, Summarizer,
};
pub use profile::{AdaptiveOptimizer, CheckpointInterval, WindowProfile};
pub use window::{UsageState, WindowDetector, WindowManager, Zone};

use std::path::PathBuf;

/// Result type for Context Warden operations
pub type Result<T> = std::result::Result<T, WardenError>;

/// Errors that can occur in Context Warden
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    #[error("Window detection failed: {0}")]
    Detection(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unknown profile: {0}")]
    UnknownProfile(String),

    #[error("Checkpoint IO error at {}: {source}", path.display())]
    CheckpointIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint validation failed: {0}")]
    RestoreValidation(String),

    #[error("Content store error: {0}")]
    ContentStore(String),

    #[error("Summarization error: {0}")]
    Summarization(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}
