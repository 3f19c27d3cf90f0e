//! Context Optimizer for Context Warden
//!
//! Shrinks a context payload toward a target reduction by running an ordered
//! list of techniques. Later techniques only run while the target is unmet;
//! the cheapest and most lossless ones go first.

pub mod context;
pub mod store;
pub mod summarizer;
mod techniques;

pub use context::{Context, ContextItem, ItemKind, KIND_FILE_CONTENT, KIND_STATE_SNAPSHOT};
pub use store::{content_hash, ContentStore, FsContentStore, InMemoryContentStore};
pub use summarizer::{ChatSummarizer, Summarizer};

use crate::memory::operation::{ByteRatioEstimator, TokenEstimator, TAG_COMPLETED};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use techniques::Outcome;
use tracing::{debug, info, warn};

/// Default absolute size at which an item goes to the external store
pub const DEFAULT_EXTERNAL_STORAGE_THRESHOLD: usize = 2000;
/// Default floor for the summary length requested from the summarizer
pub const DEFAULT_MIN_SUMMARY_TOKENS: usize = 128;

/// One reduction technique
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Technique {
    Pruning,
    ArtifactRegistry,
    ExternalStorage,
    DifferentialState,
    Summarization,
}

impl Technique {
    /// The default pipeline, in priority order
    pub const ALL: [Technique; 5] = [
        Technique::Pruning,
        Technique::ArtifactRegistry,
        Technique::ExternalStorage,
        Technique::DifferentialState,
        Technique::Summarization,
    ];
}

impl std::fmt::Display for Technique {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pruning => write!(f, "pruning"),
            Self::ArtifactRegistry => write!(f, "artifact_registry"),
            Self::ExternalStorage => write!(f, "external_storage"),
            Self::DifferentialState => write!(f, "differential_state"),
            Self::Summarization => write!(f, "summarization"),
        }
    }
}

/// Optimizer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub external_storage_threshold_tokens: usize,
    pub min_summary_tokens: usize,
    /// Per-item threshold used by `optimize` when no predicate is given
    pub item_threshold_tokens: usize,
    /// Techniques to run, in order
    pub techniques: Vec<Technique>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            external_storage_threshold_tokens: DEFAULT_EXTERNAL_STORAGE_THRESHOLD,
            min_summary_tokens: DEFAULT_MIN_SUMMARY_TOKENS,
            item_threshold_tokens: 0,
            techniques: Technique::ALL.to_vec(),
        }
    }
}

/// Per-technique record of one optimization run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechniqueStep {
    pub technique: Technique,
    /// The target was still unmet when this technique's turn came
    pub attempted: bool,
    pub items_changed: usize,
    pub tokens_saved: usize,
}

/// Outcome of `optimize`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub target_tokens: usize,
    pub techniques_applied: Vec<Technique>,
    /// tokens_after / tokens_before, 1.0 when nothing changed
    pub compression_ratio: f64,
    pub target_met: bool,
    pub steps: Vec<TechniqueStep>,
}

impl OptimizationResult {
    pub fn tokens_saved(&self) -> usize {
        self.tokens_before.saturating_sub(self.tokens_after)
    }

    /// Format as a short log-friendly string
    pub fn to_log_string(&self) -> String {
        let applied = if self.techniques_applied.is_empty() {
            "none".to_string()
        } else {
            self.techniques_applied
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!(
            "optimized {} -> {} tokens (target {}, ratio {:.2}, techniques: {})",
            self.tokens_before, self.tokens_after, self.target_tokens, self.compression_ratio, applied
        )
    }
}

/// Ordered technique pipeline over a context payload
pub struct ContextOptimizer {
    config: OptimizerConfig,
    estimator: Arc<dyn TokenEstimator>,
    store: Option<Arc<dyn ContentStore>>,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl ContextOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            estimator: Arc::new(ByteRatioEstimator::default()),
            store: None,
            summarizer: None,
        }
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ContentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub(crate) fn set_store(&mut self, store: Arc<dyn ContentStore>) {
        self.store = Some(store);
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn has_summarizer(&self) -> bool {
        self.summarizer.is_some()
    }

    /// Optimize with the configured per-item threshold as eligibility
    pub async fn optimize(
        &self,
        context: Context,
        target_reduction_fraction: f64,
    ) -> (Context, OptimizationResult) {
        let threshold = self.config.item_threshold_tokens;
        let should_optimize = move |tokens: usize, _item_type: &str| tokens >= threshold;
        self.optimize_with(context, target_reduction_fraction, &should_optimize)
            .await
    }

    /// Reduce `context` by `target_reduction_fraction` of its tokens.
    ///
    /// `should_optimize(tokens, item_type)` decides which items may be
    /// rewritten. Never fails: an unmet target is reported in the result.
    pub async fn optimize_with(
        &self,
        mut context: Context,
        target_reduction_fraction: f64,
        should_optimize: &(dyn Fn(usize, &str) -> bool + Send + Sync),
    ) -> (Context, OptimizationResult) {
        let fraction = if target_reduction_fraction.is_nan() {
            0.0
        } else {
            target_reduction_fraction.clamp(0.0, 1.0)
        };
        let before = context.total_tokens();
        let reduction = (before as f64 * fraction).ceil() as usize;
        let target = before.saturating_sub(reduction);
        let eligible = |item: &ContextItem| should_optimize(item.tokens, item.kind.type_name());

        let mut steps = Vec::with_capacity(self.config.techniques.len());
        let mut applied = Vec::new();

        for &technique in &self.config.techniques {
            if context.total_tokens() <= target {
                steps.push(TechniqueStep {
                    technique,
                    attempted: false,
                    items_changed: 0,
                    tokens_saved: 0,
                });
                continue;
            }

            let outcome = match technique {
                Technique::Pruning => techniques::prune(&mut context, target),
                Technique::ArtifactRegistry => techniques::register_artifacts(
                    &mut context,
                    target,
                    &eligible,
                    self.estimator.as_ref(),
                ),
                Technique::ExternalStorage => match &self.store {
                    Some(store) => {
                        let candidates = techniques::external_candidates(
                            &context,
                            self.config.external_storage_threshold_tokens,
                            &eligible,
                        );
                        techniques::store_externally(
                            &mut context,
                            target,
                            candidates,
                            self.estimator.as_ref(),
                            store.as_ref(),
                        )
                        .await
                    }
                    None => {
                        debug!("No content store configured, skipping external storage");
                        Outcome::default()
                    }
                },
                Technique::DifferentialState => techniques::diff_state(
                    &mut context,
                    target,
                    &eligible,
                    self.estimator.as_ref(),
                ),
                Technique::Summarization => self.summarize_completed(&mut context, target).await,
            };

            if outcome.applied() {
                applied.push(technique);
            }
            steps.push(TechniqueStep {
                technique,
                attempted: true,
                items_changed: outcome.items,
                tokens_saved: outcome.tokens_saved,
            });
        }

        let after = context.total_tokens();
        let result = OptimizationResult {
            tokens_before: before,
            tokens_after: after,
            target_tokens: target,
            compression_ratio: if before == 0 {
                1.0
            } else {
                after as f64 / before as f64
            },
            target_met: after <= target,
            techniques_applied: applied,
            steps,
        };

        if result.techniques_applied.is_empty() {
            debug!("Context {}", result.to_log_string());
        } else {
            info!("Context {}", result.to_log_string());
        }
        (context, result)
    }

    /// Fold completed-phase items into one summary item at the position of
    /// the first of them.
    async fn summarize_completed(&self, context: &mut Context, target: usize) -> Outcome {
        let Some(summarizer) = &self.summarizer else {
            debug!("No summarizer configured, skipping summarization");
            return Outcome::default();
        };

        let indices: Vec<usize> = context
            .items
            .iter()
            .enumerate()
            .filter(|(_, item)| {
                !item.pinned && item.is_completed() && !matches!(item.kind, ItemKind::Summary { .. })
            })
            .map(|(idx, _)| idx)
            .collect();
        let Some(&first) = indices.first() else {
            return Outcome::default();
        };

        let completed_tokens: usize = indices.iter().map(|&i| context.items[i].tokens).sum();
        let needed = context.total_tokens().saturating_sub(target);
        let summary_target = completed_tokens
            .saturating_sub(needed)
            .max(self.config.min_summary_tokens);
        if summary_target >= completed_tokens {
            debug!(
                "Completed history ({} tokens) too small to summarize",
                completed_tokens
            );
            return Outcome::default();
        }

        let text = indices
            .iter()
            .map(|&i| {
                let item = &context.items[i];
                format!("[{}] {}", item.kind.type_name(), item.content_text())
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let summary = match summarizer.summarize(&text, summary_target).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!("Summarization failed, skipping: {}", e);
                return Outcome::default();
            }
        };
        let tokens = self.estimator.estimate(&summary);
        if tokens >= completed_tokens {
            warn!(
                "Summary ({} tokens) is not smaller than its input ({} tokens), discarding",
                tokens, completed_tokens
            );
            return Outcome::default();
        }

        let mut summary_item = Some(ContextItem {
            id: format!("summary:{}", context.items[first].id),
            kind: ItemKind::Summary {
                replaced: indices.len(),
            },
            content: serde_json::Value::String(summary),
            tokens,
            tags: vec![TAG_COMPLETED.to_string()],
            pinned: false,
        });
        let replaced: HashSet<usize> = indices.iter().copied().collect();
        let items = std::mem::take(&mut context.items);
        for (idx, item) in items.into_iter().enumerate() {
            if !replaced.contains(&idx) {
                context.items.push(item);
            } else if let Some(summary) = summary_item.take() {
                context.items.push(summary);
            }
        }

        info!(
            "Summarized {} completed item(s): {} -> {} tokens",
            indices.len(),
            completed_tokens,
            tokens
        );
        Outcome {
            items: indices.len(),
            tokens_saved: completed_tokens - tokens,
        }
    }
}
