//! Memory Manager for Context Warden
//!
//! Owns the working memory, usage tracker and active profile of one session
//! and coordinates them: recording operations, building context payloads
//! under the window limit, and checkpoint/restore.
//!
//! All mutable state sits behind one `RwLock`. Checkpoint file I/O happens
//! outside it, serialized by a separate mutex.

use super::checkpoint::Checkpoint;
use super::operation::Operation;
use super::working::{WorkingMemory, WorkingMemoryStatus};
use crate::config::WardenConfig;
use crate::optimizer::{
    Context, ContextItem, ContextOptimizer, ContentStore, FsContentStore, OptimizationResult,
    Summarizer,
};
use crate::profile::{built_in_profiles, AdaptiveOptimizer, CheckpointInterval, WindowProfile};
use crate::window::{UsageState, WindowDetector, WindowManager, WindowStatus};
use crate::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// The model whose window is being managed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: String,
    pub model_id: String,
}

impl ModelConfig {
    pub fn new(provider: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model_id: model_id.into(),
        }
    }
}

/// A context payload ready for the next model call
#[derive(Debug, Clone)]
pub struct BuiltContext {
    pub context: Context,
    /// Total tokens of `context`
    pub tokens: usize,
    /// Tokens the payload adds on top of recorded usage
    pub extra_tokens: usize,
    /// The payload does not fit the limit, even after optimization
    pub capacity_exceeded: bool,
    /// Present when the optimizer ran
    pub optimization: Option<OptimizationResult>,
    pub usage: UsageState,
}

/// Snapshot of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStatus {
    pub profile: String,
    pub window: WindowStatus,
    pub memory: WorkingMemoryStatus,
    pub checkpoint_interval: CheckpointInterval,
    pub operations_since_checkpoint: u64,
    pub should_checkpoint: bool,
    pub last_checkpoint_id: Option<String>,
}

impl ManagerStatus {
    /// Format as a short log-friendly string
    pub fn to_log_string(&self) -> String {
        format!(
            "[{}] {} | memory: {}/{} ops, {}/{} tokens | checkpoint {}{}",
            self.profile,
            self.window.to_log_string(),
            self.memory.count,
            self.memory.capacity,
            self.memory.tokens,
            self.memory.token_budget,
            self.checkpoint_interval,
            if self.should_checkpoint { " (due)" } else { "" }
        )
    }
}

struct MemoryState {
    memory: WorkingMemory,
    window: WindowManager,
    selector: AdaptiveOptimizer,
    ops_since_checkpoint: u64,
    last_checkpoint: Instant,
    last_checkpoint_id: Option<String>,
}

impl MemoryState {
    fn should_checkpoint(&self) -> bool {
        self.selector
            .checkpoint_config()
            .interval
            .is_due(self.ops_since_checkpoint, self.last_checkpoint.elapsed())
    }

    fn reset_checkpoint_counters(&mut self) {
        self.ops_since_checkpoint = 0;
        self.last_checkpoint = Instant::now();
    }
}

fn build_selector(window_size: usize, config: &WardenConfig) -> Result<AdaptiveOptimizer> {
    let table = config.profiles.clone().unwrap_or_else(built_in_profiles);
    AdaptiveOptimizer::new(
        window_size,
        table,
        config.profile_override.as_deref(),
        Some(&config.thresholds),
    )
}

/// Context budgeting for one orchestration session
pub struct MemoryManager {
    state: RwLock<MemoryState>,
    checkpoint_lock: Mutex<()>,
    optimizer: ContextOptimizer,
    config: WardenConfig,
    checkpoint_path: Option<PathBuf>,
}

impl MemoryManager {
    /// Detect the model's window (unless configured) and set up a session
    pub async fn new(
        model: &ModelConfig,
        summarizer: Option<Arc<dyn Summarizer>>,
        config: WardenConfig,
        checkpoint_path: Option<PathBuf>,
    ) -> Result<Self> {
        let window_size = match config.window_size {
            Some(size) => size,
            None => {
                let detector = WindowDetector::new(config.detection.clone());
                detector
                    .detect(&model.provider, &model.model_id, config.detection.timeout())
                    .await
            }
        };
        Self::from_window_size(window_size, summarizer, config, checkpoint_path)
    }

    /// Set up a session for a known window size
    pub fn from_window_size(
        window_size: usize,
        summarizer: Option<Arc<dyn Summarizer>>,
        config: WardenConfig,
        checkpoint_path: Option<PathBuf>,
    ) -> Result<Self> {
        let selector = build_selector(window_size, &config)?;
        let window =
            WindowManager::with_thresholds(window_size, config.utilization_fraction, config.zones)?;
        let wm = selector.working_memory_config();
        let memory = WorkingMemory::new(wm.capacity, wm.token_budget);

        let mut optimizer = ContextOptimizer::new(config.optimizer.clone());
        if let Some(summarizer) = summarizer {
            optimizer = optimizer.with_summarizer(summarizer);
        }
        if let Some(dir) = &config.artifact_store_dir {
            optimizer = optimizer.with_store(Arc::new(FsContentStore::new(dir.clone())));
        }

        info!(
            "Memory manager ready: {} token window, limit {}, profile '{}'",
            window_size,
            window.limit(),
            selector.profile().name
        );

        let checkpoint_path = checkpoint_path.or_else(|| config.checkpoint_path.clone());
        Ok(Self {
            state: RwLock::new(MemoryState {
                memory,
                window,
                selector,
                ops_since_checkpoint: 0,
                last_checkpoint: Instant::now(),
                last_checkpoint_id: None,
            }),
            checkpoint_lock: Mutex::new(()),
            optimizer,
            config,
            checkpoint_path,
        })
    }

    /// Use `store` for the optimizer's external-storage technique
    pub fn with_content_store(mut self, store: Arc<dyn ContentStore>) -> Self {
        self.optimizer.set_store(store);
        self
    }

    pub fn checkpoint_path(&self) -> Option<&Path> {
        self.checkpoint_path.as_deref()
    }

    /// Record an operation: store it and count its cost as used
    pub async fn add_operation(&self, op: Operation) -> UsageState {
        let mut state = self.state.write().await;
        let cost = op.token_cost;
        state.memory.add_operation(op);
        state.ops_since_checkpoint += 1;
        state.window.add_usage(cost)
    }

    /// Merge `base` with working memory into a payload for the next call.
    ///
    /// Working-memory tokens are already counted as used, so only the rest
    /// must fit. When it does not and `optimize` is set, the optimizer is
    /// asked for the shortfall and the result is checked once more. A payload
    /// that still does not fit comes back flagged, not as an error.
    pub async fn build_context(&self, base: Context, optimize: bool) -> BuiltContext {
        let (merged, memory_tokens, remaining, selector) = {
            let state = self.state.read().await;
            let mut merged = base;
            merged
                .items
                .extend(state.memory.iter().map(ContextItem::from_operation));
            let remaining = state.window.limit().saturating_sub(state.window.tokens_used());
            (
                merged,
                state.memory.tokens(),
                remaining,
                state.selector.clone(),
            )
        };

        let merged_tokens = merged.total_tokens();
        let extra = merged_tokens.saturating_sub(memory_tokens);
        if extra <= remaining {
            let usage = self.state.read().await.window.usage_state();
            return BuiltContext {
                context: merged,
                tokens: merged_tokens,
                extra_tokens: extra,
                capacity_exceeded: false,
                optimization: None,
                usage,
            };
        }

        let shortfall = extra - remaining;
        if !optimize {
            warn!(
                "Context needs {} more tokens than remain ({} left)",
                shortfall, remaining
            );
            let usage = self.state.read().await.window.usage_state();
            return BuiltContext {
                context: merged,
                tokens: merged_tokens,
                extra_tokens: extra,
                capacity_exceeded: true,
                optimization: None,
                usage,
            };
        }

        let fraction = shortfall as f64 / merged_tokens as f64;
        debug!(
            "Optimizing context: {} tokens, shortfall {} ({:.1}%)",
            merged_tokens,
            shortfall,
            fraction * 100.0
        );
        let should_optimize =
            move |tokens: usize, item_type: &str| selector.should_optimize(tokens, item_type);
        let (context, result) = self
            .optimizer
            .optimize_with(merged, fraction, &should_optimize)
            .await;

        let tokens = context.total_tokens();
        let extra = tokens.saturating_sub(memory_tokens);
        let state = self.state.read().await;
        let capacity_exceeded = !state.window.can_accommodate(extra);
        if capacity_exceeded {
            warn!(
                "Context still over budget after optimization ({} extra tokens, {} left)",
                extra,
                state.window.limit().saturating_sub(state.window.tokens_used())
            );
        }

        BuiltContext {
            context,
            tokens,
            extra_tokens: extra,
            capacity_exceeded,
            optimization: Some(result),
            usage: state.window.usage_state(),
        }
    }

    /// Write a checkpoint to `path` (or the configured path) and return its id
    pub async fn checkpoint(&self, path: Option<&Path>) -> Result<String> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| self.checkpoint_path.clone())
            .ok_or_else(|| WardenError::Config("no checkpoint path configured".to_string()))?;

        let _guard = self.checkpoint_lock.lock().await;
        let (checkpoint, ops_copied) = {
            let state = self.state.read().await;
            (
                Checkpoint::new(
                    state.window.window_size(),
                    state.selector.profile().name.clone(),
                    state.window.usage_state(),
                    state.memory.iter().cloned().collect(),
                ),
                state.ops_since_checkpoint,
            )
        };

        let id = checkpoint.save(&path).await?;

        let mut state = self.state.write().await;
        // Operations recorded while writing are not in this checkpoint
        state.ops_since_checkpoint = state.ops_since_checkpoint.saturating_sub(ops_copied);
        state.last_checkpoint = Instant::now();
        state.last_checkpoint_id = Some(id.clone());
        Ok(id)
    }

    /// Replace the session state with the checkpoint at `path`.
    ///
    /// Operations are replayed under the current profile's bounds. On any
    /// error the current state is left untouched.
    pub async fn restore(&self, path: &Path) -> Result<()> {
        let _guard = self.checkpoint_lock.lock().await;
        let (checkpoint, id) = Checkpoint::load_with_id(path).await?;

        let mut state = self.state.write().await;
        if !state.selector.knows_profile(&checkpoint.active_profile_name) {
            return Err(WardenError::RestoreValidation(format!(
                "checkpoint profile '{}' is not in the profile table",
                checkpoint.active_profile_name
            )));
        }
        let active = &state.selector.profile().name;
        if &checkpoint.active_profile_name != active {
            warn!(
                "Checkpoint was taken under profile '{}', restoring under '{}'",
                checkpoint.active_profile_name, active
            );
        }
        if checkpoint.window_size != state.window.window_size() {
            warn!(
                "Checkpoint window {} differs from current window {}",
                checkpoint.window_size,
                state.window.window_size()
            );
        }

        let wm = state.selector.working_memory_config();
        let mut memory = WorkingMemory::new(wm.capacity, wm.token_budget);
        let total = checkpoint.operations.len();
        for op in checkpoint.operations {
            memory.add_operation(op);
        }
        if memory.len() < total {
            debug!(
                "{} checkpointed operation(s) did not fit the current bounds",
                total - memory.len()
            );
        }

        state.memory = memory;
        state
            .window
            .set_tokens_used(checkpoint.usage_state.tokens_used);
        state.reset_checkpoint_counters();
        state.last_checkpoint_id = Some(id.clone());

        info!(
            "Restored checkpoint {} ({} operations, {} tokens used)",
            id,
            state.memory.len(),
            state.window.tokens_used()
        );
        Ok(())
    }

    /// True once the active profile's checkpoint interval has elapsed
    pub async fn should_checkpoint(&self) -> bool {
        self.state.read().await.should_checkpoint()
    }

    /// Empty working memory and reset usage and checkpoint counters
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.memory.clear();
        state.window.reset();
        state.reset_checkpoint_counters();
        info!("Memory manager cleared");
    }

    pub async fn status(&self) -> ManagerStatus {
        let state = self.state.read().await;
        ManagerStatus {
            profile: state.selector.profile().name.clone(),
            window: state.window.status(),
            memory: state.memory.status(),
            checkpoint_interval: state.selector.checkpoint_config().interval,
            operations_since_checkpoint: state.ops_since_checkpoint,
            should_checkpoint: state.should_checkpoint(),
            last_checkpoint_id: state.last_checkpoint_id.clone(),
        }
    }

    /// Switch to a new window size, keeping recorded usage
    pub async fn reconfigure(&self, window_size: usize) -> Result<()> {
        let selector = build_selector(window_size, &self.config)?;
        let mut window = WindowManager::with_thresholds(
            window_size,
            self.config.utilization_fraction,
            self.config.zones,
        )?;
        let wm = selector.working_memory_config();

        let mut state = self.state.write().await;
        window.set_tokens_used(state.window.tokens_used());
        let evicted = state.memory.resize(wm.capacity, wm.token_budget);
        info!(
            "Reconfigured for {} token window: profile '{}' ({} operation(s) evicted)",
            window_size,
            selector.profile().name,
            evicted.len()
        );
        state.window = window;
        state.selector = selector;
        Ok(())
    }

    pub async fn profile(&self) -> WindowProfile {
        self.state.read().await.selector.profile().clone()
    }

    pub async fn usage(&self) -> UsageState {
        self.state.read().await.window.usage_state()
    }

    /// The last `limit` operations (all when `None`), oldest first
    pub async fn recent(&self, limit: Option<usize>) -> Vec<Operation> {
        self.state.read().await.memory.get_recent(limit)
    }

    pub async fn by_kind(&self, kind: &str, limit: usize) -> Vec<Operation> {
        self.state.read().await.memory.get_by_kind(kind, limit)
    }

    pub async fn search(&self, query: &str, max_results: usize) -> Vec<Operation> {
        self.state.read().await.memory.search(query, max_results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::operation::TAG_TRANSIENT;
    use crate::window::Zone;
    use serde_json::json;
    use tempfile::TempDir;

    fn manager(window_size: usize) -> MemoryManager {
        MemoryManager::from_window_size(window_size, None, WardenConfig::default(), None).unwrap()
    }

    fn op(kind: &str, tokens: usize) -> Operation {
        Operation::new(kind, json!(format!("{} output", kind)), tokens)
    }

    #[tokio::test]
    async fn test_profile_and_bounds_follow_window() {
        let mgr = manager(32_000);
        let status = mgr.status().await;
        assert_eq!(status.profile, "aggressive");
        assert_eq!(status.window.limit, 24_000);
        assert_eq!(status.memory.capacity, 20);
        assert_eq!(status.memory.token_budget, 4_800);
    }

    #[tokio::test]
    async fn test_usage_is_cumulative_across_evictions() {
        let mgr = manager(32_000);
        mgr.add_operation(op("task_start", 5_000)).await;
        let usage = mgr.add_operation(op("agent_response", 7_500)).await;
        assert_eq!(usage.zone, Zone::Yellow);

        let usage = mgr.add_operation(op("agent_response", 6_000)).await;
        assert_eq!(usage.tokens_used, 18_500);
        assert_eq!(usage.zone, Zone::Orange);

        // Each of these exceeds the 4800-token memory budget
        assert!(mgr.recent(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_build_context_within_budget() {
        let mgr = manager(32_000);
        mgr.add_operation(op("task_start", 300)).await;
        mgr.add_operation(op("decision", 200)).await;

        let base = Context::from_items(vec![ContextItem::text("sys", "system", 1_000).pinned()]);
        let built = mgr.build_context(base, true).await;
        assert!(!built.capacity_exceeded);
        assert!(built.optimization.is_none());
        assert_eq!(built.tokens, 1_500);
        assert_eq!(built.extra_tokens, 1_000);
        assert_eq!(built.context.len(), 3);
        assert_eq!(built.context.items[0].id, "sys");
        // Building does not consume budget
        assert_eq!(built.usage.tokens_used, 500);
    }

    #[tokio::test]
    async fn test_build_context_over_budget_without_optimization() {
        let mgr = manager(8_192);
        let base = Context::from_items(vec![ContextItem::text("doc", "design notes", 7_000)]);
        let built = mgr.build_context(base, false).await;
        assert!(built.capacity_exceeded);
        assert!(built.optimization.is_none());
        assert_eq!(built.tokens, 7_000);
    }

    #[tokio::test]
    async fn test_build_context_optimizes_shortfall() {
        let mgr = manager(8_192);
        let base = Context::from_items(vec![
            ContextItem::text("sys", "system", 3_000).pinned(),
            ContextItem::text("trace", "debug trace", 4_000).with_tag(TAG_TRANSIENT),
        ]);
        let built = mgr.build_context(base, true).await;
        assert!(!built.capacity_exceeded);
        assert_eq!(built.tokens, 3_000);
        let result = built.optimization.unwrap();
        assert!(result.target_met);
    }

    #[tokio::test]
    async fn test_build_context_still_over_after_optimization() {
        let mgr = manager(8_192);
        let base = Context::from_items(vec![ContextItem::text("sys", "system", 9_000).pinned()]);
        let built = mgr.build_context(base, true).await;
        assert!(built.capacity_exceeded);
        assert!(built.optimization.unwrap().techniques_applied.is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_and_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");

        let mgr = manager(32_000);
        for i in 0..5 {
            mgr.add_operation(Operation::new("step", json!(format!("step {}", i)), 100 + i))
                .await;
        }
        let id = mgr.checkpoint(Some(&path)).await.unwrap();
        assert_eq!(mgr.status().await.last_checkpoint_id.as_deref(), Some(id.as_str()));

        let restored = manager(32_000);
        restored.restore(&path).await.unwrap();
        assert_eq!(restored.recent(None).await, mgr.recent(None).await);
        assert_eq!(restored.usage().await, mgr.usage().await);
    }

    #[tokio::test]
    async fn test_restore_unknown_profile_leaves_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");
        let mut checkpoint = Checkpoint::new(
            32_000,
            "turbo",
            UsageState {
                tokens_used: 10,
                limit: 24_000,
                zone: Zone::Green,
            },
            Vec::new(),
        );
        checkpoint.save(&path).await.unwrap();

        let mgr = manager(32_000);
        mgr.add_operation(op("task_start", 50)).await;
        let err = mgr.restore(&path).await.unwrap_err();
        assert!(matches!(err, WardenError::RestoreValidation(_)));
        assert_eq!(mgr.recent(None).await.len(), 1);
        assert_eq!(mgr.usage().await.tokens_used, 50);

        // A known but different profile restores with a warning
        checkpoint.active_profile_name = "balanced".to_string();
        checkpoint.save(&path).await.unwrap();
        mgr.restore(&path).await.unwrap();
        assert!(mgr.recent(None).await.is_empty());
        assert_eq!(mgr.usage().await.tokens_used, 10);
    }

    #[tokio::test]
    async fn test_checkpoint_requires_a_path() {
        let mgr = manager(32_000);
        let err = mgr.checkpoint(None).await.unwrap_err();
        assert!(matches!(err, WardenError::Config(_)));

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("default.json");
        let mgr = MemoryManager::from_window_size(
            32_000,
            None,
            WardenConfig::default().with_checkpoint_path(path.clone()),
            None,
        )
        .unwrap();
        mgr.checkpoint(None).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_should_checkpoint_by_operation_count() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(32_000);
        for _ in 0..9 {
            mgr.add_operation(op("step", 10)).await;
        }
        assert!(!mgr.should_checkpoint().await);
        mgr.add_operation(op("step", 10)).await;
        assert!(mgr.should_checkpoint().await);

        mgr.checkpoint(Some(&dir.path().join("c.json"))).await.unwrap();
        assert!(!mgr.should_checkpoint().await);
        assert_eq!(mgr.status().await.operations_since_checkpoint, 0);
    }

    #[tokio::test]
    async fn test_clear_resets_everything() {
        let mgr = manager(32_000);
        for _ in 0..12 {
            mgr.add_operation(op("step", 1_000)).await;
        }
        mgr.clear().await;
        let status = mgr.status().await;
        assert_eq!(status.memory.count, 0);
        assert_eq!(status.window.tokens_used, 0);
        assert_eq!(status.window.zone, Zone::Green);
        assert!(!status.should_checkpoint);
    }

    #[tokio::test]
    async fn test_reconfigure_keeps_usage() {
        let mgr = manager(200_000);
        for _ in 0..30 {
            mgr.add_operation(op("step", 100)).await;
        }
        assert_eq!(mgr.profile().await.name, "relaxed");

        mgr.reconfigure(8_192).await.unwrap();
        let status = mgr.status().await;
        assert_eq!(status.profile, "ultra-aggressive");
        assert_eq!(status.window.tokens_used, 3_000);
        assert_eq!(status.memory.count, 8);
    }

    #[tokio::test]
    async fn test_new_skips_detection_with_configured_window() {
        let model = ModelConfig::new("unknown", "mystery-model");
        let config = WardenConfig::default().with_window_size(128_000);
        let mgr = MemoryManager::new(&model, None, config, None).await.unwrap();
        assert_eq!(mgr.status().await.window.window_size, 128_000);

        // Known-table lookup, no endpoint configured for the provider
        let model = ModelConfig::new("openai", "gpt-4o-mini");
        let mgr = MemoryManager::new(&model, None, WardenConfig::default(), None)
            .await
            .unwrap();
        assert_eq!(mgr.profile().await.name, "balanced");
    }

    #[tokio::test]
    async fn test_unknown_profile_override_fails() {
        let config = WardenConfig::default().with_profile_override("turbo");
        assert!(matches!(
            MemoryManager::from_window_size(32_000, None, config, None),
            Err(WardenError::UnknownProfile(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checkpoints_and_operations() {
        let temp_dir = TempDir::new().unwrap();
        let mgr = std::sync::Arc::new(manager(128_000));
        for i in 0..3 {
            mgr.add_operation(op(&format!("setup_{}", i), 10)).await;
        }

        let mut writers = Vec::new();
        for i in 0..6 {
            let mgr = mgr.clone();
            let path = temp_dir.path().join(format!("checkpoint-{}.json", i));
            writers.push(tokio::spawn(async move {
                let id = mgr.checkpoint(Some(&path)).await.unwrap();
                (path, id)
            }));
        }
        let mut adders = Vec::new();
        for i in 0..20 {
            let mgr = mgr.clone();
            adders.push(tokio::spawn(async move {
                mgr.add_operation(op(&format!("step_{}", i), 10)).await;
            }));
        }
        for adder in adders {
            adder.await.unwrap();
        }
        let mut written = Vec::new();
        for writer in writers {
            written.push(writer.await.unwrap());
        }

        for (path, id) in &written {
            let (checkpoint, file_id) = Checkpoint::load_with_id(path).await.unwrap();
            assert_eq!(&file_id, id);
            assert!(checkpoint.operations.len() >= 3);
        }

        // Whatever the interleaving, the counter holds exactly the
        // operations the latest checkpoint did not capture
        let status = mgr.status().await;
        let last_id = status.last_checkpoint_id.clone().unwrap();
        let (last_path, _) = written.iter().find(|(_, id)| *id == last_id).unwrap();
        let last = Checkpoint::load(last_path).await.unwrap();
        assert_eq!(status.memory.count, 23);
        assert_eq!(
            status.operations_since_checkpoint,
            (23 - last.operations.len()) as u64
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_add_operation_not_blocked_by_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("checkpoint.json");
        let mgr = std::sync::Arc::new(manager(128_000));
        mgr.add_operation(op("task_start", 10)).await;

        // Stand in for a write in progress
        let in_flight = mgr.checkpoint_lock.lock().await;
        let pending = {
            let mgr = mgr.clone();
            let path = path.clone();
            tokio::spawn(async move { mgr.checkpoint(Some(&path)).await })
        };

        let added = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            mgr.add_operation(op("agent_response", 10)).await;
            mgr.add_operation(op("decision", 10)).await;
        })
        .await;
        assert!(added.is_ok());
        assert!(!pending.is_finished());

        drop(in_flight);
        pending.await.unwrap().unwrap();
        let status = mgr.status().await;
        assert_eq!(status.operations_since_checkpoint, 0);
        assert_eq!(Checkpoint::load(&path).await.unwrap().operations.len(), 3);

        mgr.add_operation(op("error", 10)).await;
        assert_eq!(mgr.status().await.operations_since_checkpoint, 1);
    }
}
