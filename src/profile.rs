//! Window profiles and adaptive selection
//!
//! A profile bundles the thresholds that depend on how large the model's
//! context window is. Profiles live in a table sorted by window range;
//! selection is a lookup, overrides are applied field by field.

use crate::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, warn};

/// Half-open token range `[min, max)`; `max = None` is unbounded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRange {
    pub min: usize,
    #[serde(default)]
    pub max: Option<usize>,
}

impl WindowRange {
    pub const fn new(min: usize, max: Option<usize>) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, tokens: usize) -> bool {
        tokens >= self.min && self.max.map_or(true, |max| tokens < max)
    }
}

/// How often the caller should checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointInterval {
    /// After this many recorded operations
    Operations(u64),
    /// After this many seconds
    Seconds(u64),
}

impl CheckpointInterval {
    /// True once the interval has elapsed
    pub fn is_due(&self, operations: u64, elapsed: Duration) -> bool {
        match *self {
            Self::Operations(n) => operations >= n.max(1),
            Self::Seconds(secs) => elapsed >= Duration::from_secs(secs),
        }
    }
}

impl std::fmt::Display for CheckpointInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Operations(n) => write!(f, "every {} ops", n),
            Self::Seconds(secs) => write!(f, "every {}s", secs),
        }
    }
}

/// Named bundle of window-dependent thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowProfile {
    pub name: String,
    pub window_range: WindowRange,
    pub working_memory_capacity: usize,
    pub working_memory_token_budget_fraction: f64,
    pub checkpoint_interval: CheckpointInterval,
    pub per_item_optimize_threshold_tokens: usize,
}

impl WindowProfile {
    fn new(
        name: &str,
        window_range: WindowRange,
        capacity: usize,
        budget_fraction: f64,
        checkpoint_interval: CheckpointInterval,
        item_threshold: usize,
    ) -> Self {
        Self {
            name: name.to_string(),
            window_range,
            working_memory_capacity: capacity,
            working_memory_token_budget_fraction: budget_fraction,
            checkpoint_interval,
            per_item_optimize_threshold_tokens: item_threshold,
        }
    }
}

/// The five built-in profiles, smallest windows first
pub fn built_in_profiles() -> Vec<WindowProfile> {
    use CheckpointInterval::{Operations, Seconds};
    vec![
        WindowProfile::new(
            "ultra-aggressive",
            WindowRange::new(0, Some(16_384)),
            10,
            0.10,
            Operations(5),
            500,
        ),
        WindowProfile::new(
            "aggressive",
            WindowRange::new(16_384, Some(65_536)),
            20,
            0.15,
            Operations(10),
            1_000,
        ),
        WindowProfile::new(
            "balanced",
            WindowRange::new(65_536, Some(150_000)),
            50,
            0.20,
            Operations(20),
            2_000,
        ),
        WindowProfile::new(
            "relaxed",
            WindowRange::new(150_000, Some(500_000)),
            100,
            0.25,
            Operations(50),
            5_000,
        ),
        WindowProfile::new(
            "minimal",
            WindowRange::new(500_000, None),
            200,
            0.30,
            Seconds(30 * 60),
            10_000,
        ),
    ]
}

/// Per-field overrides applied on top of the selected profile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileOverrides {
    pub working_memory_capacity: Option<usize>,
    pub working_memory_token_budget_fraction: Option<f64>,
    pub checkpoint_interval: Option<CheckpointInterval>,
    pub per_item_optimize_threshold_tokens: Option<usize>,
}

impl ProfileOverrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn apply(&self, profile: &mut WindowProfile) {
        if let Some(capacity) = self.working_memory_capacity {
            profile.working_memory_capacity = capacity;
        }
        if let Some(fraction) = self.working_memory_token_budget_fraction {
            profile.working_memory_token_budget_fraction = fraction;
        }
        if let Some(interval) = self.checkpoint_interval {
            profile.checkpoint_interval = interval;
        }
        if let Some(threshold) = self.per_item_optimize_threshold_tokens {
            profile.per_item_optimize_threshold_tokens = threshold;
        }
    }
}

/// Working memory bounds derived from the active profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingMemoryConfig {
    pub capacity: usize,
    pub token_budget: usize,
}

/// Checkpoint cadence derived from the active profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub interval: CheckpointInterval,
}

/// Selects and holds the active profile for one window size
#[derive(Debug, Clone)]
pub struct AdaptiveOptimizer {
    window_size: usize,
    table: Vec<WindowProfile>,
    active: WindowProfile,
}

impl AdaptiveOptimizer {
    pub fn new(
        window_size: usize,
        profile_table: Vec<WindowProfile>,
        manual_override: Option<&str>,
        custom_thresholds: Option<&ProfileOverrides>,
    ) -> Result<Self> {
        validate_table(&profile_table)?;

        let mut active = match manual_override {
            Some(name) => {
                let profile = profile_table
                    .iter()
                    .find(|p| p.name == name)
                    .ok_or_else(|| WardenError::UnknownProfile(name.to_string()))?;
                info!(
                    "Using manually selected profile '{}' for {} token window",
                    profile.name, window_size
                );
                profile.clone()
            }
            None => select(&profile_table, window_size).clone(),
        };

        if let Some(overrides) = custom_thresholds.filter(|o| !o.is_empty()) {
            overrides.apply(&mut active);
            validate_profile(&active)?;
            info!("Applied threshold overrides to profile '{}'", active.name);
        }

        info!(
            "Active profile '{}': capacity={}, budget={:.0}%, checkpoint {}, item threshold={}",
            active.name,
            active.working_memory_capacity,
            active.working_memory_token_budget_fraction * 100.0,
            active.checkpoint_interval,
            active.per_item_optimize_threshold_tokens
        );

        Ok(Self {
            window_size,
            table: profile_table,
            active,
        })
    }

    /// Select from the built-in table with no overrides
    pub fn with_built_ins(window_size: usize) -> Result<Self> {
        Self::new(window_size, built_in_profiles(), None, None)
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn profile(&self) -> &WindowProfile {
        &self.active
    }

    pub fn table(&self) -> &[WindowProfile] {
        &self.table
    }

    /// Whether `name` is a profile in the configured table
    pub fn knows_profile(&self, name: &str) -> bool {
        self.table.iter().any(|p| p.name == name)
    }

    /// True when an item is large enough for the optimizer to rewrite
    pub fn should_optimize(&self, item_tokens: usize, _item_type: &str) -> bool {
        item_tokens >= self.active.per_item_optimize_threshold_tokens
    }

    pub fn working_memory_config(&self) -> WorkingMemoryConfig {
        let budget =
            self.window_size as f64 * self.active.working_memory_token_budget_fraction;
        WorkingMemoryConfig {
            capacity: self.active.working_memory_capacity,
            token_budget: budget.round() as usize,
        }
    }

    pub fn checkpoint_config(&self) -> CheckpointConfig {
        CheckpointConfig {
            interval: self.active.checkpoint_interval,
        }
    }
}

/// First profile whose range contains `window_size`.
///
/// A window in a gap between two ranges gets the profile just below it; one
/// below the whole table gets the first profile.
pub fn select(table: &[WindowProfile], window_size: usize) -> &WindowProfile {
    if let Some(profile) = table.iter().find(|p| p.window_range.contains(window_size)) {
        return profile;
    }

    // validate_table guarantees a non-empty table sorted by range
    let nearest = table
        .iter()
        .rev()
        .find(|p| p.window_range.min <= window_size)
        .unwrap_or(&table[0]);
    warn!(
        "No profile covers a {} token window, using '{}'",
        window_size, nearest.name
    );
    nearest
}

fn validate_profile(profile: &WindowProfile) -> Result<()> {
    if profile.working_memory_capacity == 0 {
        return Err(WardenError::Config(format!(
            "profile '{}' has zero working memory capacity",
            profile.name
        )));
    }
    let fraction = profile.working_memory_token_budget_fraction;
    if !(fraction > 0.0 && fraction <= 1.0) {
        return Err(WardenError::Config(format!(
            "profile '{}' token budget fraction must be in (0, 1], got {}",
            profile.name, fraction
        )));
    }
    if let Some(max) = profile.window_range.max {
        if max <= profile.window_range.min {
            return Err(WardenError::Config(format!(
                "profile '{}' has an empty window range",
                profile.name
            )));
        }
    }
    Ok(())
}

fn validate_table(table: &[WindowProfile]) -> Result<()> {
    if table.is_empty() {
        return Err(WardenError::Config("profile table is empty".to_string()));
    }

    for profile in table {
        validate_profile(profile)?;
    }

    let mut names = HashSet::new();
    for profile in table {
        if !names.insert(profile.name.as_str()) {
            return Err(WardenError::Config(format!(
                "duplicate profile name '{}'",
                profile.name
            )));
        }
    }

    for pair in table.windows(2) {
        let (lower, upper) = (&pair[0], &pair[1]);
        match lower.window_range.max {
            Some(max) if max <= upper.window_range.min => {}
            _ => {
                return Err(WardenError::Config(format!(
                    "profiles '{}' and '{}' overlap or are out of order",
                    lower.name, upper.name
                )));
            }
        }
    }

    Ok(())
}
