//! Window Manager for Context Warden
//!
//! Tracks cumulative token usage against a utilization limit and classifies
//! it into severity zones.

use crate::{Result, WardenError};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Default share of the context window this subsystem may use
pub const DEFAULT_UTILIZATION_FRACTION: f64 = 0.75;

/// Usage severity band, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    Green,
    Yellow,
    Orange,
    Red,
}

impl std::fmt::Display for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Green => write!(f, "green"),
            Self::Yellow => write!(f, "yellow"),
            Self::Orange => write!(f, "orange"),
            Self::Red => write!(f, "red"),
        }
    }
}

/// What the orchestration loop should do at the current usage level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    /// Plenty of room
    Proceed,
    /// Watch usage, nothing to do yet
    Monitor,
    /// Optimize context before adding more
    Optimize,
    /// Checkpoint now
    Checkpoint,
    /// Checkpoint and continue in a fresh invocation
    Handoff,
}

impl std::fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Proceed => write!(f, "proceed"),
            Self::Monitor => write!(f, "monitor"),
            Self::Optimize => write!(f, "optimize"),
            Self::Checkpoint => write!(f, "checkpoint"),
            Self::Handoff => write!(f, "handoff"),
        }
    }
}

/// Zone boundaries as fractions of the utilization limit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneThresholds {
    pub yellow: f64,
    pub orange: f64,
    pub red: f64,
    /// Inside the red zone: past this point a handoff is recommended
    pub handoff: f64,
}

impl Default for ZoneThresholds {
    fn default() -> Self {
        Self {
            yellow: 0.50,
            orange: 0.70,
            red: 0.85,
            handoff: 0.95,
        }
    }
}

impl ZoneThresholds {
    fn validate(&self) -> Result<()> {
        let ordered = 0.0 < self.yellow
            && self.yellow < self.orange
            && self.orange < self.red
            && self.red <= self.handoff;
        if !ordered {
            return Err(WardenError::Config(format!(
                "zone thresholds must be increasing: yellow={} orange={} red={} handoff={}",
                self.yellow, self.orange, self.red, self.handoff
            )));
        }
        Ok(())
    }

    /// Classify a usage fraction (tokens_used / limit)
    pub fn zone_for(&self, fraction: f64) -> Zone {
        if fraction >= self.red {
            Zone::Red
        } else if fraction >= self.orange {
            Zone::Orange
        } else if fraction >= self.yellow {
            Zone::Yellow
        } else {
            Zone::Green
        }
    }
}

/// Usage after an update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageState {
    pub tokens_used: usize,
    pub limit: usize,
    pub zone: Zone,
}

/// Full snapshot of the window manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowStatus {
    pub window_size: usize,
    pub utilization_fraction: f64,
    pub limit: usize,
    pub tokens_used: usize,
    pub remaining: usize,
    pub usage_fraction: f64,
    pub zone: Zone,
    pub recommended_action: RecommendedAction,
}

impl WindowStatus {
    /// Format as a short log-friendly string
    pub fn to_log_string(&self) -> String {
        format!(
            "window: {} / {} tokens ({:.0}% of limit, {} zone, {})",
            self.tokens_used,
            self.limit,
            self.usage_fraction * 100.0,
            self.zone,
            self.recommended_action
        )
    }
}

/// Cumulative usage tracker for one context window
#[derive(Debug, Clone)]
pub struct WindowManager {
    window_size: usize,
    utilization_fraction: f64,
    limit: usize,
    tokens_used: usize,
    thresholds: ZoneThresholds,
}

impl WindowManager {
    /// Create a manager with the default zone thresholds
    pub fn new(window_size: usize, utilization_fraction: f64) -> Result<Self> {
        Self::with_thresholds(window_size, utilization_fraction, ZoneThresholds::default())
    }

    /// Create a manager with custom zone thresholds
    pub fn with_thresholds(
        window_size: usize,
        utilization_fraction: f64,
        thresholds: ZoneThresholds,
    ) -> Result<Self> {
        if !(utilization_fraction > 0.0 && utilization_fraction <= 1.0) {
            return Err(WardenError::Config(format!(
                "utilization fraction must be in (0, 1], got {}",
                utilization_fraction
            )));
        }
        thresholds.validate()?;

        let limit = (window_size as f64 * utilization_fraction).round() as usize;
        Ok(Self {
            window_size,
            utilization_fraction,
            limit,
            tokens_used: 0,
            thresholds,
        })
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn tokens_used(&self) -> usize {
        self.tokens_used
    }

    fn usage_fraction(&self) -> f64 {
        if self.limit == 0 {
            return if self.tokens_used == 0 { 0.0 } else { f64::INFINITY };
        }
        self.tokens_used as f64 / self.limit as f64
    }

    /// Record consumed tokens and return the new usage state
    pub fn add_usage(&mut self, tokens: usize) -> UsageState {
        let before = self.zone();
        self.tokens_used = self.tokens_used.saturating_add(tokens);
        let after = self.zone();

        if after != before {
            if after >= Zone::Orange {
                warn!(
                    "Context usage entered {} zone ({} / {} tokens)",
                    after, self.tokens_used, self.limit
                );
            } else {
                info!(
                    "Context usage entered {} zone ({} / {} tokens)",
                    after, self.tokens_used, self.limit
                );
            }
        }

        self.usage_state()
    }

    /// Current zone, a pure function of tokens_used / limit
    pub fn zone(&self) -> Zone {
        self.thresholds.zone_for(self.usage_fraction())
    }

    pub fn recommended_action(&self) -> RecommendedAction {
        match self.zone() {
            Zone::Green => RecommendedAction::Proceed,
            Zone::Yellow => RecommendedAction::Monitor,
            Zone::Orange => RecommendedAction::Optimize,
            Zone::Red if self.usage_fraction() >= self.thresholds.handoff => {
                RecommendedAction::Handoff
            }
            Zone::Red => RecommendedAction::Checkpoint,
        }
    }

    /// True iff `tokens_used + tokens <= limit`
    pub fn can_accommodate(&self, tokens: usize) -> bool {
        self.tokens_used.saturating_add(tokens) <= self.limit
    }

    /// Zero the usage counter
    pub fn reset(&mut self) {
        self.tokens_used = 0;
    }

    pub fn usage_state(&self) -> UsageState {
        UsageState {
            tokens_used: self.tokens_used,
            limit: self.limit,
            zone: self.zone(),
        }
    }

    pub fn status(&self) -> WindowStatus {
        WindowStatus {
            window_size: self.window_size,
            utilization_fraction: self.utilization_fraction,
            limit: self.limit,
            tokens_used: self.tokens_used,
            remaining: self.limit.saturating_sub(self.tokens_used),
            usage_fraction: self.usage_fraction(),
            zone: self.zone(),
            recommended_action: self.recommended_action(),
        }
    }

    /// Rebuild usage from a checkpoint. Only used by restore and reconfigure.
    pub(crate) fn set_tokens_used(&mut self, tokens: usize) {
        self.tokens_used = tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_is_fraction_of_window() {
        let mgr = WindowManager::new(32_000, 0.75).unwrap();
        assert_eq!(mgr.limit(), 24_000);
        assert_eq!(mgr.zone(), Zone::Green);
    }

    #[test]
    fn test_example_scenario() {
        let mut mgr = WindowManager::new(32_000, 0.75).unwrap();
        mgr.add_usage(5_000);
        mgr.add_usage(7_500);
        assert_eq!(mgr.zone(), Zone::Yellow);

        let state = mgr.add_usage(6_000);
        assert_eq!(state.tokens_used, 18_500);
        assert_eq!(state.zone, Zone::Orange);
        assert!(!mgr.can_accommodate(6_000));
        assert!(mgr.can_accommodate(5_500));
    }

    #[test]
    fn test_zone_monotonic_and_reset() {
        let mut mgr = WindowManager::new(10_000, 1.0).unwrap();
        let mut last = mgr.zone();
        for _ in 0..30 {
            let state = mgr.add_usage(400);
            assert!(state.zone >= last);
            last = state.zone;
        }
        assert_eq!(last, Zone::Red);

        mgr.reset();
        assert_eq!(mgr.zone(), Zone::Green);
        assert_eq!(mgr.tokens_used(), 0);
    }

    #[test]
    fn test_zone_boundaries() {
        let mut mgr = WindowManager::new(1_000, 1.0).unwrap();
        mgr.add_usage(499);
        assert_eq!(mgr.zone(), Zone::Green);
        mgr.add_usage(1);
        assert_eq!(mgr.zone(), Zone::Yellow);
        mgr.add_usage(200);
        assert_eq!(mgr.zone(), Zone::Orange);
        mgr.add_usage(150);
        assert_eq!(mgr.zone(), Zone::Red);
    }

    #[test]
    fn test_recommended_actions() {
        let mut mgr = WindowManager::new(1_000, 1.0).unwrap();
        assert_eq!(mgr.recommended_action(), RecommendedAction::Proceed);
        mgr.add_usage(600);
        assert_eq!(mgr.recommended_action(), RecommendedAction::Monitor);
        mgr.add_usage(150);
        assert_eq!(mgr.recommended_action(), RecommendedAction::Optimize);
        mgr.add_usage(100);
        assert_eq!(mgr.recommended_action(), RecommendedAction::Checkpoint);
        mgr.add_usage(100);
        assert_eq!(mgr.recommended_action(), RecommendedAction::Handoff);
    }

    #[test]
    fn test_invalid_fraction_rejected() {
        assert!(WindowManager::new(8_192, 0.0).is_err());
        assert!(WindowManager::new(8_192, 1.5).is_err());
        assert!(WindowManager::new(8_192, f64::NAN).is_err());
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let thresholds = ZoneThresholds {
            yellow: 0.8,
            orange: 0.7,
            red: 0.9,
            handoff: 0.95,
        };
        assert!(WindowManager::with_thresholds(8_192, 0.75, thresholds).is_err());
    }

    #[test]
    fn test_status_snapshot() {
        let mut mgr = WindowManager::new(20_000, 0.5).unwrap();
        mgr.add_usage(2_500);
        let status = mgr.status();
        assert_eq!(status.limit, 10_000);
        assert_eq!(status.remaining, 7_500);
        assert!((status.usage_fraction - 0.25).abs() < f64::EPSILON);
        assert!(status.to_log_string().contains("green"));
    }
}
