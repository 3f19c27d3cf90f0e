//! Context window sizing and usage tracking.

mod detector;
mod manager;

pub use detector::{
    Detection, DetectionConfig, DetectionSource, HttpIntrospector, KnownWindow,
    ModelIntrospector, WindowDetector, DEFAULT_DETECTION_TIMEOUT, DEFAULT_WINDOW_TOKENS,
};
pub use manager::{
    RecommendedAction, UsageState, WindowManager, WindowStatus, Zone, ZoneThresholds,
    DEFAULT_UTILIZATION_FRACTION,
};
