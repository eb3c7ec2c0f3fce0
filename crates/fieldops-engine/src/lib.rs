//! Dispatch engine: dynamic pricing, worker eligibility and the service
//! request lifecycle, all running against an injected [`Repository`].
//!
//! [`Repository`]: fieldops_storage::Repository

use std::path::Path;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

mod eligibility;
mod lifecycle;
mod pricing;

pub use eligibility::{is_eligible, rank_workers, EligibilityResolver};
pub use lifecycle::{
    next_status, LifecycleEvent, LifecycleManager, NewServiceRequest, TransitionExtra, TRANSITIONS,
};
pub use pricing::{PricingContext, PricingEngine, FACTOR_PIPELINE};

pub const CRATE_NAME: &str = "fieldops-engine";

/// Half-open span of local clock hours, `[start_hour, end_hour)`. Wraps past
/// midnight when `end_hour <= start_hour`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl HourWindow {
    pub const fn new(start_hour: u32, end_hour: u32) -> Self {
        Self {
            start_hour,
            end_hour,
        }
    }

    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeOfDayConfig {
    /// Offset applied to request timestamps before reading the local hour.
    pub utc_offset_minutes: i32,
    pub peak_windows: Vec<HourWindow>,
    pub peak_multiplier: f64,
    pub weekend_multiplier: f64,
    pub late_night: HourWindow,
    pub late_night_multiplier: f64,
}

impl Default for TimeOfDayConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 0,
            peak_windows: vec![HourWindow::new(8, 10), HourWindow::new(18, 20)],
            peak_multiplier: 1.2,
            weekend_multiplier: 1.15,
            late_night: HourWindow::new(22, 6),
            late_night_multiplier: 1.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemandConfig {
    pub lookback_minutes: i64,
    /// Strictly more recent requests than this count as high demand.
    pub high_above: u32,
    pub high_multiplier: f64,
    /// At least this many (and not high) counts as moderate demand.
    pub moderate_from: u32,
    pub moderate_multiplier: f64,
}

impl Default for DemandConfig {
    fn default() -> Self {
        Self {
            lookback_minutes: 120,
            high_above: 5,
            high_multiplier: 1.5,
            moderate_from: 3,
            moderate_multiplier: 1.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrgencyConfig {
    pub urgent_multiplier: f64,
    pub emergency_multiplier: f64,
}

impl Default for UrgencyConfig {
    fn default() -> Self {
        Self {
            urgent_multiplier: 1.5,
            emergency_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvailabilityConfig {
    pub scarce_at_most: u32,
    pub scarce_multiplier: f64,
    pub limited_at_most: u32,
    pub limited_multiplier: f64,
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            scarce_at_most: 2,
            scarce_multiplier: 1.3,
            limited_at_most: 5,
            limited_multiplier: 1.1,
        }
    }
}

/// Every tunable of the pricing pipeline. `Default` is the production table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PricingConfig {
    pub time_of_day: TimeOfDayConfig,
    pub demand: DemandConfig,
    pub urgency: UrgencyConfig,
    pub availability: AvailabilityConfig,
}

impl PricingConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text).context("parsing pricing config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Rejects tables that could price below the catalog base.
    pub fn validate(&self) -> Result<()> {
        let multipliers = [
            ("time_of_day.peak_multiplier", self.time_of_day.peak_multiplier),
            ("time_of_day.weekend_multiplier", self.time_of_day.weekend_multiplier),
            ("time_of_day.late_night_multiplier", self.time_of_day.late_night_multiplier),
            ("demand.high_multiplier", self.demand.high_multiplier),
            ("demand.moderate_multiplier", self.demand.moderate_multiplier),
            ("urgency.urgent_multiplier", self.urgency.urgent_multiplier),
            ("urgency.emergency_multiplier", self.urgency.emergency_multiplier),
            ("availability.scarce_multiplier", self.availability.scarce_multiplier),
            ("availability.limited_multiplier", self.availability.limited_multiplier),
        ];
        for (name, value) in multipliers {
            ensure!(value.is_finite() && value >= 1.0, "{name} must be >= 1.0, got {value}");
        }

        let windows = self
            .time_of_day
            .peak_windows
            .iter()
            .chain(std::iter::once(&self.time_of_day.late_night));
        for window in windows {
            ensure!(
                window.start_hour < 24 && window.end_hour <= 24,
                "hour window {}..{} is out of range",
                window.start_hour,
                window.end_hour
            );
        }
        ensure!(
            self.time_of_day.utc_offset_minutes.abs() < 24 * 60,
            "utc_offset_minutes must be within one day"
        );
        ensure!(self.demand.lookback_minutes > 0, "demand.lookback_minutes must be positive");
        ensure!(
            self.demand.moderate_from <= self.demand.high_above,
            "demand.moderate_from must not exceed demand.high_above"
        );
        ensure!(
            self.availability.scarce_at_most <= self.availability.limited_at_most,
            "availability.scarce_at_most must not exceed availability.limited_at_most"
        );
        Ok(())
    }
}
