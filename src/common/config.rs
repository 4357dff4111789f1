//! Scenario configuration loading and validation.
//!
//! A scenario is described by a TOML file with one table per concern. Every
//! table and every key is optional; missing values fall back to the defaults
//! of the reference urban scenario (a 1.6 km x 1.9 km map, 25 km/h inside the
//! central area and 75 km/h outside of it, 100 ms beacons).

use embassy_time::Duration;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use super::geometry::{AreaPartition, Point, RectPos};
use crate::pool::SlotSelection;

/// Error type for configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(String),
    #[error("Failed to parse config file: {0}")]
    Parse(String),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Geometry of the simulated area.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AreaConfig {
    /// Boundary of the mobility map, in world coordinates.
    pub boundary: RectPos,
    /// Size of the inner area relative to the boundary, per axis.
    /// Ignored when `inner` is set.
    pub inner_fraction: f64,
    /// Explicit inner area; overrides `inner_fraction`.
    pub inner: Option<RectPos>,
}

impl Default for AreaConfig {
    fn default() -> Self {
        Self {
            boundary: RectPos::new(Point::new(0.0, 0.0), Point::new(1629.91, 1948.73)),
            inner_fraction: 0.5,
            inner: None,
        }
    }
}

impl AreaConfig {
    pub fn partition(&self) -> AreaPartition {
        match self.inner {
            Some(inner) => AreaPartition::new(self.boundary, inner),
            None => AreaPartition::centered(self.boundary, self.inner_fraction),
        }
    }
}

/// Speed limits carried by advisories.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AdvisorConfig {
    /// Send advisories on zone crossings. Crossings are still tracked when off.
    pub enabled: bool,
    pub inner_speed_limit_kmh: f64,
    pub outer_speed_limit_kmh: f64,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            inner_speed_limit_kmh: 25.0,
            outer_speed_limit_kmh: 75.0,
        }
    }
}

/// Beacon generation on the vehicles.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BeaconConfig {
    /// Vehicles beacon at all. Without beacons the server never hears from
    /// anyone, so this switches the whole application off.
    pub enabled: bool,
    /// Inter-beacon interval (ms).
    pub interval_ms: u64,
    /// Per-slot offset (ms) of the first beacon, wrapped into one interval.
    pub phase_step_ms: u64,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 100,
            phase_step_ms: 7,
        }
    }
}

impl BeaconConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Deterministic offset of the first beacon for a slot.
    pub fn phase_for_slot(&self, slot: usize) -> Duration {
        if self.interval_ms == 0 {
            return Duration::from_millis(0);
        }
        Duration::from_millis((slot as u64).wrapping_mul(self.phase_step_ms) % self.interval_ms)
    }
}

/// Reception ratio / latency supervision.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SupervisorConfig {
    pub enabled: bool,
    /// Expected upper bound (ms) for a message to reach its destination.
    pub baseline_ms: f64,
    /// Instances still pending after `baseline_ms * timeout_multiplier` are lost.
    pub timeout_multiplier: f64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            baseline_ms: 150.0,
            timeout_multiplier: 1.0,
        }
    }
}

impl SupervisorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_micros((self.baseline_ms * self.timeout_multiplier * 1000.0).round() as u64)
    }
}

/// Reference lossy channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ChannelConfig {
    /// Probability in [0, 1] that a payload is lost.
    pub loss_probability: f64,
    /// Mean one-way delay (ms).
    pub delay_mean_ms: f64,
    /// Standard deviation of the one-way delay (ms); 0 disables jitter.
    pub delay_std_ms: f64,
    /// Lower clamp for sampled delays (ms).
    pub min_delay_ms: f64,
    pub seed: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            loss_probability: 0.02,
            delay_mean_ms: 25.0,
            delay_std_ms: 8.0,
            min_delay_ms: 2.0,
            seed: 10,
        }
    }
}

/// Node pool policy.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PoolConfig {
    pub slot_selection: SlotSelection,
}

/// Run-wide timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RunConfig {
    /// Total simulated time (s).
    pub sim_time_s: f64,
    /// Mobility synchronization interval (ms); trace steps are multiples of it.
    pub sync_interval_ms: u64,
    /// Applications stop this long (ms) before the end of the run.
    pub stop_margin_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            sim_time_s: 100.0,
            sync_interval_ms: 10,
            stop_margin_ms: 100,
        }
    }
}

impl RunConfig {
    pub fn sim_time(&self) -> Duration {
        Duration::from_micros((self.sim_time_s * 1_000_000.0).round() as u64)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    /// Time at which all applications stop.
    pub fn app_stop_time(&self) -> Duration {
        let total = self.sim_time().as_micros();
        Duration::from_micros(total.saturating_sub(self.stop_margin_ms * 1000))
    }
}

/// Root structure of a scenario file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ScenarioConfig {
    pub area: AreaConfig,
    pub advisor: AdvisorConfig,
    pub beacon: BeaconConfig,
    pub supervisor: SupervisorConfig,
    pub channel: ChannelConfig,
    pub pool: PoolConfig,
    pub run: RunConfig,
}

impl ScenarioConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn load(config_path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(config_path).map_err(|e| ConfigError::FileRead(format!("{}: {}", config_path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ScenarioConfig = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate scenario values to reject malformed inputs.
    ///
    /// Checks:
    /// - Boundary and inner area are non-degenerate, finite, and nested
    /// - Speed limits are positive and finite
    /// - Beacon and sync intervals are non-zero
    /// - Supervisor baseline produces a non-zero timeout
    /// - Channel probabilities and delays are in range
    pub fn validate(&self) -> Result<(), ConfigError> {
        let boundary = &self.area.boundary;
        if !boundary.min.is_finite() || !boundary.max.is_finite() || boundary.is_degenerate() {
            return Err(ConfigError::Validation(format!("area boundary {:?} must be a finite rectangle with positive size", boundary)));
        }
        if self.area.inner.is_none() && !(self.area.inner_fraction > 0.0 && self.area.inner_fraction < 1.0) {
            return Err(ConfigError::Validation(format!("inner-fraction {} must be in (0, 1)", self.area.inner_fraction)));
        }
        let partition = self.area.partition();
        if partition.inner().is_degenerate() || !boundary.contains_rect(partition.inner()) {
            return Err(ConfigError::Validation(format!(
                "inner area {:?} must be a non-empty rectangle inside the boundary",
                partition.inner()
            )));
        }

        for (name, value) in [
            ("inner-speed-limit-kmh", self.advisor.inner_speed_limit_kmh),
            ("outer-speed-limit-kmh", self.advisor.outer_speed_limit_kmh),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Validation(format!("{} {} must be positive", name, value)));
            }
        }

        if self.beacon.interval_ms == 0 {
            return Err(ConfigError::Validation("beacon interval-ms must be positive".to_string()));
        }
        if self.run.sync_interval_ms == 0 {
            return Err(ConfigError::Validation("run sync-interval-ms must be positive".to_string()));
        }
        if !(self.run.sim_time_s.is_finite() && self.run.sim_time_s > 0.0) {
            return Err(ConfigError::Validation(format!("run sim-time-s {} must be positive", self.run.sim_time_s)));
        }

        if self.supervisor.enabled && self.supervisor.timeout().as_micros() == 0 {
            return Err(ConfigError::Validation(format!(
                "supervisor baseline-ms {} x timeout-multiplier {} must give a positive timeout",
                self.supervisor.baseline_ms, self.supervisor.timeout_multiplier
            )));
        }

        let channel = &self.channel;
        if !(0.0..=1.0).contains(&channel.loss_probability) {
            return Err(ConfigError::Validation(format!("channel loss-probability {} must be in [0, 1]", channel.loss_probability)));
        }
        if !(channel.delay_mean_ms.is_finite() && channel.delay_mean_ms >= 0.0) {
            return Err(ConfigError::Validation(format!("channel delay-mean-ms {} must be non-negative", channel.delay_mean_ms)));
        }
        if !(channel.delay_std_ms.is_finite() && channel.delay_std_ms >= 0.0) {
            return Err(ConfigError::Validation(format!("channel delay-std-ms {} must be non-negative", channel.delay_std_ms)));
        }
        if !(channel.min_delay_ms.is_finite() && channel.min_delay_ms >= 0.0) {
            return Err(ConfigError::Validation(format!("channel min-delay-ms {} must be non-negative", channel.min_delay_ms)));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::geometry::Zone;

    #[test]
    fn empty_file_yields_reference_scenario() {
        let config = ScenarioConfig::from_toml_str("").unwrap();
        assert_eq!(config.beacon.interval_ms, 100);
        assert_eq!(config.advisor.inner_speed_limit_kmh, 25.0);
        assert_eq!(config.pool.slot_selection, SlotSelection::LowestIndex);
        assert_eq!(config.supervisor.timeout(), Duration::from_millis(150));
        assert_eq!(config.run.app_stop_time(), Duration::from_millis(99_900));
    }

    #[test]
    fn explicit_inner_area_overrides_fraction() {
        let config = ScenarioConfig::from_toml_str(
            r#"
            [area]
            boundary = { min-position = { x = 0.0, y = 0.0 }, max-position = { x = 100.0, y = 100.0 } }
            inner = { min-position = { x = 0.0, y = 0.0 }, max-position = { x = 10.0, y = 10.0 } }
            "#,
        )
        .unwrap();
        let partition = config.area.partition();
        assert_eq!(partition.zone_of(&Point::new(5.0, 5.0)), Zone::Inner);
        assert_eq!(partition.zone_of(&Point::new(50.0, 50.0)), Zone::Outer);
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(matches!(
            ScenarioConfig::from_toml_str("[channel]\nloss-probability = 1.5"),
            Err(ConfigError::Validation(_))
        ));
        assert!(matches!(ScenarioConfig::from_toml_str("[beacon]\ninterval-ms = 0"), Err(ConfigError::Validation(_))));
        assert!(matches!(ScenarioConfig::from_toml_str("[area]\ninner-fraction = 1.0"), Err(ConfigError::Validation(_))));
        assert!(matches!(
            ScenarioConfig::from_toml_str("[advisor]\nouter-speed-limit-kmh = -3.0"),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn rejects_inner_area_outside_boundary() {
        let result = ScenarioConfig::from_toml_str(
            r#"
            [area]
            boundary = { min-position = { x = 0.0, y = 0.0 }, max-position = { x = 100.0, y = 100.0 } }
            inner = { min-position = { x = 50.0, y = 50.0 }, max-position = { x = 150.0, y = 90.0 } }
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn reports_parse_errors() {
        assert!(matches!(ScenarioConfig::from_toml_str("[run\n"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn application_toggles_default_on() {
        let config = ScenarioConfig::from_toml_str("").unwrap();
        assert!(config.beacon.enabled);
        assert!(config.advisor.enabled);

        let config = ScenarioConfig::from_toml_str("[beacon]\nenabled = false\ninterval-ms = 250\n[advisor]\nenabled = false").unwrap();
        assert!(!config.beacon.enabled);
        assert_eq!(config.beacon.interval(), Duration::from_millis(250));
        assert!(!config.advisor.enabled);
        assert_eq!(config.advisor.outer_speed_limit_kmh, 75.0);
    }

    #[test]
    fn beacon_phase_wraps_into_interval() {
        let beacon = BeaconConfig::default();
        assert_eq!(beacon.phase_for_slot(0), Duration::from_millis(0));
        assert_eq!(beacon.phase_for_slot(3), Duration::from_millis(21));
        assert_eq!(beacon.phase_for_slot(15), Duration::from_millis(5));
    }
}
