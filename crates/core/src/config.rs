//! Configuration management for the SATpwn engine.
//!
//! The configuration is a TOML document. Only `supported_channels` is
//! required; every other key has a documented default that applies when the
//! key is absent. Unknown keys are rejected so a typo never silently falls back
//! to a default.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::logging::LogFormat;
use crate::mode::{ActiveMode, Mode};
use crate::types::{Channel, MS_PER_SEC};

pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// Highest channel number the engine accepts (5 GHz band tops out at 196)
pub const MAX_CHANNEL: Channel = 196;

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Channels the radio can tune to, in Recon sweep order
    pub supported_channels: Vec<Channel>,
    /// Trusted networks; seeing one means "home"
    #[serde(default)]
    pub home_ssids: Vec<String>,
    #[serde(default = "default_memory_path")]
    pub memory_path: PathBuf,
    #[serde(default = "default_initial_mode")]
    pub initial_mode: Mode,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub weighting: WeightingConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub auto: AutoConfig,
    #[serde(default)]
    pub modes: ModeProfiles,
    #[serde(default)]
    pub epoch: EpochConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
}

/// Client scoring parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScoringConfig {
    /// Age at which a client's score has decayed to exactly zero
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    /// Signal at or below which the signal term is 0
    #[serde(default = "default_signal_floor")]
    pub signal_floor_dbm: i32,
    /// Signal at or above which the signal term is 1
    #[serde(default = "default_signal_ceiling")]
    pub signal_ceiling_dbm: i32,
    /// Share of the score carried by signal strength
    #[serde(default = "default_signal_weight")]
    pub signal_weight: f64,
    /// Bonus for a client that has ever produced a handshake
    #[serde(default = "default_handshake_bonus")]
    pub handshake_bonus: f64,
    /// Bonus (replacing `handshake_bonus`) while the handshake is recent
    #[serde(default = "default_recent_handshake_bonus")]
    pub recent_handshake_bonus: f64,
    #[serde(default = "default_recent_handshake_secs")]
    pub recent_handshake_secs: u64,
}

/// Channel weighting parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeightingConfig {
    /// Multiplier on the summed client scores of a channel
    #[serde(default = "default_client_weight")]
    pub client_weight: f64,
    /// Weight added per captured handshake on a channel
    #[serde(default = "default_handshake_weight")]
    pub handshake_weight: f64,
    /// Flat bonus added to every channel in Loose mode
    #[serde(default = "default_exploration_bonus")]
    pub exploration_bonus: f64,
    /// Drive-by multiplier for channels with a recent handshake
    #[serde(default = "default_aggression_multiplier")]
    pub aggression_multiplier: f64,
    #[serde(default = "default_aggression_window_secs")]
    pub aggression_window_secs: u64,
    /// Channels with more APs than this (and more APs than clients) are PMKID friendly
    #[serde(default = "default_pmkid_ap_threshold")]
    pub pmkid_ap_threshold: usize,
    #[serde(default = "default_pmkid_boost")]
    pub pmkid_boost: f64,
    /// Minimum weight of every channel
    #[serde(default)]
    pub idle_floor: f64,
}

/// Channel selection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectionConfig {
    /// Loose mode probability of a uniform random pick
    #[serde(default = "default_exploration_probability")]
    pub exploration_probability: f64,
}

/// Inputs to Auto mode resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutoConfig {
    /// Radius around the home anchor treated as home
    #[serde(default = "default_deadzone_radius")]
    pub deadzone_radius_m: f64,
    /// Stationary time after which Auto falls back to Recon
    #[serde(default = "default_stationary_dwell_secs")]
    pub stationary_dwell_secs: u64,
    /// Speed above which the device counts as moving
    #[serde(default = "default_moving_speed")]
    pub moving_speed_mps: f64,
    /// Displacement within `displacement_window_secs` that counts as moving
    #[serde(default = "default_displacement_threshold")]
    pub displacement_threshold_m: f64,
    #[serde(default = "default_displacement_window_secs")]
    pub displacement_window_secs: u64,
    /// A fix older than this is treated as no fix
    #[serde(default = "default_gps_stale_secs")]
    pub gps_stale_secs: u64,
    /// Data volume at or above which Auto enters Strict
    #[serde(default = "default_volume_enter_strict")]
    pub volume_enter_strict: f64,
    /// Data volume below which Auto leaves Strict for Loose
    #[serde(default = "default_volume_exit_strict")]
    pub volume_exit_strict: f64,
}

/// Per-mode TTLs and attack gating
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModeProfile {
    pub ap_ttl_secs: u64,
    pub client_ttl_secs: u64,
    pub attack_threshold: f64,
    pub attack_cooldown_secs: u64,
}

/// Mode profiles. Strict, Loose and Recon share `standard`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModeProfiles {
    #[serde(default = "ModeProfile::standard")]
    pub standard: ModeProfile,
    #[serde(default = "ModeProfile::drive_by")]
    pub drive_by: ModeProfile,
}

/// Epoch loop timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EpochConfig {
    /// Time between epoch ticks in the node loop
    #[serde(default = "default_epoch_period_secs")]
    pub period_secs: u64,
    /// Changed memory does not trigger a weight recompute more often than this
    #[serde(default = "default_weight_min_interval_secs")]
    pub weight_min_interval_secs: u64,
    /// Cached weights are recomputed after this long even without changes
    #[serde(default = "default_weight_max_age_secs")]
    pub weight_max_age_secs: u64,
    /// Write the memory file every N epochs
    #[serde(default = "default_save_interval_epochs")]
    pub save_interval_epochs: u64,
    /// Observations dated further ahead of the engine clock are rejected
    #[serde(default = "default_max_clock_skew_secs")]
    pub max_clock_skew_secs: u64,
}

/// Dashboard HTTP surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DashboardConfig {
    #[serde(default = "default_dashboard_bind")]
    pub bind: SocketAddr,
}

/// Age thresholds used by the pruning pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub ap_ttl_ms: u64,
    pub client_ttl_ms: u64,
}

fn default_schema_version() -> u32 {
    CONFIG_SCHEMA_VERSION
}

fn default_memory_path() -> PathBuf {
    PathBuf::from("/etc/pwnagotchi/SATpwn_memory.json")
}

fn default_initial_mode() -> Mode {
    Mode::Strict
}

fn default_max_age_secs() -> u64 {
    12 * 3600
}

fn default_signal_floor() -> i32 {
    -100
}

fn default_signal_ceiling() -> i32 {
    -30
}

fn default_signal_weight() -> f64 {
    0.7
}

fn default_handshake_bonus() -> f64 {
    0.1
}

fn default_recent_handshake_bonus() -> f64 {
    0.3
}

fn default_recent_handshake_secs() -> u64 {
    1800
}

fn default_client_weight() -> f64 {
    1.0
}

fn default_handshake_weight() -> f64 {
    10.0
}

fn default_exploration_bonus() -> f64 {
    1.0
}

fn default_aggression_multiplier() -> f64 {
    2.0
}

fn default_aggression_window_secs() -> u64 {
    1800
}

fn default_pmkid_ap_threshold() -> usize {
    3
}

fn default_pmkid_boost() -> f64 {
    1.5
}

fn default_exploration_probability() -> f64 {
    0.1
}

fn default_deadzone_radius() -> f64 {
    20.0
}

fn default_stationary_dwell_secs() -> u64 {
    3600
}

fn default_moving_speed() -> f64 {
    3.0
}

fn default_displacement_threshold() -> f64 {
    100.0
}

fn default_displacement_window_secs() -> u64 {
    120
}

fn default_gps_stale_secs() -> u64 {
    30
}

fn default_volume_enter_strict() -> f64 {
    12.0
}

fn default_volume_exit_strict() -> f64 {
    8.0
}

fn default_epoch_period_secs() -> u64 {
    10
}

fn default_weight_min_interval_secs() -> u64 {
    30
}

fn default_weight_max_age_secs() -> u64 {
    300
}

fn default_save_interval_epochs() -> u64 {
    1
}

fn default_max_clock_skew_secs() -> u64 {
    300
}

fn default_dashboard_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8089))
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            max_age_secs: default_max_age_secs(),
            signal_floor_dbm: default_signal_floor(),
            signal_ceiling_dbm: default_signal_ceiling(),
            signal_weight: default_signal_weight(),
            handshake_bonus: default_handshake_bonus(),
            recent_handshake_bonus: default_recent_handshake_bonus(),
            recent_handshake_secs: default_recent_handshake_secs(),
        }
    }
}

impl Default for WeightingConfig {
    fn default() -> Self {
        Self {
            client_weight: default_client_weight(),
            handshake_weight: default_handshake_weight(),
            exploration_bonus: default_exploration_bonus(),
            aggression_multiplier: default_aggression_multiplier(),
            aggression_window_secs: default_aggression_window_secs(),
            pmkid_ap_threshold: default_pmkid_ap_threshold(),
            pmkid_boost: default_pmkid_boost(),
            idle_floor: 0.0,
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            exploration_probability: default_exploration_probability(),
        }
    }
}

impl Default for AutoConfig {
    fn default() -> Self {
        Self {
            deadzone_radius_m: default_deadzone_radius(),
            stationary_dwell_secs: default_stationary_dwell_secs(),
            moving_speed_mps: default_moving_speed(),
            displacement_threshold_m: default_displacement_threshold(),
            displacement_window_secs: default_displacement_window_secs(),
            gps_stale_secs: default_gps_stale_secs(),
            volume_enter_strict: default_volume_enter_strict(),
            volume_exit_strict: default_volume_exit_strict(),
        }
    }
}

impl Default for ModeProfiles {
    fn default() -> Self {
        Self {
            standard: ModeProfile::standard(),
            drive_by: ModeProfile::drive_by(),
        }
    }
}

impl Default for EpochConfig {
    fn default() -> Self {
        Self {
            period_secs: default_epoch_period_secs(),
            weight_min_interval_secs: default_weight_min_interval_secs(),
            weight_max_age_secs: default_weight_max_age_secs(),
            save_interval_epochs: default_save_interval_epochs(),
            max_clock_skew_secs: default_max_clock_skew_secs(),
        }
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            bind: default_dashboard_bind(),
        }
    }
}

impl ModeProfile {
    /// Long-lived memory used by Strict, Loose and Recon
    pub fn standard() -> Self {
        Self {
            ap_ttl_secs: 48 * 3600,
            client_ttl_secs: 24 * 3600,
            attack_threshold: 0.5,
            attack_cooldown_secs: 300,
        }
    }

    /// Short-lived memory and a lower bar for attacks
    pub fn drive_by() -> Self {
        Self {
            ap_ttl_secs: 1800,
            client_ttl_secs: 900,
            attack_threshold: 0.25,
            attack_cooldown_secs: 60,
        }
    }

    pub fn ttl(&self) -> TtlPolicy {
        TtlPolicy {
            ap_ttl_ms: self.ap_ttl_secs * MS_PER_SEC,
            client_ttl_ms: self.client_ttl_secs * MS_PER_SEC,
        }
    }

    pub fn attack_cooldown_ms(&self) -> u64 {
        self.attack_cooldown_secs * MS_PER_SEC
    }
}

impl ModeProfiles {
    /// Profile governing a concrete mode
    pub fn for_mode(&self, mode: ActiveMode) -> &ModeProfile {
        match mode {
            ActiveMode::DriveBy => &self.drive_by,
            ActiveMode::Strict | ActiveMode::Loose | ActiveMode::Recon => &self.standard,
        }
    }
}

impl EngineConfig {
    /// Configuration with every optional value at its default
    pub fn new(supported_channels: Vec<Channel>) -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            supported_channels,
            home_ssids: Vec::new(),
            memory_path: default_memory_path(),
            initial_mode: default_initial_mode(),
            log_format: LogFormat::default(),
            scoring: ScoringConfig::default(),
            weighting: WeightingConfig::default(),
            selection: SelectionConfig::default(),
            auto: AutoConfig::default(),
            modes: ModeProfiles::default(),
            epoch: EpochConfig::default(),
            dashboard: DashboardConfig::default(),
        }
    }

    /// Load and validate a TOML configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Whether `ssid` is one of the trusted home networks
    pub fn is_home_ssid(&self, ssid: &str) -> bool {
        self.home_ssids.iter().any(|home| home == ssid)
    }

    /// Reject configurations the engine cannot operate with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schema_version > CONFIG_SCHEMA_VERSION {
            return Err(ConfigError::Validation(format!(
                "Unsupported future schema version {} (max {})",
                self.schema_version, CONFIG_SCHEMA_VERSION
            )));
        }

        if self.supported_channels.is_empty() {
            return Err(ConfigError::Validation(
                "supported_channels must not be empty".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for &channel in &self.supported_channels {
            if channel == 0 || channel > MAX_CHANNEL {
                return Err(ConfigError::Validation(format!(
                    "supported_channels contains invalid channel {} (expected 1..={})",
                    channel, MAX_CHANNEL
                )));
            }
            if !seen.insert(channel) {
                return Err(ConfigError::Validation(format!(
                    "supported_channels lists channel {} more than once",
                    channel
                )));
            }
        }

        let scoring = &self.scoring;
        if scoring.max_age_secs == 0 {
            return Err(ConfigError::Validation(
                "scoring.max_age_secs must be greater than 0".to_string(),
            ));
        }
        if scoring.signal_ceiling_dbm <= scoring.signal_floor_dbm {
            return Err(ConfigError::Validation(
                "scoring.signal_ceiling_dbm must be above scoring.signal_floor_dbm".to_string(),
            ));
        }
        for (name, value) in [
            ("scoring.signal_weight", scoring.signal_weight),
            ("scoring.handshake_bonus", scoring.handshake_bonus),
            ("scoring.recent_handshake_bonus", scoring.recent_handshake_bonus),
            ("weighting.client_weight", self.weighting.client_weight),
            ("weighting.handshake_weight", self.weighting.handshake_weight),
            ("weighting.exploration_bonus", self.weighting.exploration_bonus),
            ("weighting.idle_floor", self.weighting.idle_floor),
            ("auto.deadzone_radius_m", self.auto.deadzone_radius_m),
            ("auto.moving_speed_mps", self.auto.moving_speed_mps),
            ("auto.displacement_threshold_m", self.auto.displacement_threshold_m),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Validation(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }

        for (name, value) in [
            ("weighting.aggression_multiplier", self.weighting.aggression_multiplier),
            ("weighting.pmkid_boost", self.weighting.pmkid_boost),
        ] {
            if !value.is_finite() || value < 1.0 {
                return Err(ConfigError::Validation(format!(
                    "{} must be at least 1.0, got {}",
                    name, value
                )));
            }
        }

        let p = self.selection.exploration_probability;
        if !(0.0..=1.0).contains(&p) {
            return Err(ConfigError::Validation(format!(
                "selection.exploration_probability must be within [0, 1], got {}",
                p
            )));
        }

        if self.auto.volume_exit_strict > self.auto.volume_enter_strict {
            return Err(ConfigError::Validation(
                "auto.volume_exit_strict must not exceed auto.volume_enter_strict".to_string(),
            ));
        }

        for (name, profile) in [
            ("modes.standard", &self.modes.standard),
            ("modes.drive_by", &self.modes.drive_by),
        ] {
            if profile.ap_ttl_secs == 0 || profile.client_ttl_secs == 0 {
                return Err(ConfigError::Validation(format!(
                    "{} TTLs must be greater than 0",
                    name
                )));
            }
            if !profile.attack_threshold.is_finite() || profile.attack_threshold < 0.0 {
                return Err(ConfigError::Validation(format!(
                    "{}.attack_threshold must be a non-negative number",
                    name
                )));
            }
        }

        if self.epoch.period_secs == 0 || self.epoch.save_interval_epochs == 0 {
            return Err(ConfigError::Validation(
                "epoch.period_secs and epoch.save_interval_epochs must be greater than 0"
                    .to_string(),
            ));
        }

        if self.epoch.weight_max_age_secs < self.epoch.weight_min_interval_secs {
            return Err(ConfigError::Validation(
                "epoch.weight_max_age_secs must be >= epoch.weight_min_interval_secs".to_string(),
            ));
        }

        Ok(())
    }
}
