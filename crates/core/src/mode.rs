//! Operating modes and the Auto mode state machine.
//!
//! Strict, Loose, Drive-by and Recon are fixed by the user and never change on
//! their own. Auto resolves to one of them every epoch, first match wins:
//!
//! 1. home SSID visible, inside the home deadzone, or stationary long enough: Recon
//! 2. moving: Drive-by
//! 3. data volume high: Strict, otherwise Loose
//!
//! Rule 3 uses a hysteresis band (`volume_enter_strict` / `volume_exit_strict`).
//! Setting both thresholds equal gives a plain single-threshold comparison.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

use crate::config::AutoConfig;
use crate::geo::{GeoCoordinate, Motion};
use crate::types::{age_ms, TimestampMs, MS_PER_SEC};

/// User-selectable mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    Strict,
    Loose,
    #[serde(alias = "drive_by")]
    DriveBy,
    Recon,
    Auto,
}

/// Concrete mode that drives selection, TTLs and attack gating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActiveMode {
    Strict,
    Loose,
    DriveBy,
    Recon,
}

impl Mode {
    /// Dashboard cycle order
    pub const CYCLE: [Mode; 5] = [
        Mode::Strict,
        Mode::Loose,
        Mode::DriveBy,
        Mode::Recon,
        Mode::Auto,
    ];

    /// Mode after this one in the cycle
    pub fn next(self) -> Mode {
        let index = Mode::CYCLE.iter().position(|m| *m == self).unwrap_or(0);
        Mode::CYCLE[(index + 1) % Mode::CYCLE.len()]
    }

    /// The concrete mode for a fixed selection, `None` for Auto
    pub fn fixed(self) -> Option<ActiveMode> {
        match self {
            Mode::Strict => Some(ActiveMode::Strict),
            Mode::Loose => Some(ActiveMode::Loose),
            Mode::DriveBy => Some(ActiveMode::DriveBy),
            Mode::Recon => Some(ActiveMode::Recon),
            Mode::Auto => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Mode::Strict => "Strict",
            Mode::Loose => "Loose",
            Mode::DriveBy => "Drive-by",
            Mode::Recon => "Recon",
            Mode::Auto => "Auto",
        }
    }
}

impl ActiveMode {
    pub fn label(self) -> &'static str {
        match self {
            ActiveMode::Strict => "Strict",
            ActiveMode::Loose => "Loose",
            ActiveMode::DriveBy => "Drive-by",
            ActiveMode::Recon => "Recon",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl fmt::Display for ActiveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why the current concrete mode was chosen
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ResolutionReason {
    /// Fixed mode chosen by the user
    UserSelected,
    HomeSsidVisible,
    InsideDeadzone { distance_m: f64 },
    Stationary { dwell_secs: u64 },
    Moving {
        speed_mps: Option<f64>,
        displacement_m: Option<f64>,
    },
    HighVolume { volume: f64 },
    LowVolume { volume: f64 },
}

/// Outcome of one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Resolution {
    pub mode: ActiveMode,
    pub reason: ResolutionReason,
}

/// Fused signals consumed by Auto resolution
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutoSignals {
    /// A whitelisted SSID was seen this epoch
    pub home_ssid_visible: bool,
    /// Current position if a fresh fix exists
    pub position: Option<GeoCoordinate>,
    pub home_anchor: Option<GeoCoordinate>,
    pub motion: Motion,
    pub speed_mps: Option<f64>,
    pub displacement_m: Option<f64>,
    /// Total unadjusted channel weight
    pub data_volume: f64,
}

impl AutoSignals {
    /// No GPS, no home network, no data
    pub fn quiet() -> Self {
        Self {
            home_ssid_visible: false,
            position: None,
            home_anchor: None,
            motion: Motion::Unknown,
            speed_mps: None,
            displacement_m: None,
            data_volume: 0.0,
        }
    }
}

/// Mode state for the lifetime of the process
#[derive(Debug, Clone)]
pub struct ModeStateMachine {
    mode: Mode,
    resolution: Resolution,
    last_switch_ms: TimestampMs,
    dwell_start_ms: Option<TimestampMs>,
    strict_latched: bool,
    config: AutoConfig,
}

impl ModeStateMachine {
    pub fn new(initial: Mode, config: AutoConfig, now: TimestampMs) -> Self {
        Self {
            mode: initial,
            resolution: initial_resolution(initial),
            last_switch_ms: now,
            dwell_start_ms: None,
            strict_latched: false,
            config,
        }
    }

    /// Top-level mode selected by the user
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Concrete mode in effect
    pub fn active(&self) -> ActiveMode {
        self.resolution.mode
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn last_switch_ms(&self) -> TimestampMs {
        self.last_switch_ms
    }

    pub fn dwell_start_ms(&self) -> Option<TimestampMs> {
        self.dwell_start_ms
    }

    /// Time spent stationary, `None` unless the latest fresh fix was stationary
    pub fn dwell_secs(&self, now: TimestampMs) -> Option<u64> {
        self.dwell_start_ms.map(|start| age_ms(now, start) / MS_PER_SEC)
    }

    /// Status label, e.g. `Auto (Recon)` or `Loose`
    pub fn display_label(&self) -> String {
        match self.mode {
            Mode::Auto => format!("Auto ({})", self.active()),
            fixed => fixed.label().to_string(),
        }
    }

    /// Explicit user selection. Returns whether anything changed.
    pub fn set_mode(&mut self, mode: Mode, now: TimestampMs) -> bool {
        if mode == self.mode {
            return false;
        }
        info!(from = %self.mode, to = %mode, "Mode changed");
        let previous = self.active();
        self.mode = mode;
        if let Some(fixed) = mode.fixed() {
            self.resolution = Resolution {
                mode: fixed,
                reason: ResolutionReason::UserSelected,
            };
        }
        if self.active() != previous || mode == Mode::Auto {
            self.last_switch_ms = now;
        }
        true
    }

    /// Advance to the next mode in the dashboard cycle
    pub fn cycle(&mut self, now: TimestampMs) -> Mode {
        let next = self.mode.next();
        self.set_mode(next, now);
        next
    }

    /// Update dwell tracking and, under Auto, re-derive the concrete mode.
    ///
    /// Idempotent for identical signals apart from the dwell clock.
    pub fn evaluate(&mut self, signals: &AutoSignals, now: TimestampMs) -> Resolution {
        match signals.motion {
            Motion::Moving => self.dwell_start_ms = Some(now),
            Motion::Stationary => {
                self.dwell_start_ms.get_or_insert(now);
            }
            // Stationary time cannot be vouched for without a fix
            Motion::Unknown => self.dwell_start_ms = None,
        }

        let resolution = match self.mode.fixed() {
            Some(fixed) => Resolution {
                mode: fixed,
                reason: ResolutionReason::UserSelected,
            },
            None => self.resolve_auto(signals, now),
        };

        if resolution.mode != self.resolution.mode {
            info!(
                from = %self.resolution.mode,
                to = %resolution.mode,
                reason = ?resolution.reason,
                "Auto mode switched"
            );
            self.last_switch_ms = now;
        }
        self.resolution = resolution;
        resolution
    }

    fn resolve_auto(&mut self, signals: &AutoSignals, now: TimestampMs) -> Resolution {
        let recon = |reason| Resolution {
            mode: ActiveMode::Recon,
            reason,
        };

        if signals.home_ssid_visible {
            return recon(ResolutionReason::HomeSsidVisible);
        }

        if let (Some(position), Some(anchor)) = (signals.position, signals.home_anchor) {
            let distance_m = position.haversine_distance(&anchor);
            if distance_m <= self.config.deadzone_radius_m {
                return recon(ResolutionReason::InsideDeadzone { distance_m });
            }
        }

        if let Some(dwell_secs) = self.dwell_secs(now) {
            if dwell_secs > self.config.stationary_dwell_secs {
                return recon(ResolutionReason::Stationary { dwell_secs });
            }
        }

        if signals.motion == Motion::Moving {
            return Resolution {
                mode: ActiveMode::DriveBy,
                reason: ResolutionReason::Moving {
                    speed_mps: signals.speed_mps,
                    displacement_m: signals.displacement_m,
                },
            };
        }

        let volume = signals.data_volume;
        self.strict_latched = if self.strict_latched {
            volume >= self.config.volume_exit_strict
        } else {
            volume >= self.config.volume_enter_strict
        };

        if self.strict_latched {
            Resolution {
                mode: ActiveMode::Strict,
                reason: ResolutionReason::HighVolume { volume },
            }
        } else {
            Resolution {
                mode: ActiveMode::Loose,
                reason: ResolutionReason::LowVolume { volume },
            }
        }
    }
}

fn initial_resolution(mode: Mode) -> Resolution {
    match mode.fixed() {
        Some(fixed) => Resolution {
            mode: fixed,
            reason: ResolutionReason::UserSelected,
        },
        // Until the first evaluation Auto behaves like a quiet Loose
        None => Resolution {
            mode: ActiveMode::Loose,
            reason: ResolutionReason::LowVolume { volume: 0.0 },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOME: (f64, f64) = (40.0, -74.0);

    fn coord(lat: f64, lon: f64) -> GeoCoordinate {
        GeoCoordinate::new(lat, lon).unwrap()
    }

    fn auto_machine() -> ModeStateMachine {
        ModeStateMachine::new(Mode::Auto, AutoConfig::default(), 0)
    }

    #[test]
    fn test_cycle_order_wraps() {
        let mut mode = Mode::Strict;
        let mut seen = Vec::new();
        for _ in 0..5 {
            mode = mode.next();
            seen.push(mode);
        }
        assert_eq!(
            seen,
            vec![Mode::Loose, Mode::DriveBy, Mode::Recon, Mode::Auto, Mode::Strict]
        );
    }

    #[test]
    fn test_mode_serde_names() {
        assert_eq!(serde_json::to_string(&Mode::DriveBy).unwrap(), "\"drive-by\"");
        let parsed: Mode = serde_json::from_str("\"drive_by\"").unwrap();
        assert_eq!(parsed, Mode::DriveBy);
        assert_eq!(serde_json::to_string(&ActiveMode::Recon).unwrap(), "\"recon\"");
    }

    #[test]
    fn test_fixed_modes_never_auto_transition() {
        let mut machine = ModeStateMachine::new(Mode::Loose, AutoConfig::default(), 0);
        let signals = AutoSignals {
            home_ssid_visible: true,
            motion: Motion::Moving,
            speed_mps: Some(20.0),
            data_volume: 1_000.0,
            ..AutoSignals::quiet()
        };
        let resolution = machine.evaluate(&signals, 1_000);
        assert_eq!(resolution.mode, ActiveMode::Loose);
        assert_eq!(resolution.reason, ResolutionReason::UserSelected);
    }

    #[test]
    fn test_home_ssid_beats_motion() {
        let mut machine = auto_machine();
        let signals = AutoSignals {
            home_ssid_visible: true,
            motion: Motion::Moving,
            speed_mps: Some(8.0),
            ..AutoSignals::quiet()
        };
        assert_eq!(machine.evaluate(&signals, 1_000).mode, ActiveMode::Recon);
    }

    #[test]
    fn test_home_coordinate_with_ssid_resolves_recon_regardless_of_volume() {
        let mut machine = auto_machine();
        let home = coord(HOME.0, HOME.1);
        let signals = AutoSignals {
            home_ssid_visible: true,
            position: Some(home),
            home_anchor: Some(home),
            motion: Motion::Stationary,
            data_volume: 10_000.0,
            ..AutoSignals::quiet()
        };
        let resolution = machine.evaluate(&signals, 1_000);
        assert_eq!(resolution.mode, ActiveMode::Recon);
        assert_eq!(resolution.reason, ResolutionReason::HomeSsidVisible);
    }

    #[test]
    fn test_deadzone_without_ssid() {
        let mut machine = auto_machine();
        // ~11 m from home
        let signals = AutoSignals {
            position: Some(coord(HOME.0 + 0.0001, HOME.1)),
            home_anchor: Some(coord(HOME.0, HOME.1)),
            motion: Motion::Stationary,
            data_volume: 50.0,
            ..AutoSignals::quiet()
        };
        let resolution = machine.evaluate(&signals, 1_000);
        assert_eq!(resolution.mode, ActiveMode::Recon);
        assert!(matches!(
            resolution.reason,
            ResolutionReason::InsideDeadzone { .. }
        ));

        // ~33 m is outside the 20 m deadzone
        let outside = AutoSignals {
            position: Some(coord(HOME.0 + 0.0003, HOME.1)),
            ..signals
        };
        assert_eq!(machine.evaluate(&outside, 2_000).mode, ActiveMode::Strict);
    }

    #[test]
    fn test_moving_resolves_drive_by() {
        let mut machine = auto_machine();
        let signals = AutoSignals {
            position: Some(coord(41.0, -74.0)),
            home_anchor: Some(coord(HOME.0, HOME.1)),
            motion: Motion::Moving,
            speed_mps: Some(8.0),
            data_volume: 100.0,
            ..AutoSignals::quiet()
        };
        let resolution = machine.evaluate(&signals, 5_000);
        assert_eq!(resolution.mode, ActiveMode::DriveBy);
        assert_eq!(machine.last_switch_ms(), 5_000);
    }

    #[test]
    fn test_long_dwell_resolves_recon_and_motion_resets_it() {
        let mut machine = auto_machine();
        let hour = 3_600_000;
        let still = AutoSignals {
            position: Some(coord(41.0, -74.0)),
            motion: Motion::Stationary,
            data_volume: 100.0,
            ..AutoSignals::quiet()
        };
        assert_eq!(machine.evaluate(&still, 0).mode, ActiveMode::Strict);
        assert_eq!(machine.evaluate(&still, hour).mode, ActiveMode::Strict);
        let resolution = machine.evaluate(&still, hour + 1_000);
        assert_eq!(resolution.mode, ActiveMode::Recon);
        assert!(matches!(
            resolution.reason,
            ResolutionReason::Stationary { dwell_secs: 3601 }
        ));

        let moving = AutoSignals {
            motion: Motion::Moving,
            ..still
        };
        assert_eq!(machine.evaluate(&moving, hour + 2_000).mode, ActiveMode::DriveBy);
        assert_eq!(machine.dwell_secs(hour + 2_000), Some(0));
        assert_eq!(machine.evaluate(&still, hour + 3_000).mode, ActiveMode::Strict);
    }

    #[test]
    fn test_without_gps_dwell_never_starts() {
        let mut machine = auto_machine();
        let signals = AutoSignals {
            data_volume: 1.0,
            ..AutoSignals::quiet()
        };
        let resolution = machine.evaluate(&signals, 10 * 3_600_000);
        assert_eq!(resolution.mode, ActiveMode::Loose);
        assert_eq!(machine.dwell_secs(10 * 3_600_000), None);
    }

    #[test]
    fn test_losing_gps_clears_dwell() {
        let mut machine = auto_machine();
        let hour = 3_600_000;
        let still = AutoSignals {
            position: Some(coord(41.0, -74.0)),
            motion: Motion::Stationary,
            data_volume: 1.0,
            ..AutoSignals::quiet()
        };
        machine.evaluate(&still, 0);
        assert_eq!(machine.dwell_start_ms(), Some(0));

        let no_fix = AutoSignals {
            data_volume: 1.0,
            ..AutoSignals::quiet()
        };
        let resolution = machine.evaluate(&no_fix, 2 * hour);
        assert_eq!(resolution.mode, ActiveMode::Loose);
        assert_eq!(machine.dwell_start_ms(), None);

        // The clock restarts with the next stationary fix
        assert_eq!(machine.evaluate(&still, 2 * hour + 1_000).mode, ActiveMode::Loose);
        assert_eq!(machine.dwell_start_ms(), Some(2 * hour + 1_000));
    }

    #[test]
    fn test_volume_hysteresis() {
        let mut machine = auto_machine();
        let at = |volume| AutoSignals {
            data_volume: volume,
            ..AutoSignals::quiet()
        };
        assert_eq!(machine.evaluate(&at(10.0), 0).mode, ActiveMode::Loose);
        assert_eq!(machine.evaluate(&at(12.0), 1).mode, ActiveMode::Strict);
        // Inside the band Strict holds
        assert_eq!(machine.evaluate(&at(9.0), 2).mode, ActiveMode::Strict);
        assert_eq!(machine.evaluate(&at(7.9), 3).mode, ActiveMode::Loose);
        // And Loose holds on the way back up
        assert_eq!(machine.evaluate(&at(11.0), 4).mode, ActiveMode::Loose);
    }

    #[test]
    fn test_equal_thresholds_follow_volume_directly() {
        let config = AutoConfig {
            volume_enter_strict: 10.0,
            volume_exit_strict: 10.0,
            ..AutoConfig::default()
        };
        let mut machine = ModeStateMachine::new(Mode::Auto, config, 0);
        for (volume, expected) in [
            (10.0, ActiveMode::Strict),
            (9.99, ActiveMode::Loose),
            (10.0, ActiveMode::Strict),
        ] {
            let signals = AutoSignals {
                data_volume: volume,
                ..AutoSignals::quiet()
            };
            assert_eq!(machine.evaluate(&signals, 0).mode, expected);
        }
    }

    #[test]
    fn test_set_mode_and_labels() {
        let mut machine = ModeStateMachine::new(Mode::Strict, AutoConfig::default(), 0);
        assert!(!machine.set_mode(Mode::Strict, 10));
        assert_eq!(machine.cycle(20), Mode::Loose);
        assert_eq!(machine.active(), ActiveMode::Loose);
        assert_eq!(machine.last_switch_ms(), 20);
        assert_eq!(machine.display_label(), "Loose");

        machine.set_mode(Mode::Auto, 30);
        machine.evaluate(&AutoSignals::quiet(), 40);
        assert_eq!(machine.display_label(), "Auto (Loose)");
    }
}
