//! Distance and motion math for geofencing.
//!
//! Everything here is pure apart from [`MotionTracker`], which keeps a short
//! window of recent fixes so displacement can be measured against a recent
//! reference point.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::error::InputError;
use crate::types::{age_ms, TimestampMs, MS_PER_SEC};

/// Earth's mean radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Upper bound on retained fixes regardless of window length
const MAX_TRACKED_FIXES: usize = 256;

/// Geographic coordinates (latitude, longitude)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoCoordinate {
    /// Latitude in degrees (-90 to 90)
    pub latitude: f64,
    /// Longitude in degrees (-180 to 180)
    pub longitude: f64,
}

impl GeoCoordinate {
    /// Create a new geographic coordinate
    ///
    /// # Arguments
    /// * `latitude` - Latitude in degrees (-90 to 90)
    /// * `longitude` - Longitude in degrees (-180 to 180)
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, InputError> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(InputError::InvalidCoordinate(format!(
                "Latitude must be between -90 and 90, got {}",
                latitude
            )));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(InputError::InvalidCoordinate(format!(
                "Longitude must be between -180 and 180, got {}",
                longitude
            )));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Calculate haversine distance to another coordinate in meters
    pub fn haversine_distance(&self, other: &GeoCoordinate) -> f64 {
        haversine_distance(self, other)
    }
}

/// Great-circle distance between two points in meters.
///
/// Symmetric in its arguments and exactly zero for identical points.
pub fn haversine_distance(a: &GeoCoordinate, b: &GeoCoordinate) -> f64 {
    let lat1_rad = a.latitude.to_radians();
    let lat2_rad = b.latitude.to_radians();
    let delta_lat = (b.latitude - a.latitude).to_radians();
    let delta_lon = (b.longitude - a.longitude).to_radians();

    let h = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);

    // Rounding can push h a hair above 1 for antipodal points
    let c = 2.0 * h.min(1.0).sqrt().asin();

    EARTH_RADIUS_M * c
}

/// Parsed GPS fix supplied by the host
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub coordinate: GeoCoordinate,
    /// Ground speed when the receiver reports one
    pub speed_mps: Option<f64>,
    pub timestamp_ms: TimestampMs,
}

/// Motion classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Motion {
    Moving,
    Stationary,
    /// No usable fix
    Unknown,
}

/// Thresholds for [`classify_motion`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionThresholds {
    pub speed_mps: f64,
    pub displacement_m: f64,
}

/// Classify motion from speed and recent displacement.
///
/// Either signal above its threshold means moving. With neither signal
/// available the result is [`Motion::Unknown`].
pub fn classify_motion(
    speed_mps: Option<f64>,
    displacement_m: Option<f64>,
    thresholds: MotionThresholds,
) -> Motion {
    let fast = speed_mps.map(|s| s > thresholds.speed_mps);
    let displaced = displacement_m.map(|d| d > thresholds.displacement_m);

    match (fast, displaced) {
        (Some(true), _) | (_, Some(true)) => Motion::Moving,
        (None, None) => Motion::Unknown,
        _ => Motion::Stationary,
    }
}

/// GPS availability as reported to the dashboard
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GpsStatus {
    /// No fix has ever been received
    Unavailable,
    /// Last fix is older than the staleness limit
    Stale { age_ms: u64 },
    /// Fresh fix
    Fix {
        coordinate: GeoCoordinate,
        speed_mps: Option<f64>,
        age_ms: u64,
    },
}

impl GpsStatus {
    pub fn is_fix(&self) -> bool {
        matches!(self, GpsStatus::Fix { .. })
    }
}

/// Sliding window of recent fixes
#[derive(Debug, Clone)]
pub struct MotionTracker {
    fixes: VecDeque<GpsFix>,
    window_ms: u64,
}

impl MotionTracker {
    /// Create a tracker that measures displacement over `window_secs`
    pub fn new(window_secs: u64) -> Self {
        Self {
            fixes: VecDeque::new(),
            window_ms: window_secs * MS_PER_SEC,
        }
    }

    /// Record a fix. Fixes older than the newest one already held are ignored.
    pub fn record(&mut self, fix: GpsFix) {
        if let Some(last) = self.fixes.back() {
            if fix.timestamp_ms < last.timestamp_ms {
                return;
            }
        }
        self.fixes.push_back(fix);
        self.evict(fix.timestamp_ms);
    }

    fn evict(&mut self, now: TimestampMs) {
        while let Some(front) = self.fixes.front() {
            let expired = age_ms(now, front.timestamp_ms) > self.window_ms;
            if (expired && self.fixes.len() > 1) || self.fixes.len() > MAX_TRACKED_FIXES {
                self.fixes.pop_front();
            } else {
                break;
            }
        }
    }

    /// Most recent fix, regardless of age
    pub fn latest(&self) -> Option<&GpsFix> {
        self.fixes.back()
    }

    /// Most recent fix if it is younger than `stale_ms`
    pub fn fresh(&self, now: TimestampMs, stale_ms: u64) -> Option<&GpsFix> {
        self.latest()
            .filter(|fix| age_ms(now, fix.timestamp_ms) <= stale_ms)
    }

    /// Distance from the oldest fix inside the window to the newest one
    pub fn displacement_m(&self) -> Option<f64> {
        match (self.fixes.front(), self.fixes.back()) {
            (Some(first), Some(last)) if self.fixes.len() > 1 => {
                Some(first.coordinate.haversine_distance(&last.coordinate))
            }
            _ => None,
        }
    }

    /// Speed reported by the receiver, or derived from the last two fixes
    pub fn speed_mps(&self) -> Option<f64> {
        let last = self.fixes.back()?;
        if let Some(speed) = last.speed_mps {
            return Some(speed);
        }
        let previous = self.fixes.iter().rev().nth(1)?;
        let dt_ms = age_ms(last.timestamp_ms, previous.timestamp_ms);
        if dt_ms == 0 {
            return None;
        }
        let distance = previous.coordinate.haversine_distance(&last.coordinate);
        Some(distance / (dt_ms as f64 / MS_PER_SEC as f64))
    }

    /// Classify current motion; a stale or missing fix yields `Unknown`
    pub fn motion(&self, now: TimestampMs, stale_ms: u64, thresholds: MotionThresholds) -> Motion {
        if self.fresh(now, stale_ms).is_none() {
            return Motion::Unknown;
        }
        classify_motion(self.speed_mps(), self.displacement_m(), thresholds)
    }

    /// Dashboard view of GPS availability
    pub fn status(&self, now: TimestampMs, stale_ms: u64) -> GpsStatus {
        match self.latest() {
            None => GpsStatus::Unavailable,
            Some(fix) => {
                let age = age_ms(now, fix.timestamp_ms);
                if age > stale_ms {
                    GpsStatus::Stale { age_ms: age }
                } else {
                    GpsStatus::Fix {
                        coordinate: fix.coordinate,
                        speed_mps: fix.speed_mps,
                        age_ms: age,
                    }
                }
            }
        }
    }
}
