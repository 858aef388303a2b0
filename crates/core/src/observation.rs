//! Events supplied by the capture host.
//!
//! Identifiers arrive as strings and are validated when the event is applied,
//! so a single malformed event can be rejected without touching the rest of
//! the batch.

use serde::{Deserialize, Serialize};

use crate::error::InputError;
use crate::geo::{GeoCoordinate, GpsFix};
use crate::types::{Channel, MacAddr, TimestampMs};

/// One event from the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Observation {
    AccessPoint(ApSighting),
    Client(ClientSighting),
    Handshake(HandshakeEvent),
    Gps(GpsReading),
}

/// Access point seen on a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApSighting {
    pub bssid: String,
    #[serde(default)]
    pub ssid: String,
    pub channel: Channel,
    pub signal_dbm: i32,
    pub timestamp_ms: TimestampMs,
}

/// Station seen talking to an access point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSighting {
    pub mac: String,
    pub bssid: String,
    pub signal_dbm: i32,
    pub timestamp_ms: TimestampMs,
}

/// Handshake captured between a station and an access point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeEvent {
    pub bssid: String,
    pub mac: String,
    pub timestamp_ms: TimestampMs,
}

/// Parsed GPS reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsReading {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub speed_mps: Option<f64>,
    pub timestamp_ms: TimestampMs,
}

impl Observation {
    /// Event time
    pub fn timestamp_ms(&self) -> TimestampMs {
        match self {
            Observation::AccessPoint(s) => s.timestamp_ms,
            Observation::Client(s) => s.timestamp_ms,
            Observation::Handshake(e) => e.timestamp_ms,
            Observation::Gps(r) => r.timestamp_ms,
        }
    }

    /// Short tag for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Observation::AccessPoint(_) => "access_point",
            Observation::Client(_) => "client",
            Observation::Handshake(_) => "handshake",
            Observation::Gps(_) => "gps",
        }
    }
}

impl GpsReading {
    /// Validate into a fix
    pub fn to_fix(&self) -> Result<GpsFix, InputError> {
        let coordinate = GeoCoordinate::new(self.latitude, self.longitude)?;
        if let Some(speed) = self.speed_mps {
            if !speed.is_finite() || speed < 0.0 {
                return Err(InputError::InvalidSpeed(speed));
            }
        }
        Ok(GpsFix {
            coordinate,
            speed_mps: self.speed_mps,
            timestamp_ms: self.timestamp_ms,
        })
    }
}

pub(crate) fn parse_mac(raw: &str) -> Result<MacAddr, InputError> {
    raw.parse()
}
