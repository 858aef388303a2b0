//! Core error types
//!
//! Errors are grouped by how the engine reacts to them:
//!
//! - [`InputError`]: a single bad observation. The event is skipped and the
//!   epoch loop continues.
//! - [`PersistenceError`]: the memory file could not be read or written. Load
//!   falls back to an empty store, save is retried on a later epoch.
//! - [`ConfigError`]: fatal, raised at startup only.
//!
//! A missing GPS fix is not an error; see [`crate::geo::GpsStatus`].

use thiserror::Error;

use crate::types::{Channel, TimestampMs};

/// Malformed or out-of-range observation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InputError {
    /// MAC/BSSID string could not be parsed
    #[error("Malformed MAC address: {0:?}")]
    MalformedMac(String),

    /// Channel is not part of the supported channel set
    #[error("Channel {channel} is not a supported channel")]
    UnsupportedChannel { channel: Channel },

    /// Signal strength outside of the plausible dBm range
    #[error("Signal {dbm} dBm outside of [{min}, {max}]")]
    SignalOutOfRange { dbm: i32, min: i32, max: i32 },

    /// Latitude/longitude outside of valid bounds
    #[error("Invalid coordinate: {0}")]
    InvalidCoordinate(String),

    /// Event is dated further ahead of the engine clock than the allowed skew
    #[error("Timestamp {timestamp_ms} is more than {max_skew_ms} ms ahead of {now_ms}")]
    TimestampOutOfRange {
        timestamp_ms: TimestampMs,
        now_ms: TimestampMs,
        max_skew_ms: u64,
    },

    /// Speed is negative or not a finite number
    #[error("Invalid speed: {0} m/s")]
    InvalidSpeed(f64),

    /// Client sighting references an access point that is not in memory
    #[error("Client {client} references unknown access point {bssid}")]
    OrphanClient { client: String, bssid: String },

    /// Handshake event for an access point that is not in memory
    #[error("Handshake for unknown access point {bssid}")]
    UnknownAccessPoint { bssid: String },
}

/// Failure loading or saving the memory file.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Memory file is not valid JSON or does not match any known schema
    #[error("Invalid memory file JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Memory file was written by a newer engine
    #[error("Unsupported memory schema version {found} (max {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },
}

/// Missing or invalid required setting.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("Failed to read configuration file: {0}")]
    Read(#[from] std::io::Error),

    /// Configuration file is not valid TOML or contains unknown keys
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Configuration parsed but a value is unusable
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Umbrella error for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// Transient input error
    #[error("Rejected observation: {0}")]
    Input(#[from] InputError),

    /// Persistence error
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
