//! Memory file persistence.
//!
//! The file is JSON with an explicit `schema_version`. Two older layouts
//! written by the original plugin are migrated on load:
//!
//! - `{"plugin_metadata": {...}, "ap_data": {bssid: {...}}}`
//! - a bare `{bssid: {...}}` map
//!
//! Loading never fails the caller: a missing file starts fresh, a corrupt one
//! is logged and replaced by an empty store. Saving writes a temporary file in
//! the same directory and renames it over the target, so an interrupted write
//! leaves the previous file intact.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::PersistenceError;
use crate::memory::{AccessPoint, Client, HomeAnchor, MemoryStore, SignalSample, SIGNAL_MIN_DBM};
use crate::types::{Channel, MacAddr, TimestampMs, MS_PER_SEC};

/// Current memory file layout. Version 1 is the legacy plugin layout.
pub const MEMORY_SCHEMA_VERSION: u32 = 2;

/// On-disk representation of the memory model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryFile {
    pub schema_version: u32,
    pub saved_at_ms: TimestampMs,
    #[serde(default)]
    pub access_points: Vec<AccessPoint>,
    #[serde(default)]
    pub home_anchor: Option<HomeAnchor>,
}

impl MemoryFile {
    /// Capture the store for writing
    pub fn from_store(store: &MemoryStore, saved_at_ms: TimestampMs) -> Self {
        Self {
            schema_version: MEMORY_SCHEMA_VERSION,
            saved_at_ms,
            access_points: store.access_points().cloned().collect(),
            home_anchor: store.home_anchor().cloned(),
        }
    }

    /// Rebuild a store
    pub fn into_store(self, supported_channels: &[Channel]) -> MemoryStore {
        MemoryStore::from_parts(supported_channels, self.access_points, self.home_anchor)
    }
}

/// Layout a memory file was migrated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LegacyLayout {
    /// `plugin_metadata` + `ap_data`
    PluginMetadata,
    /// Bare BSSID map
    BareMap,
}

/// How the memory was obtained at startup, shown on the dashboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LoadStatus {
    /// No memory file, starting with an empty store
    Fresh,
    Loaded { access_points: usize, clients: usize },
    Migrated {
        from: LegacyLayout,
        access_points: usize,
        clients: usize,
    },
    /// File unreadable or corrupt, starting with an empty store
    Failed { reason: String },
}

impl LoadStatus {
    pub fn is_degraded(&self) -> bool {
        matches!(self, LoadStatus::Failed { .. })
    }

    /// One-line description for status displays
    pub fn describe(&self) -> String {
        match self {
            LoadStatus::Fresh => "no memory file, starting fresh".to_string(),
            LoadStatus::Loaded { access_points, clients } => {
                format!("loaded {} APs / {} clients", access_points, clients)
            }
            LoadStatus::Migrated {
                from,
                access_points,
                clients,
            } => format!(
                "migrated {:?} layout: {} APs / {} clients",
                from, access_points, clients
            ),
            LoadStatus::Failed { reason } => {
                format!("memory load failed, starting fresh ({})", reason)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct LegacyEnvelope {
    #[serde(default)]
    ap_data: BTreeMap<String, LegacyAp>,
}

#[derive(Debug, Deserialize)]
struct LegacyAp {
    #[serde(default)]
    ssid: String,
    channel: Option<Channel>,
    #[serde(default)]
    clients: BTreeMap<String, LegacyClient>,
    #[serde(default)]
    last_seen: f64,
    #[serde(default)]
    handshakes: u32,
}

#[derive(Debug, Deserialize)]
struct LegacyClient {
    #[serde(default)]
    last_seen: f64,
    #[serde(default = "legacy_default_signal")]
    signal: i32,
    #[serde(default)]
    last_attempt: f64,
    #[serde(default)]
    last_success: f64,
}

fn legacy_default_signal() -> i32 {
    -100
}

/// Load the memory model, degrading to an empty store on any failure
pub fn load(path: &Path, supported_channels: &[Channel]) -> (MemoryStore, LoadStatus) {
    if !path.exists() {
        info!(path = %path.display(), "No existing memory file found, starting fresh");
        return (MemoryStore::new(supported_channels), LoadStatus::Fresh);
    }

    match try_load(path, supported_channels) {
        Ok((store, status)) => {
            info!(path = %path.display(), status = %status.describe(), "Memory loaded");
            (store, status)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Error loading memory, starting fresh");
            (
                MemoryStore::new(supported_channels),
                LoadStatus::Failed {
                    reason: e.to_string(),
                },
            )
        }
    }
}

fn try_load(
    path: &Path,
    supported_channels: &[Channel],
) -> Result<(MemoryStore, LoadStatus), PersistenceError> {
    let raw = fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&raw)?;

    let (store, migrated_from) = match detect_layout(&value) {
        Layout::Versioned(found) => {
            if found > MEMORY_SCHEMA_VERSION {
                return Err(PersistenceError::UnsupportedVersion {
                    found,
                    supported: MEMORY_SCHEMA_VERSION,
                });
            }
            let file: MemoryFile = serde_json::from_value(value)?;
            (file.into_store(supported_channels), None)
        }
        Layout::Legacy(LegacyLayout::PluginMetadata) => {
            let envelope: LegacyEnvelope = serde_json::from_value(value)?;
            (
                migrate_legacy(envelope.ap_data, supported_channels),
                Some(LegacyLayout::PluginMetadata),
            )
        }
        Layout::Legacy(LegacyLayout::BareMap) => {
            let bare: BTreeMap<String, LegacyAp> = serde_json::from_value(value)?;
            (
                migrate_legacy(bare, supported_channels),
                Some(LegacyLayout::BareMap),
            )
        }
    };

    let access_points = store.ap_count();
    let clients = store.client_count();
    let status = match migrated_from {
        None => LoadStatus::Loaded {
            access_points,
            clients,
        },
        Some(from) => LoadStatus::Migrated {
            from,
            access_points,
            clients,
        },
    };
    Ok((store, status))
}

enum Layout {
    Versioned(u32),
    Legacy(LegacyLayout),
}

fn detect_layout(value: &Value) -> Layout {
    match value {
        Value::Object(map) => {
            if let Some(version) = map.get("schema_version") {
                let found = version
                    .as_u64()
                    .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
                    .unwrap_or(0);
                return Layout::Versioned(found);
            }
            if map.contains_key("plugin_metadata") || map.contains_key("ap_data") {
                return Layout::Legacy(LegacyLayout::PluginMetadata);
            }
            Layout::Legacy(LegacyLayout::BareMap)
        }
        // Not an object; deserializing as a bare map reports the error
        _ => Layout::Legacy(LegacyLayout::BareMap),
    }
}

fn secs_to_ms(secs: f64) -> TimestampMs {
    if secs.is_finite() && secs > 0.0 {
        (secs * MS_PER_SEC as f64) as TimestampMs
    } else {
        0
    }
}

fn nonzero_ms(secs: f64) -> Option<TimestampMs> {
    Some(secs_to_ms(secs)).filter(|&ms| ms > 0)
}

fn migrate_legacy(
    ap_data: BTreeMap<String, LegacyAp>,
    supported_channels: &[Channel],
) -> MemoryStore {
    let mut access_points = Vec::with_capacity(ap_data.len());

    for (raw_bssid, legacy) in ap_data {
        let Ok(bssid) = raw_bssid.parse::<MacAddr>() else {
            warn!(bssid = %raw_bssid, "Skipping legacy AP with malformed BSSID");
            continue;
        };
        let Some(channel) = legacy.channel else {
            warn!(bssid = %bssid, "Skipping legacy AP without channel");
            continue;
        };

        let last_seen_ms = secs_to_ms(legacy.last_seen);
        let mut clients = BTreeMap::new();
        for (raw_mac, lc) in legacy.clients {
            let Ok(mac) = raw_mac.parse::<MacAddr>() else {
                warn!(client = %raw_mac, "Skipping legacy client with malformed MAC");
                continue;
            };
            let seen_ms = secs_to_ms(lc.last_seen);
            let last_handshake_ms = nonzero_ms(lc.last_success);
            let signal = lc.signal.clamp(SIGNAL_MIN_DBM, 0);
            clients.insert(
                mac,
                Client {
                    mac,
                    bssid,
                    signal_history: VecDeque::from([SignalSample {
                        dbm: signal,
                        timestamp_ms: seen_ms,
                    }]),
                    first_seen_ms: seen_ms,
                    last_activity_ms: seen_ms,
                    handshakes: u32::from(last_handshake_ms.is_some()),
                    last_handshake_ms,
                    last_attack_ms: nonzero_ms(lc.last_attempt),
                },
            );
        }

        let ap_last_handshake_ms = clients.values().filter_map(|c| c.last_handshake_ms).max();
        access_points.push(AccessPoint {
            bssid,
            ssid: legacy.ssid,
            channel,
            signal_dbm: SIGNAL_MIN_DBM,
            first_seen_ms: last_seen_ms,
            last_seen_ms,
            handshakes: legacy.handshakes,
            last_handshake_ms: ap_last_handshake_ms,
            clients,
        });
    }

    MemoryStore::from_parts(supported_channels, access_points, None)
}

/// Write a memory file via temp file + rename
pub fn write_atomic(path: &Path, file: &MemoryFile) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let contents = serde_json::to_vec_pretty(file)?;
    let tmp = temp_path(path);

    let result = (|| -> Result<(), PersistenceError> {
        let mut handle = File::create(&tmp)?;
        handle.write_all(&contents)?;
        handle.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "memory.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_path_is_sibling() {
        let tmp = temp_path(Path::new("/var/lib/satpwn/memory.json"));
        assert_eq!(tmp, PathBuf::from("/var/lib/satpwn/memory.json.tmp"));
    }

    #[test]
    fn test_secs_to_ms() {
        assert_eq!(secs_to_ms(1.5), 1_500);
        assert_eq!(secs_to_ms(0.0), 0);
        assert_eq!(secs_to_ms(-3.0), 0);
        assert_eq!(secs_to_ms(f64::NAN), 0);
        assert_eq!(nonzero_ms(0.0), None);
    }

    #[test]
    fn test_migrate_legacy_records() {
        let json = r#"{
            "AA:BB:CC:DD:EE:01": {
                "ssid": "Cafe", "channel": 6, "last_seen": 1700000000.0, "handshakes": 2,
                "clients": {
                    "11:22:33:44:55:66": {"last_seen": 1700000000.5, "signal": -60, "score": 12.0,
                                          "last_attempt": 0, "last_success": 1699999000.0, "last_recalculated": 0}
                }
            },
            "garbage": {"ssid": "x", "channel": 6, "clients": {}, "last_seen": 0, "handshakes": 0},
            "aa:bb:cc:dd:ee:02": {"ssid": "Far", "channel": 165, "clients": {}, "last_seen": 0, "handshakes": 0}
        }"#;
        let bare: BTreeMap<String, LegacyAp> = serde_json::from_str(json).unwrap();
        let store = migrate_legacy(bare, &[1, 6, 11]);

        assert_eq!(store.ap_count(), 1);
        let bssid: MacAddr = "aa:bb:cc:dd:ee:01".parse().unwrap();
        let mac: MacAddr = "11:22:33:44:55:66".parse().unwrap();
        let ap = store.access_point(&bssid).unwrap();
        assert_eq!(ap.handshakes, 2);
        assert_eq!(ap.last_seen_ms, 1_700_000_000_000);
        assert_eq!(ap.last_handshake_ms, Some(1_699_999_000_000));
        let client = store.client(&bssid, &mac).unwrap();
        assert_eq!(client.signal_dbm(), -60);
        assert_eq!(client.last_activity_ms, 1_700_000_000_500);
        assert_eq!(client.last_handshake_ms, Some(1_699_999_000_000));
        assert_eq!(client.last_attack_ms, None);
        assert!(client.has_handshake());
    }

    #[test]
    fn test_oversized_schema_version_is_rejected() {
        let value: Value = serde_json::from_str(r#"{"schema_version": 4294967298}"#).unwrap();
        assert!(matches!(detect_layout(&value), Layout::Versioned(u32::MAX)));

        let path = std::env::temp_dir().join(format!("satpwn_schema_{}.json", uuid::Uuid::new_v4()));
        fs::write(
            &path,
            r#"{"schema_version": 4294967298, "saved_at_ms": 0, "access_points": [], "home_anchor": null}"#,
        )
        .unwrap();
        let (store, status) = load(&path, &[1, 6, 11]);
        assert!(store.is_empty());
        match status {
            LoadStatus::Failed { reason } => assert!(reason.contains("Unsupported memory schema")),
            other => panic!("expected failure, got {:?}", other),
        }
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_status_describe() {
        assert!(LoadStatus::Failed {
            reason: "bad".to_string()
        }
        .describe()
        .contains("starting fresh"));
        assert!(!LoadStatus::Fresh.is_degraded());
    }
}
