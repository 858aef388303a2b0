//! Shared primitive types.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::InputError;

/// 802.11 channel number
pub type Channel = u8;

/// Unix timestamp in milliseconds
pub type TimestampMs = u64;

/// Milliseconds per second
pub const MS_PER_SEC: u64 = 1_000;

/// 48-bit IEEE 802 MAC address, used both for BSSIDs and client stations.
///
/// Parsing accepts `:` or `-` separators in either case; display is always
/// lowercase and colon separated so that the same station never produces two
/// memory keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddr([u8; 6]);

impl FromStr for MacAddr {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || InputError::MalformedMac(s.to_string());
        let mut octets = [0u8; 6];
        let mut parts = s.trim().split(|c| c == ':' || c == '-');

        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(malformed)?;
            if part.len() != 2 {
                return Err(malformed());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| malformed())?;
        }

        if parts.next().is_some() {
            return Err(malformed());
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Get current timestamp in milliseconds
pub fn now_ms() -> TimestampMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Milliseconds elapsed from `earlier` to `now`, zero if `earlier` is in the future
pub fn age_ms(now: TimestampMs, earlier: TimestampMs) -> u64 {
    now.saturating_sub(earlier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_parse_normalizes_case_and_separator() {
        let a: MacAddr = "AA:BB:CC:DD:EE:01".parse().unwrap();
        let b: MacAddr = "aa-bb-cc-dd-ee-01".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "aa:bb:cc:dd:ee:01");
    }

    #[test]
    fn test_mac_parse_rejects_malformed() {
        assert!("aa:bb:cc:dd:ee".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:01:02".parse::<MacAddr>().is_err());
        assert!("zz:bb:cc:dd:ee:01".parse::<MacAddr>().is_err());
        assert!("a:bb:cc:dd:ee:01".parse::<MacAddr>().is_err());
        assert!("".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_mac_serde_as_string() {
        let mac: MacAddr = "de:ad:be:ef:00:01".parse().unwrap();
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"de:ad:be:ef:00:01\"");
        let back: MacAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mac);
    }

    #[test]
    fn test_age_saturates() {
        assert_eq!(age_ms(1_000, 400), 600);
        assert_eq!(age_ms(400, 1_000), 0);
    }
}
