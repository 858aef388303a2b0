//! Client scoring
//!
//! A client's tactical value in `[0, 1]`:
//!
//! ```text
//! score = clamp(signal_weight * signal_term + handshake_term, 0, 1) * decay_term
//! ```
//!
//! - `signal_term` maps dBm linearly from the configured floor (0) to the
//!   ceiling (1), clamped.
//! - `handshake_term` is a flat bonus once a handshake was captured, replaced
//!   by a larger bonus while that handshake is recent.
//! - `decay_term` falls linearly from 1 at zero age to exactly 0 at
//!   `max_age_secs`, so stale clients stay in memory but drop out of selection.

use serde::Serialize;
use std::cmp::Ordering;

use crate::config::ScoringConfig;
use crate::memory::{Client, MemoryStore};
use crate::types::{age_ms, Channel, MacAddr, TimestampMs, MS_PER_SEC};

/// Deterministic client scorer
#[derive(Debug, Clone)]
pub struct ClientScorer {
    config: ScoringConfig,
}

/// A client with its computed score
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RankedClient {
    pub mac: MacAddr,
    pub bssid: MacAddr,
    pub channel: Channel,
    pub score: f64,
    pub last_activity_ms: TimestampMs,
}

impl ClientScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Signal strength mapped to `[0, 1]`
    pub fn signal_term(&self, signal_dbm: i32) -> f64 {
        let floor = self.config.signal_floor_dbm as f64;
        let ceiling = self.config.signal_ceiling_dbm as f64;
        ((signal_dbm as f64 - floor) / (ceiling - floor)).clamp(0.0, 1.0)
    }

    /// Handshake bonus
    pub fn handshake_term(&self, client: &Client, now: TimestampMs) -> f64 {
        if !client.has_handshake() {
            return 0.0;
        }
        let recent_ms = self.config.recent_handshake_secs * MS_PER_SEC;
        match client.last_handshake_ms {
            Some(at) if age_ms(now, at) <= recent_ms => self.config.recent_handshake_bonus,
            _ => self.config.handshake_bonus,
        }
    }

    /// Linear decay multiplier, exactly 0 at or past the maximum age
    pub fn decay_term(&self, client: &Client, now: TimestampMs) -> f64 {
        let max_age_ms = self.config.max_age_secs * MS_PER_SEC;
        let age = age_ms(now, client.last_activity_ms);
        if age >= max_age_ms {
            return 0.0;
        }
        1.0 - age as f64 / max_age_ms as f64
    }

    /// Score a client at `now`
    pub fn score(&self, client: &Client, now: TimestampMs) -> f64 {
        let decay = self.decay_term(client, now);
        if decay == 0.0 {
            return 0.0;
        }
        let base = self.config.signal_weight * self.signal_term(client.signal_dbm())
            + self.handshake_term(client, now);
        base.clamp(0.0, 1.0) * decay
    }

    /// Every client in memory, best first.
    ///
    /// Ties on score go to the most recently active client, then to the lower
    /// MAC so the order is fully deterministic.
    pub fn rank(&self, store: &MemoryStore, now: TimestampMs) -> Vec<RankedClient> {
        let mut ranked: Vec<RankedClient> = store
            .access_points()
            .flat_map(|ap| {
                ap.clients.values().map(move |client| RankedClient {
                    mac: client.mac,
                    bssid: ap.bssid,
                    channel: ap.channel,
                    score: self.score(client, now),
                    last_activity_ms: client.last_activity_ms,
                })
            })
            .collect();
        ranked.sort_by(compare_ranked);
        ranked
    }
}

fn compare_ranked(a: &RankedClient, b: &RankedClient) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.last_activity_ms.cmp(&a.last_activity_ms))
        .then_with(|| a.mac.cmp(&b.mac))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::{ApSighting, ClientSighting};

    const HOUR: u64 = 3_600_000;

    fn scorer() -> ClientScorer {
        ClientScorer::new(ScoringConfig::default())
    }

    fn store_with_client(dbm: i32, seen: u64) -> MemoryStore {
        let mut store = MemoryStore::new(&[6]);
        store
            .upsert_access_point(&ApSighting {
                bssid: "aa:bb:cc:dd:ee:01".to_string(),
                ssid: "Cafe".to_string(),
                channel: 6,
                signal_dbm: -40,
                timestamp_ms: seen,
            })
            .unwrap();
        store
            .upsert_client(&ClientSighting {
                mac: "11:22:33:44:55:66".to_string(),
                bssid: "aa:bb:cc:dd:ee:01".to_string(),
                signal_dbm: dbm,
                timestamp_ms: seen,
            })
            .unwrap();
        store
    }

    fn only_client(store: &MemoryStore) -> &Client {
        store.access_points().next().unwrap().clients.values().next().unwrap()
    }

    #[test]
    fn test_signal_term_is_clamped_and_monotonic() {
        let s = scorer();
        assert_eq!(s.signal_term(-120), 0.0);
        assert_eq!(s.signal_term(-100), 0.0);
        assert_eq!(s.signal_term(-30), 1.0);
        assert_eq!(s.signal_term(0), 1.0);
        assert!(s.signal_term(-50) > s.signal_term(-70));
    }

    #[test]
    fn test_fresh_client_score() {
        let store = store_with_client(-50, 0);
        let score = scorer().score(only_client(&store), 0);
        // 0.7 * (50 / 70)
        assert!((score - 0.5).abs() < 1e-9, "score was {}", score);
    }

    #[test]
    fn test_recent_handshake_bonus_then_flat_bonus() {
        let mut store = store_with_client(-50, 0);
        let bssid = "aa:bb:cc:dd:ee:01".parse().unwrap();
        let mac = "11:22:33:44:55:66".parse().unwrap();
        store.record_handshake(&bssid, &mac, 0).unwrap();
        let s = scorer();
        let client = only_client(&store);

        assert_eq!(s.handshake_term(client, 60_000), 0.3);
        assert_eq!(s.handshake_term(client, 2 * HOUR), 0.1);
        assert!((s.score(client, 0) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_decay_reaches_exactly_zero() {
        let store = store_with_client(-30, 0);
        let s = scorer();
        let client = only_client(&store);
        let max_age = s.config().max_age_secs * MS_PER_SEC;

        assert_eq!(s.score(client, max_age), 0.0);
        assert_eq!(s.score(client, max_age + HOUR), 0.0);
        assert!(s.score(client, max_age - 1) > 0.0);
    }

    #[test]
    fn test_score_non_increasing_with_age() {
        let store = store_with_client(-45, 0);
        let s = scorer();
        let client = only_client(&store);
        let mut previous = f64::INFINITY;
        for step in 0..30 {
            let score = s.score(client, step * HOUR / 2);
            assert!(score <= previous);
            previous = score;
        }
        assert_eq!(previous, 0.0);
    }

    #[test]
    fn test_rank_tie_break_by_recent_activity() {
        let mut store = store_with_client(-60, 1_000);
        store
            .upsert_client(&ClientSighting {
                mac: "11:22:33:44:55:77".to_string(),
                bssid: "aa:bb:cc:dd:ee:01".to_string(),
                signal_dbm: -60,
                timestamp_ms: 1_000,
            })
            .unwrap();
        store
            .upsert_client(&ClientSighting {
                mac: "11:22:33:44:55:88".to_string(),
                bssid: "aa:bb:cc:dd:ee:01".to_string(),
                signal_dbm: -40,
                timestamp_ms: 900,
            })
            .unwrap();

        // At decay horizon every score is 0, so ordering is purely by recency then MAC
        let s = scorer();
        let horizon = s.config().max_age_secs * MS_PER_SEC + 1_000;
        let ranked = s.rank(&store, horizon);
        let order: Vec<String> = ranked.iter().map(|r| r.mac.to_string()).collect();
        assert_eq!(
            order,
            vec!["11:22:33:44:55:66", "11:22:33:44:55:77", "11:22:33:44:55:88"]
        );

        // While fresh, the strongest client leads
        let ranked = s.rank(&store, 1_000);
        assert_eq!(ranked[0].mac.to_string(), "11:22:33:44:55:88");
        assert_eq!(ranked[0].channel, 6);
    }
}
