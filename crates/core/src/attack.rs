//! Attack gating. Decides whether a client is worth an attack right now; it
//! never triggers one itself.

use serde::Serialize;

use crate::config::ModeProfiles;
use crate::memory::Client;
use crate::mode::ActiveMode;
use crate::scorer::ClientScorer;
use crate::types::{age_ms, TimestampMs};

/// Gate verdict for one client
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AttackDecision {
    Clear { score: f64 },
    BelowThreshold { score: f64, threshold: f64 },
    CoolingDown { remaining_ms: u64 },
    /// Recon never attacks
    Disabled,
}

impl AttackDecision {
    pub fn is_clear(&self) -> bool {
        matches!(self, AttackDecision::Clear { .. })
    }
}

#[derive(Debug, Clone)]
pub struct AttackGate {
    scorer: ClientScorer,
    profiles: ModeProfiles,
}

impl AttackGate {
    pub fn new(scorer: ClientScorer, profiles: ModeProfiles) -> Self {
        Self { scorer, profiles }
    }

    /// Check score against the mode threshold, then the mode cooldown.
    ///
    /// The cooldown has passed once strictly more than `attack_cooldown_secs`
    /// have elapsed since `last_attack_ms`.
    pub fn evaluate(
        &self,
        client: &Client,
        mode: ActiveMode,
        now: TimestampMs,
        last_attack_ms: Option<TimestampMs>,
    ) -> AttackDecision {
        if mode == ActiveMode::Recon {
            return AttackDecision::Disabled;
        }

        let profile = self.profiles.for_mode(mode);
        let score = self.scorer.score(client, now);
        if score < profile.attack_threshold {
            return AttackDecision::BelowThreshold {
                score,
                threshold: profile.attack_threshold,
            };
        }

        if let Some(last) = last_attack_ms {
            let cooldown_ms = profile.attack_cooldown_ms();
            let elapsed = age_ms(now, last);
            if elapsed <= cooldown_ms {
                return AttackDecision::CoolingDown {
                    remaining_ms: cooldown_ms - elapsed,
                };
            }
        }

        AttackDecision::Clear { score }
    }

    pub fn should_attack(
        &self,
        client: &Client,
        mode: ActiveMode,
        now: TimestampMs,
        last_attack_ms: Option<TimestampMs>,
    ) -> bool {
        self.evaluate(client, mode, now, last_attack_ms).is_clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModeProfile, ScoringConfig};
    use crate::memory::MemoryStore;
    use crate::observation::{ApSighting, ClientSighting};
    use crate::types::MacAddr;

    const MIN: u64 = 60_000;
    const AP: &str = "AA:BB:CC:DD:EE:01";
    const STA: &str = "11:22:33:44:55:66";

    fn store_with_handshake(now: u64) -> MemoryStore {
        let mut store = MemoryStore::new(&[1, 6, 11]);
        store
            .upsert_access_point(&ApSighting {
                bssid: AP.to_string(),
                ssid: "Target".to_string(),
                channel: 6,
                signal_dbm: -45,
                timestamp_ms: now - 2 * MIN,
            })
            .unwrap();
        store
            .upsert_client(&ClientSighting {
                mac: STA.to_string(),
                bssid: AP.to_string(),
                signal_dbm: -50,
                timestamp_ms: now,
            })
            .unwrap();
        let bssid: MacAddr = AP.parse().unwrap();
        let mac: MacAddr = STA.parse().unwrap();
        store.record_handshake(&bssid, &mac, now - 2 * MIN).unwrap();
        store
    }

    fn client(store: &MemoryStore) -> &Client {
        store
            .client(&AP.parse().unwrap(), &STA.parse().unwrap())
            .unwrap()
    }

    fn gate(drive_by: ModeProfile) -> AttackGate {
        AttackGate::new(
            ClientScorer::new(ScoringConfig::default()),
            ModeProfiles {
                standard: ModeProfile::standard(),
                drive_by,
            },
        )
    }

    #[test]
    fn test_drive_by_clears_scored_client_after_cooldown() {
        let now = 60 * MIN;
        let store = store_with_handshake(now);
        let gate = gate(ModeProfile {
            attack_threshold: 0.3,
            attack_cooldown_secs: 300,
            ..ModeProfile::drive_by()
        });
        let client = client(&store);

        let decision = gate.evaluate(client, ActiveMode::DriveBy, now, Some(now - 10 * MIN));
        match decision {
            AttackDecision::Clear { score } => assert!((score - 0.8).abs() < 1e-9),
            other => panic!("expected clear, got {:?}", other),
        }
        assert!(gate.should_attack(client, ActiveMode::DriveBy, now, Some(now - 10 * MIN)));
    }

    #[test]
    fn test_cooldown_blocks_recent_attack() {
        let now = 60 * MIN;
        let store = store_with_handshake(now);
        let gate = gate(ModeProfile::drive_by());
        let client = client(&store);

        assert_eq!(
            gate.evaluate(client, ActiveMode::DriveBy, now, Some(now - 30_000)),
            AttackDecision::CoolingDown { remaining_ms: 30_000 }
        );
        // Exactly at the cooldown is still cooling down
        assert!(!gate.should_attack(client, ActiveMode::DriveBy, now, Some(now - MIN)));
        assert!(gate.should_attack(client, ActiveMode::DriveBy, now, Some(now - MIN - 1)));
        assert!(gate.should_attack(client, ActiveMode::DriveBy, now, None));
    }

    #[test]
    fn test_recon_never_attacks() {
        let now = 60 * MIN;
        let store = store_with_handshake(now);
        let gate = gate(ModeProfile::drive_by());
        assert_eq!(
            gate.evaluate(client(&store), ActiveMode::Recon, now, None),
            AttackDecision::Disabled
        );
    }

    #[test]
    fn test_threshold_is_mode_specific() {
        let now = 60 * MIN;
        let mut store = MemoryStore::new(&[6]);
        store
            .upsert_access_point(&ApSighting {
                bssid: AP.to_string(),
                ssid: String::new(),
                channel: 6,
                signal_dbm: -70,
                timestamp_ms: now,
            })
            .unwrap();
        // Signal term 0.5, score 0.35: between drive-by (0.25) and standard (0.5)
        store
            .upsert_client(&ClientSighting {
                mac: STA.to_string(),
                bssid: AP.to_string(),
                signal_dbm: -65,
                timestamp_ms: now,
            })
            .unwrap();
        let gate = gate(ModeProfile::drive_by());
        let client = client(&store);

        assert!(gate.should_attack(client, ActiveMode::DriveBy, now, None));
        for mode in [ActiveMode::Strict, ActiveMode::Loose] {
            assert!(matches!(
                gate.evaluate(client, mode, now, None),
                AttackDecision::BelowThreshold { threshold, .. } if threshold == 0.5
            ));
        }
    }
}
