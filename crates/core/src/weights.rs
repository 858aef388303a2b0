//! Per-channel weights.
//!
//! [`compute_weights`] is a pure function of the memory store, the scorer and
//! the concrete mode. [`WeightCache`] memoizes its result keyed on the store
//! revision and the mode, throttled by a minimum recompute interval and
//! refreshed after a maximum age.

use serde::Serialize;
use tracing::debug;

use crate::config::{EpochConfig, WeightingConfig};
use crate::memory::MemoryStore;
use crate::mode::ActiveMode;
use crate::scorer::ClientScorer;
use crate::types::{age_ms, Channel, TimestampMs, MS_PER_SEC};

/// Derived statistics for one channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelStat {
    pub channel: Channel,
    pub access_points: usize,
    pub clients: usize,
    pub handshakes: u64,
    /// Sum of client scores on the channel
    pub activity: f64,
    /// Weight before mode adjustment
    pub base_weight: f64,
    /// Mode-adjusted weight used for selection
    pub weight: f64,
    /// A client on this channel produced a handshake inside the aggression window
    pub recent_handshake: bool,
    pub pmkid_friendly: bool,
}

impl ChannelStat {
    fn empty(channel: Channel) -> Self {
        Self {
            channel,
            access_points: 0,
            clients: 0,
            handshakes: 0,
            activity: 0.0,
            base_weight: 0.0,
            weight: 0.0,
            recent_handshake: false,
            pmkid_friendly: false,
        }
    }
}

/// Weights for every supported channel, ascending by channel number
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelWeights {
    pub mode: ActiveMode,
    pub computed_at_ms: TimestampMs,
    /// Store revision the weights were computed from
    pub revision: u64,
    pub stats: Vec<ChannelStat>,
}

impl ChannelWeights {
    pub fn stat(&self, channel: Channel) -> Option<&ChannelStat> {
        self.stats.iter().find(|s| s.channel == channel)
    }

    /// Mode-adjusted weight, 0 for channels outside the set
    pub fn weight(&self, channel: Channel) -> f64 {
        self.stat(channel).map(|s| s.weight).unwrap_or(0.0)
    }

    pub fn channels(&self) -> impl Iterator<Item = Channel> + '_ {
        self.stats.iter().map(|s| s.channel)
    }

    /// Mode-independent activity across all channels, used by Auto resolution
    pub fn data_volume(&self) -> f64 {
        self.stats.iter().map(|s| s.base_weight).sum()
    }

    pub fn is_all_zero(&self) -> bool {
        self.stats.iter().all(|s| s.weight <= 0.0)
    }
}

/// Compute weights for every supported channel
pub fn compute_weights(
    store: &MemoryStore,
    scorer: &ClientScorer,
    mode: ActiveMode,
    now: TimestampMs,
    config: &WeightingConfig,
) -> ChannelWeights {
    let mut stats: Vec<ChannelStat> = store
        .supported_channels()
        .iter()
        .map(|&channel| ChannelStat::empty(channel))
        .collect();

    let aggression_window_ms = config.aggression_window_secs * MS_PER_SEC;
    let is_recent =
        |at: Option<TimestampMs>| at.map_or(false, |at| age_ms(now, at) <= aggression_window_ms);

    for ap in store.access_points() {
        let Some(stat) = stats.iter_mut().find(|s| s.channel == ap.channel) else {
            continue;
        };
        stat.access_points += 1;
        stat.handshakes += ap.handshakes as u64;
        if is_recent(ap.last_handshake_ms) {
            stat.recent_handshake = true;
        }
        for client in ap.clients.values() {
            stat.clients += 1;
            stat.activity += scorer.score(client, now);
            if is_recent(client.last_handshake_ms) {
                stat.recent_handshake = true;
            }
        }
    }

    for stat in &mut stats {
        let mut base =
            stat.activity * config.client_weight + stat.handshakes as f64 * config.handshake_weight;
        stat.pmkid_friendly =
            stat.access_points > config.pmkid_ap_threshold && stat.access_points > stat.clients;
        if stat.pmkid_friendly {
            base *= config.pmkid_boost;
        }
        stat.base_weight = base;

        let adjusted = match mode {
            ActiveMode::Loose => base + config.exploration_bonus,
            ActiveMode::DriveBy if stat.recent_handshake => base * config.aggression_multiplier,
            ActiveMode::DriveBy | ActiveMode::Strict | ActiveMode::Recon => base,
        };
        stat.weight = adjusted.max(config.idle_floor);
    }

    ChannelWeights {
        mode,
        computed_at_ms: now,
        revision: store.revision(),
        stats,
    }
}

/// Memoized [`compute_weights`]
#[derive(Debug, Clone)]
pub struct WeightCache {
    config: WeightingConfig,
    min_interval_ms: u64,
    max_age_ms: u64,
    entry: Option<ChannelWeights>,
    recomputations: u64,
}

impl WeightCache {
    pub fn new(config: WeightingConfig, epoch: &EpochConfig) -> Self {
        Self {
            config,
            min_interval_ms: epoch.weight_min_interval_secs * MS_PER_SEC,
            max_age_ms: epoch.weight_max_age_secs * MS_PER_SEC,
            entry: None,
            recomputations: 0,
        }
    }

    /// Number of times weights were actually computed
    pub fn recomputations(&self) -> u64 {
        self.recomputations
    }

    /// Last computed weights, if any
    pub fn current(&self) -> Option<&ChannelWeights> {
        self.entry.as_ref()
    }

    fn is_stale(&self, store: &MemoryStore, mode: ActiveMode, now: TimestampMs) -> bool {
        match &self.entry {
            None => true,
            Some(entry) => {
                let age = age_ms(now, entry.computed_at_ms);
                entry.mode != mode
                    || age >= self.max_age_ms
                    || (entry.revision != store.revision() && age >= self.min_interval_ms)
            }
        }
    }

    /// Cached weights, recomputed when the mode changed, the entry expired, or
    /// the store changed and the throttle interval has passed. `force` always
    /// recomputes.
    pub fn get(
        &mut self,
        store: &MemoryStore,
        scorer: &ClientScorer,
        mode: ActiveMode,
        now: TimestampMs,
        force: bool,
    ) -> &ChannelWeights {
        if force || self.is_stale(store, mode, now) {
            self.entry = None;
        }
        if self.entry.is_none() {
            self.recomputations += 1;
            debug!(mode = %mode, revision = store.revision(), "Recomputing channel weights");
        }
        let config = &self.config;
        self.entry
            .get_or_insert_with(|| compute_weights(store, scorer, mode, now, config))
    }
}
