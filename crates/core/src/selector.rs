//! Next-channel selection.
//!
//! Strict and Drive-by sample channels proportionally to weight. Loose does the
//! same but replaces the sample with a uniform pick at a fixed probability.
//! Recon ignores weights and sweeps the channel list in order.

use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::trace;

use crate::error::ConfigError;
use crate::mode::ActiveMode;
use crate::types::Channel;
use crate::weights::ChannelWeights;

/// How a channel was picked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Proportional to weight
    Weighted,
    /// Every weight was zero
    UniformFallback,
    /// Loose mode override
    Exploration,
    ReconSweep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Selection {
    pub channel: Channel,
    pub strategy: SelectionStrategy,
}

/// Channels visited since Recon was entered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconProgress {
    pub surveyed: usize,
    pub total: usize,
}

impl ReconProgress {
    pub fn is_complete(&self) -> bool {
        self.surveyed >= self.total
    }
}

/// Channel selector over a fixed channel list
#[derive(Debug, Clone)]
pub struct ChannelSelector<R = StdRng> {
    channels: Vec<Channel>,
    exploration_probability: f64,
    rng: R,
    recon_cursor: usize,
    recon_visited: BTreeSet<Channel>,
}

impl ChannelSelector<StdRng> {
    /// Reproducible selector for a given seed
    pub fn seeded(
        channels: Vec<Channel>,
        exploration_probability: f64,
        seed: u64,
    ) -> Result<Self, ConfigError> {
        Self::with_rng(channels, exploration_probability, StdRng::seed_from_u64(seed))
    }

    /// Selector seeded from OS entropy
    pub fn from_entropy(
        channels: Vec<Channel>,
        exploration_probability: f64,
    ) -> Result<Self, ConfigError> {
        Self::with_rng(channels, exploration_probability, StdRng::from_entropy())
    }
}

impl<R: Rng> ChannelSelector<R> {
    pub fn with_rng(
        channels: Vec<Channel>,
        exploration_probability: f64,
        rng: R,
    ) -> Result<Self, ConfigError> {
        if channels.is_empty() {
            return Err(ConfigError::Validation(
                "channel selector needs at least one channel".to_string(),
            ));
        }
        Ok(Self {
            channels,
            exploration_probability: exploration_probability.clamp(0.0, 1.0),
            rng,
            recon_cursor: 0,
            recon_visited: BTreeSet::new(),
        })
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Pick the channel to observe next
    pub fn select_next(&mut self, weights: &ChannelWeights, mode: ActiveMode) -> Selection {
        let selection = match mode {
            ActiveMode::Recon => self.recon_step(),
            ActiveMode::Loose if self.rng.gen_bool(self.exploration_probability) => Selection {
                channel: self.uniform(),
                strategy: SelectionStrategy::Exploration,
            },
            ActiveMode::Strict | ActiveMode::Loose | ActiveMode::DriveBy => self.weighted(weights),
        };
        trace!(channel = selection.channel, strategy = ?selection.strategy, "Selected channel");
        selection
    }

    /// Restart the Recon sweep from the first channel
    pub fn reset_recon(&mut self) {
        self.recon_cursor = 0;
        self.recon_visited.clear();
    }

    pub fn recon_progress(&self) -> ReconProgress {
        ReconProgress {
            surveyed: self.recon_visited.len(),
            total: self.channels.len(),
        }
    }

    fn recon_step(&mut self) -> Selection {
        let channel = self.channels[self.recon_cursor % self.channels.len()];
        self.recon_cursor = (self.recon_cursor + 1) % self.channels.len();
        self.recon_visited.insert(channel);
        Selection {
            channel,
            strategy: SelectionStrategy::ReconSweep,
        }
    }

    fn uniform(&mut self) -> Channel {
        self.channels[self.rng.gen_range(0..self.channels.len())]
    }

    fn weighted(&mut self, weights: &ChannelWeights) -> Selection {
        let candidates: Vec<(Channel, f64)> = self
            .channels
            .iter()
            .map(|&channel| (channel, weights.weight(channel)))
            .filter(|(_, weight)| weight.is_finite() && *weight > 0.0)
            .collect();

        match WeightedIndex::new(candidates.iter().map(|(_, weight)| *weight)) {
            Ok(distribution) => Selection {
                channel: candidates[distribution.sample(&mut self.rng)].0,
                strategy: SelectionStrategy::Weighted,
            },
            Err(_) => Selection {
                channel: self.uniform(),
                strategy: SelectionStrategy::UniformFallback,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::ChannelStat;
    use std::collections::HashMap;

    const CHANNELS: [Channel; 5] = [1, 6, 11, 3, 9];

    fn weights(pairs: &[(Channel, f64)], mode: ActiveMode) -> ChannelWeights {
        ChannelWeights {
            mode,
            computed_at_ms: 0,
            revision: 0,
            stats: pairs
                .iter()
                .map(|&(channel, weight)| ChannelStat {
                    channel,
                    access_points: 0,
                    clients: 0,
                    handshakes: 0,
                    activity: weight,
                    base_weight: weight,
                    weight,
                    recent_handshake: false,
                    pmkid_friendly: false,
                })
                .collect(),
        }
    }

    fn zero_weights() -> ChannelWeights {
        let pairs: Vec<_> = CHANNELS.iter().map(|&c| (c, 0.0)).collect();
        weights(&pairs, ActiveMode::Strict)
    }

    fn selector(seed: u64) -> ChannelSelector {
        ChannelSelector::seeded(CHANNELS.to_vec(), 0.1, seed).unwrap()
    }

    #[test]
    fn test_empty_channel_list_rejected() {
        assert!(ChannelSelector::seeded(Vec::new(), 0.1, 1).is_err());
    }

    #[test]
    fn test_recon_full_coverage_per_cycle() {
        let mut s = selector(7);
        let w = zero_weights();
        let k = CHANNELS.len();
        let picks: Vec<Channel> = (0..3 * k)
            .map(|_| s.select_next(&w, ActiveMode::Recon).channel)
            .collect();

        for window in picks.chunks(k) {
            assert_eq!(window, &CHANNELS[..]);
        }
        assert!(s.recon_progress().is_complete());
    }

    #[test]
    fn test_recon_reset_restarts_sweep() {
        let mut s = selector(7);
        let w = zero_weights();
        s.select_next(&w, ActiveMode::Recon);
        s.select_next(&w, ActiveMode::Recon);
        assert_eq!(s.recon_progress(), ReconProgress { surveyed: 2, total: 5 });

        s.reset_recon();
        assert_eq!(s.recon_progress().surveyed, 0);
        assert_eq!(s.select_next(&w, ActiveMode::Recon).channel, CHANNELS[0]);
    }

    #[test]
    fn test_strict_only_picks_weighted_channels() {
        let mut s = selector(1);
        let w = weights(&[(1, 0.0), (6, 4.0), (11, 0.0), (3, 0.0), (9, 0.0)], ActiveMode::Strict);
        for _ in 0..200 {
            let selection = s.select_next(&w, ActiveMode::Strict);
            assert_eq!(selection.channel, 6);
            assert_eq!(selection.strategy, SelectionStrategy::Weighted);
        }
    }

    #[test]
    fn test_weighted_sampling_is_proportional() {
        let mut s = selector(99);
        let w = weights(&[(1, 1.0), (6, 3.0), (11, 0.0), (3, 0.0), (9, 0.0)], ActiveMode::DriveBy);
        let n = 20_000;
        let sixes = (0..n)
            .filter(|_| s.select_next(&w, ActiveMode::DriveBy).channel == 6)
            .count();
        let share = sixes as f64 / n as f64;
        assert!((0.72..0.78).contains(&share), "share was {}", share);
    }

    #[test]
    fn test_all_zero_falls_back_to_uniform() {
        let mut s = selector(3);
        let w = zero_weights();
        let mut seen: HashMap<Channel, usize> = HashMap::new();
        for _ in 0..500 {
            let selection = s.select_next(&w, ActiveMode::Strict);
            assert_eq!(selection.strategy, SelectionStrategy::UniformFallback);
            *seen.entry(selection.channel).or_default() += 1;
        }
        assert_eq!(seen.len(), CHANNELS.len());
    }

    #[test]
    fn test_loose_exploration_rate() {
        let mut s = selector(42);
        let w = weights(&[(1, 1.0), (6, 50.0), (11, 1.0), (3, 1.0), (9, 1.0)], ActiveMode::Loose);
        let n = 20_000;
        let explored = (0..n)
            .filter(|_| s.select_next(&w, ActiveMode::Loose).strategy == SelectionStrategy::Exploration)
            .count();
        let rate = explored as f64 / n as f64;
        assert!((0.09..0.11).contains(&rate), "rate was {}", rate);
    }

    #[test]
    fn test_strict_never_explores() {
        let mut s = selector(42);
        let w = weights(&[(1, 1.0), (6, 1.0), (11, 1.0), (3, 1.0), (9, 1.0)], ActiveMode::Strict);
        assert!((0..1_000).all(|_| {
            s.select_next(&w, ActiveMode::Strict).strategy == SelectionStrategy::Weighted
        }));
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let w = weights(&[(1, 1.0), (6, 2.0), (11, 3.0), (3, 0.5), (9, 0.0)], ActiveMode::Loose);
        let mut a = selector(2024);
        let mut b = selector(2024);
        let run_a: Vec<_> = (0..100).map(|_| a.select_next(&w, ActiveMode::Loose)).collect();
        let run_b: Vec<_> = (0..100).map(|_| b.select_next(&w, ActiveMode::Loose)).collect();
        assert_eq!(run_a, run_b);
    }
}
