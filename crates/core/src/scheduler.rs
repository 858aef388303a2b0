//! Epoch scheduler.
//!
//! Owns every piece of mutable engine state and runs one decision pass per
//! tick, in this order:
//!
//! 1. apply buffered observations (bad events are logged and skipped)
//! 2. establish the home anchor when a home network is seen with a fresh fix
//! 3. prune with the TTLs of the mode currently in effect
//! 4. resolve the mode (Auto re-derives its concrete mode every tick)
//! 5. fetch throttled channel weights and select the next channel
//! 6. gate the clients on the selected channel
//!
//! Readers never see the scheduler itself; they get an [`EngineSnapshot`].

use serde::Serialize;
use tracing::{debug, info, info_span, warn};

use crate::attack::{AttackDecision, AttackGate};
use crate::config::EngineConfig;
use crate::error::{ConfigError, InputError, PersistenceError};
use crate::geo::{GpsStatus, MotionThresholds, MotionTracker};
use crate::memory::{HomeAnchor, MemoryStore, PruneReport};
use crate::mode::{ActiveMode, AutoSignals, Mode, ModeStateMachine, Resolution, ResolutionReason};
use crate::observation::Observation;
use crate::persist::{self, LoadStatus, MemoryFile};
use crate::scorer::{ClientScorer, RankedClient};
use crate::selector::{ChannelSelector, ReconProgress, Selection, SelectionStrategy};
use crate::types::{Channel, MacAddr, TimestampMs, MS_PER_SEC};
use crate::weights::{compute_weights, ChannelStat, WeightCache};

/// Radio collaborator that tunes to the selected channel
pub trait RadioControl {
    fn set_channel(&mut self, channel: Channel);
}

/// Collaborator that performs attacks the gate cleared
pub trait AttackTrigger {
    fn trigger(&mut self, target: &AttackTarget);
}

/// Client cleared by the attack gate this epoch
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AttackTarget {
    pub bssid: MacAddr,
    pub mac: MacAddr,
    pub channel: Channel,
    pub score: f64,
}

/// Result of one tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochOutcome {
    pub epoch: u64,
    pub timestamp_ms: TimestampMs,
    pub applied: usize,
    pub rejected: usize,
    pub pruned: PruneReport,
    pub weights_recomputed: bool,
    pub home_anchor_set: bool,
    pub mode: Mode,
    pub resolution: Resolution,
    /// The concrete mode differs from the previous epoch
    pub mode_changed: bool,
    pub selection: Selection,
    /// Clients evaluated by the gate
    pub evaluated: usize,
    pub attacks: Vec<AttackTarget>,
    /// The memory file should be written after this epoch
    pub save_due: bool,
}

impl EpochOutcome {
    /// Hand the decisions to the host collaborators
    pub fn dispatch(&self, radio: &mut dyn RadioControl, trigger: &mut dyn AttackTrigger) {
        radio.set_channel(self.selection.channel);
        for target in &self.attacks {
            trigger.trigger(target);
        }
    }
}

/// Outcome of the most recent memory file write
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersistenceStatus {
    pub last_save_ms: Option<TimestampMs>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl PersistenceStatus {
    pub fn is_degraded(&self) -> bool {
        self.last_error.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub access_points: usize,
    pub clients: usize,
    pub handshakes: u64,
}

/// Dashboard row for one access point
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApSummary {
    pub bssid: MacAddr,
    pub ssid: String,
    pub channel: Channel,
    pub signal_dbm: i32,
    pub last_seen_ms: TimestampMs,
    pub clients: usize,
    pub handshakes: u32,
}

/// Consistent read-only view of the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub epoch: u64,
    pub timestamp_ms: TimestampMs,
    pub mode: Mode,
    pub next_mode: Mode,
    pub active_mode: ActiveMode,
    /// e.g. `Auto (Drive-by)`
    pub mode_label: String,
    pub reason: ResolutionReason,
    pub last_switch_ms: TimestampMs,
    pub dwell_secs: Option<u64>,
    pub current_channel: Option<Channel>,
    pub last_selection: Option<Selection>,
    /// Present while Recon is in effect
    pub recon: Option<ReconProgress>,
    pub totals: Totals,
    pub channels: Vec<ChannelStat>,
    /// Most recently seen first
    pub access_points: Vec<ApSummary>,
    /// Best first
    pub clients: Vec<RankedClient>,
    pub home_anchor: Option<HomeAnchor>,
    pub gps: GpsStatus,
    pub load_status: LoadStatus,
    pub persistence: PersistenceStatus,
}

impl EngineSnapshot {
    /// Degraded-state messages for status displays
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.gps.is_fix() {
            warnings.push("GPS unavailable".to_string());
        }
        if self.load_status.is_degraded() {
            warnings.push(self.load_status.describe());
        }
        if let Some(error) = &self.persistence.last_error {
            warnings.push(format!("memory save failed: {}", error));
        }
        warnings
    }
}

/// Owner of all engine state
#[derive(Debug)]
pub struct EpochScheduler {
    config: EngineConfig,
    store: MemoryStore,
    load_status: LoadStatus,
    scorer: ClientScorer,
    weights: WeightCache,
    modes: ModeStateMachine,
    tracker: MotionTracker,
    selector: ChannelSelector,
    gate: AttackGate,
    epoch: u64,
    last_tick_ms: TimestampMs,
    last_selection: Option<Selection>,
    persistence: PersistenceStatus,
    save_pending: bool,
}

impl EpochScheduler {
    /// Load memory from `config.memory_path` and build a scheduler around it
    pub fn open(config: EngineConfig, now: TimestampMs) -> Result<Self, ConfigError> {
        config.validate()?;
        let (store, load_status) = persist::load(&config.memory_path, &config.supported_channels);
        if load_status.is_degraded() {
            warn!(status = %load_status.describe(), "Continuing with empty memory");
        } else {
            info!(status = %load_status.describe(), "Memory ready");
        }
        let selector = ChannelSelector::from_entropy(
            config.supported_channels.clone(),
            config.selection.exploration_probability,
        )?;
        Ok(Self::assemble(config, store, load_status, selector, now))
    }

    /// Scheduler with a seeded selector
    pub fn with_seed(
        config: EngineConfig,
        store: MemoryStore,
        load_status: LoadStatus,
        seed: u64,
        now: TimestampMs,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let selector = ChannelSelector::seeded(
            config.supported_channels.clone(),
            config.selection.exploration_probability,
            seed,
        )?;
        Ok(Self::assemble(config, store, load_status, selector, now))
    }

    fn assemble(
        config: EngineConfig,
        store: MemoryStore,
        load_status: LoadStatus,
        selector: ChannelSelector,
        now: TimestampMs,
    ) -> Self {
        let scorer = ClientScorer::new(config.scoring.clone());
        Self {
            weights: WeightCache::new(config.weighting.clone(), &config.epoch),
            modes: ModeStateMachine::new(config.initial_mode, config.auto.clone(), now),
            tracker: MotionTracker::new(config.auto.displacement_window_secs),
            gate: AttackGate::new(scorer.clone(), config.modes.clone()),
            scorer,
            selector,
            store,
            load_status,
            config,
            epoch: 0,
            last_tick_ms: now,
            last_selection: None,
            persistence: PersistenceStatus::default(),
            save_pending: false,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Time of the most recent tick
    pub fn last_tick_ms(&self) -> TimestampMs {
        self.last_tick_ms
    }

    pub fn mode(&self) -> Mode {
        self.modes.mode()
    }

    pub fn active_mode(&self) -> ActiveMode {
        self.modes.active()
    }

    pub fn load_status(&self) -> &LoadStatus {
        &self.load_status
    }

    pub fn persistence(&self) -> &PersistenceStatus {
        &self.persistence
    }

    /// Run one epoch
    pub fn tick<I>(&mut self, observations: I, now: TimestampMs) -> EpochOutcome
    where
        I: IntoIterator<Item = Observation>,
    {
        self.epoch += 1;
        let span = info_span!("epoch", epoch = self.epoch);
        let _enter = span.enter();

        let mut applied = 0;
        let mut rejected = 0;
        let mut home_seen: Option<String> = None;
        for observation in observations {
            match self.ingest(&observation, now) {
                Ok(()) => {
                    applied += 1;
                    if let Observation::AccessPoint(sighting) = &observation {
                        if self.config.is_home_ssid(&sighting.ssid) {
                            home_seen = Some(sighting.ssid.clone());
                        }
                    }
                }
                Err(error) => {
                    rejected += 1;
                    warn!(kind = observation.kind(), %error, "Skipping observation");
                }
            }
        }

        let home_anchor_set = match &home_seen {
            Some(ssid) => self.try_set_home_anchor(ssid, now),
            None => false,
        };

        let active_before = self.modes.active();
        let pruned = self
            .store
            .prune(now, self.config.modes.for_mode(active_before).ttl());
        if !pruned.is_empty() {
            debug!(
                clients = pruned.clients_removed,
                aps = pruned.aps_removed,
                "Pruned expired records"
            );
        }

        let recomputations_before = self.weights.recomputations();
        let data_volume = self
            .weights
            .get(&self.store, &self.scorer, active_before, now, false)
            .data_volume();
        let signals = self.auto_signals(home_seen.is_some(), data_volume, now);
        let resolution = self.modes.evaluate(&signals, now);
        let active = resolution.mode;

        let entering_recon = active == ActiveMode::Recon
            && self
                .last_selection
                .map_or(true, |s| s.strategy != SelectionStrategy::ReconSweep);
        if entering_recon {
            self.selector.reset_recon();
        }

        let weights = self
            .weights
            .get(&self.store, &self.scorer, active, now, false);
        let selection = self.selector.select_next(weights, active);
        let weights_recomputed = self.weights.recomputations() != recomputations_before;

        let (evaluated, attacks) = self.gate_channel(selection.channel, active, now);
        for target in &attacks {
            self.store.mark_attack(&target.bssid, &target.mac, now);
            info!(
                bssid = %target.bssid,
                client = %target.mac,
                channel = target.channel,
                score = target.score,
                "Attack gate cleared client"
            );
        }

        let mode_changed = active != active_before;
        let save_due = self.save_pending
            || mode_changed
            || self.epoch % self.config.epoch.save_interval_epochs == 0;
        self.save_pending = false;
        self.last_selection = Some(selection);
        self.last_tick_ms = now;

        debug!(
            mode = %self.modes.display_label(),
            channel = selection.channel,
            strategy = ?selection.strategy,
            applied,
            rejected,
            attacks = attacks.len(),
            "Epoch complete"
        );

        EpochOutcome {
            epoch: self.epoch,
            timestamp_ms: now,
            applied,
            rejected,
            pruned,
            weights_recomputed,
            home_anchor_set,
            mode: self.modes.mode(),
            resolution,
            mode_changed,
            selection,
            evaluated,
            attacks,
            save_due,
        }
    }

    fn ingest(&mut self, observation: &Observation, now: TimestampMs) -> Result<(), InputError> {
        let max_skew_ms = self.config.epoch.max_clock_skew_secs * MS_PER_SEC;
        let timestamp_ms = observation.timestamp_ms();
        if timestamp_ms > now.saturating_add(max_skew_ms) {
            return Err(InputError::TimestampOutOfRange {
                timestamp_ms,
                now_ms: now,
                max_skew_ms,
            });
        }
        match observation {
            Observation::Gps(reading) => {
                self.tracker.record(reading.to_fix()?);
            }
            other => {
                self.store.upsert(other)?;
            }
        }
        Ok(())
    }

    fn try_set_home_anchor(&mut self, ssid: &str, now: TimestampMs) -> bool {
        if self.store.home_anchor().is_some() {
            return false;
        }
        let Some(fix) = self.tracker.fresh(now, self.gps_stale_ms()).copied() else {
            debug!(ssid, "Home network visible without a GPS fix");
            return false;
        };
        let set = self.store.set_home_anchor(HomeAnchor {
            coordinate: fix.coordinate,
            ssid: ssid.to_string(),
            established_ms: now,
        });
        if set {
            info!(
                ssid,
                latitude = fix.coordinate.latitude,
                longitude = fix.coordinate.longitude,
                "Home anchor established"
            );
            self.save_pending = true;
        }
        set
    }

    fn gps_stale_ms(&self) -> u64 {
        self.config.auto.gps_stale_secs * MS_PER_SEC
    }

    fn auto_signals(&self, home_ssid_visible: bool, data_volume: f64, now: TimestampMs) -> AutoSignals {
        let stale_ms = self.gps_stale_ms();
        let fresh = self.tracker.fresh(now, stale_ms).copied();
        let thresholds = MotionThresholds {
            speed_mps: self.config.auto.moving_speed_mps,
            displacement_m: self.config.auto.displacement_threshold_m,
        };
        AutoSignals {
            home_ssid_visible,
            position: fresh.map(|fix| fix.coordinate),
            home_anchor: self.store.home_anchor().map(|anchor| anchor.coordinate),
            motion: self.tracker.motion(now, stale_ms, thresholds),
            speed_mps: fresh.and(self.tracker.speed_mps()),
            displacement_m: fresh.and(self.tracker.displacement_m()),
            data_volume,
        }
    }

    fn gate_channel(
        &self,
        channel: Channel,
        mode: ActiveMode,
        now: TimestampMs,
    ) -> (usize, Vec<AttackTarget>) {
        let gate = &self.gate;
        let mut evaluated = 0;
        let mut targets = Vec::new();
        for ap in self.store.access_points().filter(|ap| ap.channel == channel) {
            for client in ap.clients.values() {
                evaluated += 1;
                if let AttackDecision::Clear { score } =
                    gate.evaluate(client, mode, now, client.last_attack_ms)
                {
                    targets.push(AttackTarget {
                        bssid: ap.bssid,
                        mac: client.mac,
                        channel,
                        score,
                    });
                }
            }
        }
        (evaluated, targets)
    }

    /// Explicit user selection
    pub fn set_mode(&mut self, mode: Mode, now: TimestampMs) -> bool {
        let changed = self.modes.set_mode(mode, now);
        self.save_pending |= changed;
        changed
    }

    /// Dashboard mode-cycle button
    pub fn cycle_mode(&mut self, now: TimestampMs) -> Mode {
        let mode = self.modes.cycle(now);
        self.save_pending = true;
        mode
    }

    /// Ask for a save after the next epoch
    pub fn request_save(&mut self) {
        self.save_pending = true;
    }

    /// Explicit home reset
    pub fn clear_home_anchor(&mut self) -> Option<HomeAnchor> {
        let previous = self.store.clear_home_anchor();
        if let Some(anchor) = &previous {
            info!(ssid = %anchor.ssid, "Home anchor cleared");
            self.save_pending = true;
        }
        previous
    }

    /// Capture the memory for an off-loop write
    pub fn memory_file(&self, now: TimestampMs) -> MemoryFile {
        MemoryFile::from_store(&self.store, now)
    }

    /// Record the outcome of a memory file write
    pub fn record_save_result(&mut self, now: TimestampMs, result: &Result<(), PersistenceError>) {
        match result {
            Ok(()) => {
                self.persistence.last_save_ms = Some(now);
                self.persistence.last_error = None;
                self.persistence.consecutive_failures = 0;
            }
            Err(error) => {
                self.persistence.consecutive_failures += 1;
                self.persistence.last_error = Some(error.to_string());
                warn!(
                    %error,
                    failures = self.persistence.consecutive_failures,
                    "Failed to save memory, retrying on a later epoch"
                );
                self.save_pending = true;
            }
        }
    }

    /// Write the memory file synchronously
    pub fn save_now(&mut self, now: TimestampMs) -> Result<(), PersistenceError> {
        let result = persist::write_atomic(&self.config.memory_path, &self.memory_file(now));
        self.record_save_result(now, &result);
        result
    }

    /// Consistent read model for the dashboard
    pub fn snapshot(&self, now: TimestampMs) -> EngineSnapshot {
        let active = self.modes.active();
        let channels = match self.weights.current() {
            Some(weights) if weights.mode == active => weights.stats.clone(),
            _ => {
                compute_weights(&self.store, &self.scorer, active, now, &self.config.weighting).stats
            }
        };

        let mut access_points: Vec<ApSummary> = self
            .store
            .access_points()
            .map(|ap| ApSummary {
                bssid: ap.bssid,
                ssid: ap.ssid.clone(),
                channel: ap.channel,
                signal_dbm: ap.signal_dbm,
                last_seen_ms: ap.last_seen_ms,
                clients: ap.clients.len(),
                handshakes: ap.handshakes,
            })
            .collect();
        access_points.sort_by(|a, b| {
            b.last_seen_ms
                .cmp(&a.last_seen_ms)
                .then_with(|| a.bssid.cmp(&b.bssid))
        });

        let current_channel = self.last_selection.map(|s| s.channel);

        EngineSnapshot {
            epoch: self.epoch,
            timestamp_ms: now,
            mode: self.modes.mode(),
            next_mode: self.modes.mode().next(),
            active_mode: active,
            mode_label: self.modes.display_label(),
            reason: self.modes.resolution().reason,
            last_switch_ms: self.modes.last_switch_ms(),
            dwell_secs: self.modes.dwell_secs(now),
            current_channel,
            last_selection: self.last_selection,
            recon: (active == ActiveMode::Recon).then(|| self.selector.recon_progress()),
            totals: Totals {
                access_points: self.store.ap_count(),
                clients: self.store.client_count(),
                handshakes: self.store.handshake_total(),
            },
            channels,
            access_points,
            clients: self.scorer.rank(&self.store, now),
            home_anchor: self.store.home_anchor().cloned(),
            gps: self.tracker.status(now, self.gps_stale_ms()),
            load_status: self.load_status.clone(),
            persistence: self.persistence.clone(),
        }
    }
}
