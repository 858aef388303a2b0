//! Durable model of access points, their clients and the home anchor.
//!
//! All mutation merges into existing records. [`MemoryStore::prune`] is the
//! only path that deletes APs or clients; [`MemoryStore::clear_home_anchor`]
//! is the only path that deletes the anchor.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

use crate::config::TtlPolicy;
use crate::error::InputError;
use crate::geo::GeoCoordinate;
use crate::observation::{parse_mac, ApSighting, ClientSighting, HandshakeEvent, Observation};
use crate::types::{age_ms, Channel, MacAddr, TimestampMs};

/// Weakest signal accepted from the host
pub const SIGNAL_MIN_DBM: i32 = -120;
/// Strongest signal accepted from the host
pub const SIGNAL_MAX_DBM: i32 = 0;
/// Signal samples retained per client
pub const SIGNAL_HISTORY_LEN: usize = 8;

/// One signal strength reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalSample {
    pub dbm: i32,
    pub timestamp_ms: TimestampMs,
}

/// Station associated with an access point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub mac: MacAddr,
    /// Parent access point
    pub bssid: MacAddr,
    /// Most recent samples, oldest first
    pub signal_history: VecDeque<SignalSample>,
    pub first_seen_ms: TimestampMs,
    /// Never decreases
    pub last_activity_ms: TimestampMs,
    #[serde(default)]
    pub handshakes: u32,
    #[serde(default)]
    pub last_handshake_ms: Option<TimestampMs>,
    #[serde(default)]
    pub last_attack_ms: Option<TimestampMs>,
}

impl Client {
    fn new(mac: MacAddr, bssid: MacAddr, signal_dbm: i32, timestamp_ms: TimestampMs) -> Self {
        let mut signal_history = VecDeque::with_capacity(SIGNAL_HISTORY_LEN);
        signal_history.push_back(SignalSample {
            dbm: signal_dbm,
            timestamp_ms,
        });
        Self {
            mac,
            bssid,
            signal_history,
            first_seen_ms: timestamp_ms,
            last_activity_ms: timestamp_ms,
            handshakes: 0,
            last_handshake_ms: None,
            last_attack_ms: None,
        }
    }

    /// Latest signal strength, or the weakest possible value without samples
    pub fn signal_dbm(&self) -> i32 {
        self.signal_history
            .back()
            .map(|s| s.dbm)
            .unwrap_or(SIGNAL_MIN_DBM)
    }

    /// Whether a handshake was ever captured
    pub fn has_handshake(&self) -> bool {
        self.handshakes > 0 || self.last_handshake_ms.is_some()
    }

    fn touch(&mut self, timestamp_ms: TimestampMs) {
        self.last_activity_ms = self.last_activity_ms.max(timestamp_ms);
    }

    fn record_signal(&mut self, dbm: i32, timestamp_ms: TimestampMs) {
        let newest = self.signal_history.back().map(|s| s.timestamp_ms);
        if newest.map_or(true, |t| timestamp_ms >= t) {
            self.signal_history.push_back(SignalSample { dbm, timestamp_ms });
            while self.signal_history.len() > SIGNAL_HISTORY_LEN {
                self.signal_history.pop_front();
            }
        }
        self.touch(timestamp_ms);
    }
}

/// Access point and the clients it owns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessPoint {
    pub bssid: MacAddr,
    pub ssid: String,
    pub channel: Channel,
    pub signal_dbm: i32,
    pub first_seen_ms: TimestampMs,
    pub last_seen_ms: TimestampMs,
    #[serde(default)]
    pub handshakes: u32,
    /// Latest handshake on this AP, including ones from clients not in memory
    #[serde(default)]
    pub last_handshake_ms: Option<TimestampMs>,
    #[serde(default)]
    pub clients: BTreeMap<MacAddr, Client>,
}

impl AccessPoint {
    fn new(bssid: MacAddr, sighting: &ApSighting) -> Self {
        Self {
            bssid,
            ssid: sighting.ssid.clone(),
            channel: sighting.channel,
            signal_dbm: sighting.signal_dbm,
            first_seen_ms: sighting.timestamp_ms,
            last_seen_ms: sighting.timestamp_ms,
            handshakes: 0,
            last_handshake_ms: None,
            clients: BTreeMap::new(),
        }
    }
}

/// Geofence center, established from a trusted network's location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HomeAnchor {
    pub coordinate: GeoCoordinate,
    /// Network that established the anchor
    pub ssid: String,
    pub established_ms: TimestampMs,
}

/// Result of applying one observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    /// Observation carries nothing the store keeps (GPS)
    Ignored,
}

/// Records removed by a pruning pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub clients_removed: usize,
    pub aps_removed: usize,
}

impl PruneReport {
    pub fn is_empty(&self) -> bool {
        self.clients_removed == 0 && self.aps_removed == 0
    }
}

/// In-memory AP/client model
#[derive(Debug, Clone)]
pub struct MemoryStore {
    aps: BTreeMap<MacAddr, AccessPoint>,
    home_anchor: Option<HomeAnchor>,
    supported: BTreeSet<Channel>,
    /// Bumped on every mutation
    revision: u64,
}

impl MemoryStore {
    /// Create an empty store accepting the given channels
    pub fn new(supported_channels: &[Channel]) -> Self {
        Self {
            aps: BTreeMap::new(),
            home_anchor: None,
            supported: supported_channels.iter().copied().collect(),
            revision: 0,
        }
    }

    /// Rebuild from persisted records, dropping APs on unsupported channels
    pub(crate) fn from_parts(
        supported_channels: &[Channel],
        access_points: impl IntoIterator<Item = AccessPoint>,
        home_anchor: Option<HomeAnchor>,
    ) -> Self {
        let mut store = Self::new(supported_channels);
        for mut ap in access_points {
            if !store.supported.contains(&ap.channel) {
                debug!(bssid = %ap.bssid, channel = ap.channel, "Dropping AP on unsupported channel");
                continue;
            }
            let bssid = ap.bssid;
            for client in ap.clients.values_mut() {
                client.bssid = bssid;
            }
            store.aps.insert(bssid, ap);
        }
        store.home_anchor = home_anchor;
        store
    }

    /// Change counter; differs whenever the model has been mutated
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn supported_channels(&self) -> &BTreeSet<Channel> {
        &self.supported
    }

    pub fn access_points(&self) -> impl Iterator<Item = &AccessPoint> {
        self.aps.values()
    }

    pub fn access_point(&self, bssid: &MacAddr) -> Option<&AccessPoint> {
        self.aps.get(bssid)
    }

    pub fn client(&self, bssid: &MacAddr, mac: &MacAddr) -> Option<&Client> {
        self.aps.get(bssid).and_then(|ap| ap.clients.get(mac))
    }

    pub fn ap_count(&self) -> usize {
        self.aps.len()
    }

    pub fn client_count(&self) -> usize {
        self.aps.values().map(|ap| ap.clients.len()).sum()
    }

    pub fn handshake_total(&self) -> u64 {
        self.aps.values().map(|ap| ap.handshakes as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.aps.is_empty() && self.home_anchor.is_none()
    }

    pub fn home_anchor(&self) -> Option<&HomeAnchor> {
        self.home_anchor.as_ref()
    }

    /// Merge one observation into the model
    pub fn upsert(&mut self, observation: &Observation) -> Result<UpsertOutcome, InputError> {
        match observation {
            Observation::AccessPoint(sighting) => self.upsert_access_point(sighting),
            Observation::Client(sighting) => self.upsert_client(sighting),
            Observation::Handshake(event) => {
                self.apply_handshake(event)?;
                Ok(UpsertOutcome::Updated)
            }
            Observation::Gps(_) => Ok(UpsertOutcome::Ignored),
        }
    }

    /// Create or refresh an access point
    pub fn upsert_access_point(
        &mut self,
        sighting: &ApSighting,
    ) -> Result<UpsertOutcome, InputError> {
        let bssid = parse_mac(&sighting.bssid)?;
        if !self.supported.contains(&sighting.channel) {
            return Err(InputError::UnsupportedChannel {
                channel: sighting.channel,
            });
        }
        validate_signal(sighting.signal_dbm)?;

        self.revision += 1;
        match self.aps.get_mut(&bssid) {
            Some(ap) => {
                if sighting.timestamp_ms >= ap.last_seen_ms {
                    ap.ssid = sighting.ssid.clone();
                    ap.channel = sighting.channel;
                    ap.signal_dbm = sighting.signal_dbm;
                    ap.last_seen_ms = sighting.timestamp_ms;
                }
                Ok(UpsertOutcome::Updated)
            }
            None => {
                self.aps.insert(bssid, AccessPoint::new(bssid, sighting));
                Ok(UpsertOutcome::Created)
            }
        }
    }

    /// Create or refresh a client under its parent AP.
    ///
    /// A client that shows up under a different AP is moved there, keeping its
    /// history, so a MAC is never owned by two APs.
    pub fn upsert_client(&mut self, sighting: &ClientSighting) -> Result<UpsertOutcome, InputError> {
        let mac = parse_mac(&sighting.mac)?;
        let bssid = parse_mac(&sighting.bssid)?;
        validate_signal(sighting.signal_dbm)?;

        if !self.aps.contains_key(&bssid) {
            return Err(InputError::OrphanClient {
                client: mac.to_string(),
                bssid: bssid.to_string(),
            });
        }

        let roamed = self.take_client_from_other_ap(&mac, &bssid);

        self.revision += 1;
        let ap = self
            .aps
            .get_mut(&bssid)
            .ok_or_else(|| InputError::UnknownAccessPoint {
                bssid: bssid.to_string(),
            })?;

        if let Some(mut client) = roamed {
            debug!(client = %mac, from = %client.bssid, to = %bssid, "Client roamed");
            client.bssid = bssid;
            client.record_signal(sighting.signal_dbm, sighting.timestamp_ms);
            ap.clients.insert(mac, client);
            return Ok(UpsertOutcome::Updated);
        }

        match ap.clients.get_mut(&mac) {
            Some(client) => {
                client.record_signal(sighting.signal_dbm, sighting.timestamp_ms);
                Ok(UpsertOutcome::Updated)
            }
            None => {
                ap.clients.insert(
                    mac,
                    Client::new(mac, bssid, sighting.signal_dbm, sighting.timestamp_ms),
                );
                Ok(UpsertOutcome::Created)
            }
        }
    }

    fn take_client_from_other_ap(&mut self, mac: &MacAddr, bssid: &MacAddr) -> Option<Client> {
        let owner = self
            .aps
            .iter()
            .find(|(key, ap)| *key != bssid && ap.clients.contains_key(mac))
            .map(|(key, _)| *key)?;
        self.aps.get_mut(&owner)?.clients.remove(mac)
    }

    fn apply_handshake(&mut self, event: &HandshakeEvent) -> Result<(), InputError> {
        let bssid = parse_mac(&event.bssid)?;
        let mac = parse_mac(&event.mac)?;
        self.record_handshake(&bssid, &mac, event.timestamp_ms)
    }

    /// Count a captured handshake on the AP and, when known, on the client
    pub fn record_handshake(
        &mut self,
        bssid: &MacAddr,
        mac: &MacAddr,
        timestamp_ms: TimestampMs,
    ) -> Result<(), InputError> {
        let ap = self
            .aps
            .get_mut(bssid)
            .ok_or_else(|| InputError::UnknownAccessPoint {
                bssid: bssid.to_string(),
            })?;

        self.revision += 1;
        ap.handshakes = ap.handshakes.saturating_add(1);
        ap.last_handshake_ms = Some(
            ap.last_handshake_ms
                .map_or(timestamp_ms, |t| t.max(timestamp_ms)),
        );

        match ap.clients.get_mut(mac) {
            Some(client) => {
                client.handshakes = client.handshakes.saturating_add(1);
                client.last_handshake_ms = Some(
                    client
                        .last_handshake_ms
                        .map_or(timestamp_ms, |t| t.max(timestamp_ms)),
                );
                client.touch(timestamp_ms);
            }
            None => {
                debug!(bssid = %bssid, client = %mac, "Handshake from client not in memory");
            }
        }
        Ok(())
    }

    /// Remember that an attack was triggered against a client
    pub fn mark_attack(&mut self, bssid: &MacAddr, mac: &MacAddr, timestamp_ms: TimestampMs) -> bool {
        match self.aps.get_mut(bssid).and_then(|ap| ap.clients.get_mut(mac)) {
            Some(client) => {
                client.last_attack_ms = Some(timestamp_ms);
                self.revision += 1;
                true
            }
            None => false,
        }
    }

    /// Set the home anchor if none exists. Returns whether it was set.
    pub fn set_home_anchor(&mut self, anchor: HomeAnchor) -> bool {
        if self.home_anchor.is_some() {
            return false;
        }
        self.home_anchor = Some(anchor);
        self.revision += 1;
        true
    }

    /// Explicit reset of the home anchor
    pub fn clear_home_anchor(&mut self) -> Option<HomeAnchor> {
        let previous = self.home_anchor.take();
        if previous.is_some() {
            self.revision += 1;
        }
        previous
    }

    /// Remove expired records.
    ///
    /// Clients older than the client TTL go first; an AP is removed only once
    /// it has no clients left and its own age exceeds the AP TTL.
    pub fn prune(&mut self, now: TimestampMs, ttl: TtlPolicy) -> PruneReport {
        let mut report = PruneReport::default();

        for ap in self.aps.values_mut() {
            let before = ap.clients.len();
            ap.clients
                .retain(|_, client| age_ms(now, client.last_activity_ms) <= ttl.client_ttl_ms);
            report.clients_removed += before - ap.clients.len();
        }

        let before = self.aps.len();
        self.aps
            .retain(|_, ap| !ap.clients.is_empty() || age_ms(now, ap.last_seen_ms) <= ttl.ap_ttl_ms);
        report.aps_removed = before - self.aps.len();

        if !report.is_empty() {
            self.revision += 1;
        }
        report
    }
}

fn validate_signal(dbm: i32) -> Result<(), InputError> {
    if (SIGNAL_MIN_DBM..=SIGNAL_MAX_DBM).contains(&dbm) {
        Ok(())
    } else {
        Err(InputError::SignalOutOfRange {
            dbm,
            min: SIGNAL_MIN_DBM,
            max: SIGNAL_MAX_DBM,
        })
    }
}
