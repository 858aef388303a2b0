//! Single-owner epoch loop.
//!
//! The [`EngineRuntime`] task is the only code that touches the
//! [`EpochScheduler`]. Observations and dashboard commands arrive over
//! channels, snapshots leave over a `watch` channel, and memory writes are
//! handed to the [`Persister`] task so disk latency never delays an epoch.

use satpwn_core::persist::{self, MemoryFile};
use satpwn_core::{
    now_ms, AttackTarget, AttackTrigger, Channel, EngineSnapshot, EpochScheduler, Observation,
    PersistenceError, RadioControl, TimestampMs,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::state::{AppState, Command};

/// Queued observation batches before the dashboard gets `429`
const OBSERVATION_QUEUE_DEPTH: usize = 256;
const COMMAND_QUEUE_DEPTH: usize = 16;
/// Events held between epochs; the excess is dropped
const MAX_PENDING_OBSERVATIONS: usize = 10_000;

/// Outcome of one background write
#[derive(Debug)]
pub struct SaveReport {
    pub at: TimestampMs,
    pub result: Result<(), PersistenceError>,
}

/// Background writer for the memory file. One write in flight at a time.
pub struct Persister {
    files: mpsc::Sender<MemoryFile>,
    reports: mpsc::UnboundedReceiver<SaveReport>,
    task: JoinHandle<()>,
}

impl Persister {
    pub fn spawn(path: PathBuf) -> Self {
        let (files, mut queue) = mpsc::channel::<MemoryFile>(1);
        let (report_tx, reports) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Some(file) = queue.recv().await {
                let at = file.saved_at_ms;
                let target = path.clone();
                let result =
                    match tokio::task::spawn_blocking(move || persist::write_atomic(&target, &file))
                        .await
                    {
                        Ok(result) => result,
                        Err(join_error) => Err(PersistenceError::Io(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            join_error.to_string(),
                        ))),
                    };
                if report_tx.send(SaveReport { at, result }).is_err() {
                    break;
                }
            }
        });

        Self {
            files,
            reports,
            task,
        }
    }
}

/// Radio adapter for hosts without direct radio access
#[derive(Debug, Default)]
pub struct LoggingRadio {
    current: Option<Channel>,
}

impl RadioControl for LoggingRadio {
    fn set_channel(&mut self, channel: Channel) {
        if self.current != Some(channel) {
            debug!(channel, "Tuning radio");
            self.current = Some(channel);
        }
    }
}

/// Attack adapter that only reports cleared targets
#[derive(Debug, Default)]
pub struct LoggingTrigger;

impl AttackTrigger for LoggingTrigger {
    fn trigger(&mut self, target: &AttackTarget) {
        info!(
            bssid = %target.bssid,
            client = %target.mac,
            channel = target.channel,
            "Attack requested"
        );
    }
}

pub struct EngineRuntime {
    scheduler: EpochScheduler,
    persister: Persister,
    snapshots: watch::Sender<EngineSnapshot>,
    observations: mpsc::Receiver<Vec<Observation>>,
    commands: mpsc::Receiver<Command>,
    period: Duration,
    pending: Vec<Observation>,
    radio: LoggingRadio,
    trigger: LoggingTrigger,
}

impl EngineRuntime {
    /// Wire the runtime and the handler state together
    pub fn new(scheduler: EpochScheduler, persister: Persister) -> (Self, AppState) {
        let now = now_ms();
        let (snapshots, snapshot_rx) = watch::channel(scheduler.snapshot(now));
        let (observation_tx, observations) = mpsc::channel(OBSERVATION_QUEUE_DEPTH);
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let period = Duration::from_secs(scheduler.config().epoch.period_secs);

        let runtime = Self {
            scheduler,
            persister,
            snapshots,
            observations,
            commands,
            period,
            pending: Vec::new(),
            radio: LoggingRadio::default(),
            trigger: LoggingTrigger,
        };
        let state = AppState::new(snapshot_rx, observation_tx, command_tx);
        (runtime, state)
    }

    /// Run until `shutdown` flips to true, then apply anything still queued
    /// and write the memory file one last time.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_secs = self.period.as_secs(), "Epoch loop started");

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(command) = self.commands.recv() => self.handle_command(command),
                Some(report) = self.persister.reports.recv() => {
                    self.scheduler.record_save_result(report.at, &report.result);
                }
                _ = interval.tick() => self.run_epoch(),
                Some(batch) = self.observations.recv() => self.queue(batch),
            }
        }

        self.shutdown().await;
    }

    fn queue(&mut self, batch: Vec<Observation>) {
        let room = MAX_PENDING_OBSERVATIONS.saturating_sub(self.pending.len());
        if batch.len() > room {
            warn!(
                dropped = batch.len() - room,
                "Observation buffer full, dropping events"
            );
        }
        self.pending.extend(batch.into_iter().take(room));
    }

    fn run_epoch(&mut self) {
        let now = now_ms();
        let outcome = self.scheduler.tick(self.pending.drain(..), now);
        outcome.dispatch(&mut self.radio, &mut self.trigger);
        if outcome.save_due {
            self.request_save(now);
        }
        self.publish(now);
    }

    fn handle_command(&mut self, command: Command) {
        let now = now_ms();
        match command {
            Command::CycleMode { reply } => {
                let mode = self.scheduler.cycle_mode(now);
                self.publish(now);
                let _ = reply.send(mode);
            }
            Command::ResetHome { reply } => {
                let previous = self.scheduler.clear_home_anchor();
                self.publish(now);
                let _ = reply.send(previous);
            }
        }
    }

    fn request_save(&mut self, now: TimestampMs) {
        match self.persister.files.try_send(self.scheduler.memory_file(now)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("Previous save still in flight, deferring");
                self.scheduler.request_save();
            }
            Err(TrySendError::Closed(_)) => {
                error!("Persister stopped, memory is no longer saved");
            }
        }
    }

    fn publish(&self, now: TimestampMs) {
        self.snapshots.send_replace(self.scheduler.snapshot(now));
    }

    async fn shutdown(mut self) {
        while let Ok(batch) = self.observations.try_recv() {
            self.queue(batch);
        }
        let now = now_ms();
        if !self.pending.is_empty() {
            let outcome = self.scheduler.tick(self.pending.drain(..), now);
            debug!(applied = outcome.applied, "Final epoch before shutdown");
        }

        let Persister {
            files,
            mut reports,
            task,
        } = self.persister;
        if files.send(self.scheduler.memory_file(now)).await.is_err() {
            error!("Persister stopped before the final save");
        }
        drop(files);
        if let Err(e) = task.await {
            error!(error = %e, "Persister task failed");
        }
        while let Ok(report) = reports.try_recv() {
            self.scheduler.record_save_result(report.at, &report.result);
        }

        match &self.scheduler.persistence().last_error {
            None => info!(epochs = self.scheduler.epoch(), "Epoch loop stopped, memory saved"),
            Some(e) => error!(error = %e, "Epoch loop stopped, final save failed"),
        }
        self.snapshots
            .send_replace(self.scheduler.snapshot(now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use satpwn_core::{ApSighting, EngineConfig, LoadStatus, MemoryStore, Mode};
    use tokio::sync::oneshot;

    fn scheduler(path: PathBuf) -> EpochScheduler {
        let mut config = EngineConfig::new(vec![1, 6, 11]);
        config.memory_path = path;
        config.epoch.period_secs = 3600;
        EpochScheduler::with_seed(config, MemoryStore::new(&[1, 6, 11]), LoadStatus::Fresh, 3, 0)
            .unwrap()
    }

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("satpwn_runtime_{}.json", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_shutdown_applies_queued_observations_and_saves() {
        let path = temp_path();
        let (runtime, state) = EngineRuntime::new(scheduler(path.clone()), Persister::spawn(path.clone()));
        state
            .observations
            .send(vec![Observation::AccessPoint(ApSighting {
                bssid: "aa:bb:cc:dd:ee:01".to_string(),
                ssid: "Cafe".to_string(),
                channel: 6,
                signal_dbm: -50,
                timestamp_ms: now_ms(),
            })])
            .await
            .unwrap();

        let (shutdown, shutdown_rx) = watch::channel(false);
        shutdown.send(true).unwrap();
        runtime.run(shutdown_rx).await;

        let (store, status) = persist::load(&path, &[1, 6, 11]);
        assert!(matches!(status, LoadStatus::Loaded { access_points: 1, .. }));
        assert_eq!(store.ap_count(), 1);
        assert_eq!(state.current().totals.access_points, 1);
        assert_eq!(state.current().persistence.last_error, None);
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_commands_publish_snapshot_before_reply() {
        let path = temp_path();
        let (runtime, state) = EngineRuntime::new(scheduler(path.clone()), Persister::spawn(path.clone()));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let engine = tokio::spawn(runtime.run(shutdown_rx));

        let (reply, response) = oneshot::channel();
        state.commands.send(Command::CycleMode { reply }).await.unwrap();
        assert_eq!(response.await.unwrap(), Mode::Loose);
        assert_eq!(state.current().mode, Mode::Loose);

        shutdown.send(true).unwrap();
        engine.await.unwrap();
        let _ = std::fs::remove_file(&path);
    }
}
