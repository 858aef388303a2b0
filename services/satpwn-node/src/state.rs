use satpwn_core::{EngineSnapshot, HomeAnchor, Mode, Observation};
use tokio::sync::{mpsc, oneshot, watch};

/// Requests from the dashboard to the epoch loop
#[derive(Debug)]
pub enum Command {
    CycleMode { reply: oneshot::Sender<Mode> },
    ResetHome { reply: oneshot::Sender<Option<HomeAnchor>> },
}

/// Shared handler state. Reads come from the published snapshot; every write
/// is a message to the epoch loop.
pub struct AppState {
    pub snapshot: watch::Receiver<EngineSnapshot>,
    pub observations: mpsc::Sender<Vec<Observation>>,
    pub commands: mpsc::Sender<Command>,
}

impl AppState {
    pub fn new(
        snapshot: watch::Receiver<EngineSnapshot>,
        observations: mpsc::Sender<Vec<Observation>>,
        commands: mpsc::Sender<Command>,
    ) -> Self {
        AppState {
            snapshot,
            observations,
            commands,
        }
    }

    /// Latest published snapshot
    pub fn current(&self) -> EngineSnapshot {
        self.snapshot.borrow().clone()
    }
}
