//! Adaptive channel selection and mode engine for the SATpwn Wi-Fi
//! reconnaissance device.
//!
//! The crate is runtime agnostic: [`EpochScheduler`] owns all mutable state and
//! is driven one epoch at a time by the host, which also decides where the
//! memory file is written and how snapshots are served.

pub mod attack;
pub mod config;
pub mod error;
pub mod geo;
pub mod logging;
pub mod memory;
pub mod mode;
pub mod observation;
pub mod persist;
pub mod scheduler;
pub mod scorer;
pub mod selector;
pub mod types;
pub mod weights;

pub use attack::{AttackDecision, AttackGate};
pub use config::{EngineConfig, ModeProfile, TtlPolicy};
pub use error::{ConfigError, EngineError, InputError, PersistenceError, Result};
pub use geo::{haversine_distance, GeoCoordinate, GpsFix, GpsStatus, Motion, MotionTracker};
pub use memory::{AccessPoint, Client, HomeAnchor, MemoryStore, PruneReport, UpsertOutcome};
pub use mode::{ActiveMode, AutoSignals, Mode, ModeStateMachine, Resolution, ResolutionReason};
pub use observation::{ApSighting, ClientSighting, GpsReading, HandshakeEvent, Observation};
pub use persist::{LoadStatus, MemoryFile, MEMORY_SCHEMA_VERSION};
pub use scheduler::{
    AttackTarget, AttackTrigger, EngineSnapshot, EpochOutcome, EpochScheduler, PersistenceStatus,
    RadioControl,
};
pub use scorer::{ClientScorer, RankedClient};
pub use selector::{ChannelSelector, ReconProgress, Selection, SelectionStrategy};
pub use types::{now_ms, Channel, MacAddr, TimestampMs};
pub use weights::{compute_weights, ChannelStat, ChannelWeights, WeightCache};
