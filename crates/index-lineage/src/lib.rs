pub mod browse;
pub mod cache;
pub mod cancel;
pub mod catalog;
pub mod checkpoints;
pub mod config;
pub mod cycles;
pub mod engine;
pub mod error;
pub mod fsutil;
pub mod indexdb;
pub mod joblog;
pub mod layout;
pub mod logging;
pub mod model;
pub mod playback;
pub mod pruning;
pub mod sanitize;

pub use browse::{BrowseQuery, Provenance, ResolvedSegment};
pub use cancel::CancelToken;
pub use engine::{IndexLineage, Ingested, LineageStatus};
pub use error::{Error, Result};
pub use model::{BackupLevel, CheckpointId, CycleId, Job, JobId, VersionEvent};
