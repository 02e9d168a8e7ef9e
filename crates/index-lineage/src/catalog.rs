//! Persisted checkpoint catalog. The checkpoint store only needs key/value
//! access by ordinal plus an intersecting-range query, so any backing store
//! can sit behind [`CatalogBackend`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fsutil;
use crate::model::{CheckpointId, CycleId, JobId, TimeRange, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    Valid,
    Invalidated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: CheckpointId,
    pub start_ts: Timestamp,
    pub end_ts: Timestamp,
    pub covered_cycles: Vec<CycleId>,
    /// Jobs present when the checkpoint was minted.
    pub covered_jobs: Vec<JobId>,
    pub validity: Validity,
    /// Snapshot directory relative to the entity cache directory.
    pub snapshot_ref: String,
    pub created_at: String,
    #[serde(default)]
    pub invalidated_at: Option<String>,
    #[serde(default)]
    pub invalidation_reason: Option<String>,
}

impl CheckpointRecord {
    pub fn is_valid(&self) -> bool {
        self.validity == Validity::Valid
    }

    pub fn intersects(&self, range: TimeRange) -> bool {
        range.intersects(self.start_ts, self.end_ts)
    }

    pub fn covers_cycle(&self, cycle: CycleId) -> bool {
        self.covered_cycles.contains(&cycle)
    }

    /// The job's cycle is covered and the job already existed at mint time.
    pub fn contains_job(&self, job: JobId, cycle: CycleId) -> bool {
        self.covers_cycle(cycle) && self.covered_jobs.contains(&job)
    }
}

pub trait CatalogBackend: Send + Sync {
    /// Inserts or replaces the record with the same id.
    fn put(&self, rec: &CheckpointRecord) -> Result<()>;

    fn get(&self, id: CheckpointId) -> Result<Option<CheckpointRecord>>;

    /// Every record, ascending by id.
    fn all(&self) -> Result<Vec<CheckpointRecord>>;

    /// Records whose span intersects `range`, ascending by id.
    fn range(&self, range: TimeRange) -> Result<Vec<CheckpointRecord>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|r| r.intersects(range))
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCatalog {
    records: RwLock<BTreeMap<CheckpointId, CheckpointRecord>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> Error {
    Error::io(
        "checkpoint catalog lock poisoned",
        std::io::Error::other("poisoned"),
    )
}

impl CatalogBackend for MemoryCatalog {
    fn put(&self, rec: &CheckpointRecord) -> Result<()> {
        let mut g = self.records.write().map_err(|_| poisoned())?;
        g.insert(rec.id, rec.clone());
        Ok(())
    }

    fn get(&self, id: CheckpointId) -> Result<Option<CheckpointRecord>> {
        let g = self.records.read().map_err(|_| poisoned())?;
        Ok(g.get(&id).cloned())
    }

    fn all(&self) -> Result<Vec<CheckpointRecord>> {
        let g = self.records.read().map_err(|_| poisoned())?;
        Ok(g.values().cloned().collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogDoc {
    version: u32,
    entity: String,
    checkpoints: BTreeMap<u64, CheckpointRecord>,
}

/// JSON document on disk, rewritten atomically under the entity's store
/// lock so that separate processes never interleave catalog updates.
#[derive(Debug, Clone)]
pub struct JsonFileCatalog {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    entity: String,
}

impl JsonFileCatalog {
    pub fn new(
        path: impl Into<PathBuf>,
        lock_path: impl Into<PathBuf>,
        lock_timeout: Duration,
        entity: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            lock_path: lock_path.into(),
            lock_timeout,
            entity: entity.into(),
        }
    }

    fn load(&self) -> Result<CatalogDoc> {
        let doc = fsutil::read_json::<CatalogDoc>(&self.path)?.unwrap_or_else(|| CatalogDoc {
            version: 1,
            entity: self.entity.clone(),
            checkpoints: BTreeMap::new(),
        });
        if doc.entity != self.entity {
            return Err(Error::config(format!(
                "catalog {} belongs to entity '{}', expected '{}'",
                self.path.display(),
                doc.entity,
                self.entity
            )));
        }
        Ok(doc)
    }
}

impl CatalogBackend for JsonFileCatalog {
    fn put(&self, rec: &CheckpointRecord) -> Result<()> {
        let _lock = fsutil::acquire_store_lock(&self.lock_path, self.lock_timeout)?;
        let mut doc = self.load()?;
        doc.checkpoints.insert(rec.id.get(), rec.clone());
        fsutil::write_json(&self.path, &doc)
    }

    fn get(&self, id: CheckpointId) -> Result<Option<CheckpointRecord>> {
        Ok(self.load()?.checkpoints.remove(&id.get()))
    }

    fn all(&self) -> Result<Vec<CheckpointRecord>> {
        Ok(self.load()?.checkpoints.into_values().collect())
    }
}
