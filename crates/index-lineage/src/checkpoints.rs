//! Checkpoint lifecycle: minting snapshots of contiguous cycle runs,
//! one-way invalidation, and the coverage lookups the browse router ranks.

use std::fs;
use std::sync::Arc;

use tracing::{info, warn};

use crate::cache::IndexCache;
use crate::cancel::CancelToken;
use crate::catalog::{CatalogBackend, CheckpointRecord, Validity};
use crate::error::{Error, Result};
use crate::indexdb::{self, IndexDbKind};
use crate::joblog::JobMetadata;
use crate::model::{CheckpointId, Cycle, CycleId, JobId, PlacedJob, TimeRange};
use crate::playback;

/// Most complete first: latest coverage end, then most recently created.
pub fn rank(records: &mut [CheckpointRecord]) {
    records.sort_by(|a, b| b.end_ts.cmp(&a.end_ts).then(b.id.cmp(&a.id)));
}

pub struct CheckpointStore {
    catalog: Arc<dyn CatalogBackend>,
    cache: Arc<IndexCache>,
    metadata: Arc<dyn JobMetadata>,
}

impl CheckpointStore {
    pub fn new(
        catalog: Arc<dyn CatalogBackend>,
        cache: Arc<IndexCache>,
        metadata: Arc<dyn JobMetadata>,
    ) -> Self {
        Self {
            catalog,
            cache,
            metadata,
        }
    }

    /// Snapshots exactly `cycles` (contiguous, non-empty, oldest first) and
    /// records the result as a valid checkpoint.
    pub fn create_checkpoint(&self, cycles: &[Cycle]) -> Result<CheckpointRecord> {
        let fail = |reason: String| Error::CheckpointCreationFailed { reason };
        let (Some(first), Some(last)) = (cycles.first(), cycles.last()) else {
            return Err(fail("no cycles to cover".into()));
        };
        for pair in cycles.windows(2) {
            if pair[1].id.get() != pair[0].id.get() + 1 {
                return Err(fail(format!(
                    "cycles {} and {} are not contiguous",
                    pair[0].id, pair[1].id
                )));
            }
        }
        if let Some(empty) = cycles.iter().find(|c| c.jobs.is_empty()) {
            return Err(fail(format!("{} has no jobs", empty.id)));
        }

        let id = self.next_id().map_err(|e| fail(e.to_string()))?;
        let layout = self.cache.layout();
        let snapshot_ref = layout.snapshot_rel(id);
        let snapshot_dir = layout
            .resolve_rel(&snapshot_ref)
            .map_err(|e| fail(e.to_string()))?;
        // A crash between snapshot and catalog write can leave an orphan
        // under this ordinal.
        layout
            .safe_remove_dir_all(&snapshot_dir)
            .map_err(|e| fail(e.to_string()))?;

        let jobs: Vec<PlacedJob> = cycles.iter().flat_map(|c| c.placed_jobs()).collect();
        let name = format!("cp-{}", id.get());
        let built = self
            .cache
            .build(IndexDbKind::CheckpointSnapshot, &name, |w| {
                w.set_source_checkpoint(id);
                playback::replay(w, &jobs, self.metadata.as_ref(), &CancelToken::new())
            })
            .map_err(|e| fail(format!("snapshot of {id}: {e}")))?;

        let rec = CheckpointRecord {
            id,
            start_ts: first.start_ts(),
            end_ts: cycles.iter().map(Cycle::end_ts).max().unwrap_or(last.end_ts()),
            covered_cycles: cycles.iter().map(|c| c.id).collect(),
            covered_jobs: jobs.iter().map(|p| p.job.id).collect(),
            validity: Validity::Valid,
            snapshot_ref,
            created_at: chrono::Utc::now().to_rfc3339(),
            invalidated_at: None,
            invalidation_reason: None,
        };
        if let Err(e) = self.catalog.put(&rec) {
            let _ = layout.safe_remove_dir_all(&built.path);
            return Err(fail(format!("catalog write for {id}: {e}")));
        }
        info!(
            checkpoint = %id,
            first_cycle = %first.id,
            last_cycle = %last.id,
            jobs = rec.covered_jobs.len(),
            "checkpoint created"
        );
        Ok(rec)
    }

    fn next_id(&self) -> Result<CheckpointId> {
        let last = self.catalog.all()?.last().map(|r| r.id.get()).unwrap_or(0);
        Ok(CheckpointId::new(last + 1))
    }

    /// Flips a checkpoint to invalidated and drops its restored copy.
    /// Returns `false` when it was already invalidated.
    pub fn invalidate(&self, id: CheckpointId, reason: &str) -> Result<bool> {
        let mut rec = self
            .catalog
            .get(id)?
            .ok_or_else(|| Error::not_found(id.to_string()))?;
        if !rec.is_valid() {
            return Ok(false);
        }
        rec.validity = Validity::Invalidated;
        rec.invalidated_at = Some(chrono::Utc::now().to_rfc3339());
        rec.invalidation_reason = Some(reason.to_string());
        self.catalog.put(&rec)?;
        if let Err(e) = self.cache.evict_restored(&rec) {
            warn!(checkpoint = %id, error = %e, "failed to evict restored copy");
        }
        warn!(checkpoint = %id, reason, "checkpoint invalidated");
        Ok(true)
    }

    pub fn get(&self, id: CheckpointId) -> Result<Option<CheckpointRecord>> {
        self.catalog.get(id)
    }

    /// Every checkpoint, oldest first.
    pub fn all(&self) -> Result<Vec<CheckpointRecord>> {
        self.catalog.all()
    }

    pub fn valid(&self) -> Result<Vec<CheckpointRecord>> {
        let mut v: Vec<_> = self.catalog.all()?.into_iter().filter(|r| r.is_valid()).collect();
        rank(&mut v);
        Ok(v)
    }

    /// Valid checkpoints intersecting `range`, most complete first.
    pub fn valid_checkpoints_covering(&self, range: TimeRange) -> Result<Vec<CheckpointRecord>> {
        let mut v: Vec<_> = self
            .catalog
            .range(range)?
            .into_iter()
            .filter(|r| r.is_valid())
            .collect();
        rank(&mut v);
        Ok(v)
    }

    /// Valid checkpoints containing `job` (which lives in `cycle`), most
    /// complete first.
    pub fn valid_checkpoints_covering_job(&self, job: JobId, cycle: CycleId) -> Result<Vec<CheckpointRecord>> {
        Ok(self
            .valid()?
            .into_iter()
            .filter(|r| r.contains_job(job, cycle))
            .collect())
    }

    /// Damages a checkpoint's backing snapshot so that the next restore
    /// fails verification. Any restored copy is evicted first.
    pub fn corrupt_snapshot(&self, id: CheckpointId) -> Result<()> {
        let rec = self
            .catalog
            .get(id)?
            .ok_or_else(|| Error::not_found(id.to_string()))?;
        self.cache.evict_restored(&rec)?;
        let dir = self.cache.layout().resolve_rel(&rec.snapshot_ref)?;
        let rp = indexdb::records_path(&dir);
        let body = fs::read(&rp).map_err(|e| Error::io_at("read", &rp, e))?;
        let mut damaged = body[..body.len() / 2].to_vec();
        damaged.extend_from_slice(b"\0corrupt");
        fs::write(&rp, &damaged).map_err(|e| Error::io_at("truncate", &rp, e))?;
        warn!(checkpoint = %id, file = %rp.display(), "checkpoint snapshot corrupted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::cycles::CycleTracker;
    use crate::joblog::JobLog;
    use crate::layout::CacheLayout;
    use crate::model::{BackupLevel, EntityId, Job, VersionEvent};

    struct Fixture {
        _tmp: tempfile::TempDir,
        store: CheckpointStore,
        tracker: CycleTracker,
        log: Arc<JobLog>,
    }

    /// Three cycles of a full plus one incremental each.
    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().expect("tempdir");
        let layout = CacheLayout::new(tmp.path(), EntityId::parse("e").expect("entity"));
        let cache = Arc::new(IndexCache::open(layout.clone()).expect("cache"));
        let log = Arc::new(JobLog::open(layout.jobs_dir()).expect("log"));
        let mut tracker = CycleTracker::new();
        for c in 0..3u64 {
            for (k, level) in [BackupLevel::Full, BackupLevel::Incremental].into_iter().enumerate() {
                let id = c * 2 + k as u64 + 1;
                let start = id as i64 * 10;
                let job = Job::new(id, level, start, start + 5);
                log.append(&job, &[VersionEvent::write(format!("/c{c}"), id, start)])
                    .expect("append");
                tracker.record_job(job).expect("record");
            }
        }
        let store = CheckpointStore::new(Arc::new(MemoryCatalog::new()), cache, log.clone());
        Fixture {
            _tmp: tmp,
            store,
            tracker,
            log,
        }
    }

    #[test]
    fn create_records_exact_coverage() {
        let f = fixture();
        let rec = f
            .store
            .create_checkpoint(&f.tracker.cycles()[..2])
            .expect("create");
        assert_eq!(rec.id, CheckpointId::new(1));
        assert_eq!(rec.covered_cycles, vec![CycleId::new(1), CycleId::new(2)]);
        assert_eq!(rec.covered_jobs.len(), 4);
        assert_eq!((rec.start_ts, rec.end_ts), (10, 45));
        let dir = f.store.cache.layout().resolve_rel(&rec.snapshot_ref).expect("dir");
        let m = indexdb::read_manifest(&dir).expect("manifest");
        assert_eq!(m.jobs.len(), 4);
        assert_eq!(m.source_checkpoint, Some(rec.id));
    }

    #[test]
    fn non_contiguous_or_empty_input_rejected() {
        let f = fixture();
        let cycles = f.tracker.cycles();
        let gap = vec![cycles[0].clone(), cycles[2].clone()];
        assert!(matches!(
            f.store.create_checkpoint(&gap),
            Err(Error::CheckpointCreationFailed { .. })
        ));
        assert!(matches!(
            f.store.create_checkpoint(&[]),
            Err(Error::CheckpointCreationFailed { .. })
        ));
        assert!(f.store.all().expect("all").is_empty());
    }

    #[test]
    fn missing_metadata_fails_creation_cleanly() {
        let f = fixture();
        f.log.discard(JobId::new(2)).expect("discard");
        let err = f
            .store
            .create_checkpoint(&f.tracker.cycles()[..1])
            .unwrap_err();
        assert!(matches!(err, Error::CheckpointCreationFailed { .. }));
        assert!(f.store.all().expect("all").is_empty());
        let left = fs::read_dir(f.store.cache.layout().snapshots_dir())
            .expect("dir")
            .count();
        assert_eq!(left, 0);
    }

    #[test]
    fn ranking_prefers_latest_end_then_newest() {
        let f = fixture();
        let cycles = f.tracker.cycles();
        let a = f.store.create_checkpoint(&cycles[..2]).expect("a");
        let b = f.store.create_checkpoint(&cycles[..3]).expect("b");
        let c = f.store.create_checkpoint(&cycles[1..3]).expect("c");
        let ranked: Vec<_> = f
            .store
            .valid_checkpoints_covering(TimeRange::new(0, 100).expect("range"))
            .expect("covering")
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ranked, vec![c.id, b.id, a.id]);

        let for_job = f
            .store
            .valid_checkpoints_covering_job(JobId::new(1), CycleId::new(1))
            .expect("job");
        assert_eq!(
            for_job.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![b.id, a.id]
        );
    }

    #[test]
    fn invalidation_is_one_way_and_idempotent() {
        let f = fixture();
        let rec = f
            .store
            .create_checkpoint(&f.tracker.cycles()[..1])
            .expect("create");
        assert!(f.store.invalidate(rec.id, "test").expect("first"));
        assert!(!f.store.invalidate(rec.id, "test").expect("second"));
        assert!(f.store.valid().expect("valid").is_empty());
        let stored = f.store.get(rec.id).expect("get").expect("present");
        assert_eq!(stored.invalidation_reason.as_deref(), Some("test"));
        assert!(matches!(
            f.store.invalidate(CheckpointId::new(42), "x"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn corrupted_snapshot_fails_restore() {
        let f = fixture();
        let rec = f
            .store
            .create_checkpoint(&f.tracker.cycles()[..1])
            .expect("create");
        f.store.corrupt_snapshot(rec.id).expect("corrupt");
        assert!(matches!(
            f.store.cache.materialize(&rec, &CancelToken::new()),
            Err(Error::CacheMaterializationFailed { .. })
        ));
    }
}
