use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, trace, warn};

use crate::browse::{self, BrowseQuery, BrowseRouter, ResolvedSegment};
use crate::cache::{IndexCache, ReclaimReport};
use crate::cancel::CancelToken;
use crate::catalog::{CatalogBackend, CheckpointRecord, JsonFileCatalog};
use crate::checkpoints::CheckpointStore;
use crate::config::EngineConfig;
use crate::cycles::CycleTracker;
use crate::error::{Error, Result};
use crate::indexdb::{BrowseItem, IndexDbHandle, IndexDbKind};
use crate::joblog::{JobLog, JobMetadata};
use crate::layout::CacheLayout;
use crate::model::{CheckpointId, Cycle, CycleId, EntityId, Job, JobId, PlacedJob, VersionEvent};
use crate::playback::PlaybackEngine;
use crate::pruning::{self, PruneReport, PruningEngine, RebuildReport, RetentionPolicy};

/// Outcome of ingesting one job.
#[derive(Debug)]
pub struct Ingested {
    pub cycle: CycleId,
    pub opened: bool,
    /// Cycle this job's arrival completed.
    pub completed: Option<CycleId>,
    /// Absorbed sequence anomaly (orphan incremental).
    pub anomaly: Option<Error>,
    pub prune: Option<PruneReport>,
    /// Automatic prune failed; retried on the next completed cycle.
    pub prune_error: Option<Error>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LineageStatus {
    pub entity: String,
    pub cycles: usize,
    pub jobs: usize,
    pub main_cycles: Vec<CycleId>,
    pub checkpoints: Vec<CheckpointRecord>,
    /// Completed cycles neither in Main nor in a valid checkpoint.
    pub uncovered_cycles: Vec<CycleId>,
}

impl LineageStatus {
    pub fn coverage_holds(&self) -> bool {
        self.uncovered_cycles.is_empty()
    }
}

/// Index lineage of one tracked entity: ingestion, retention, checkpoints
/// and browse resolution over a shared on-disk cache.
///
/// Mutations are serialized through a single writer; browses only take
/// short read locks to plan and then resolve without blocking ingestion.
pub struct IndexLineage {
    config: EngineConfig,
    layout: CacheLayout,
    joblog: Arc<JobLog>,
    cache: Arc<IndexCache>,
    store: Arc<CheckpointStore>,
    playback: PlaybackEngine,
    pruning: PruningEngine,
    router: BrowseRouter,
    tracker: RwLock<CycleTracker>,
    writer: Mutex<()>,
}

fn poisoned(what: &str) -> Error {
    Error::io(format!("{what} lock poisoned"), std::io::Error::other("poisoned"))
}

impl IndexLineage {
    /// Opens (or creates) the lineage of `entity` under the configured cache
    /// root, with the JSON file catalog.
    pub fn open(config: EngineConfig, entity: &str) -> Result<Self> {
        let entity = EntityId::parse(entity)?;
        let layout = CacheLayout::new(&config.cache.root_dir, entity.clone());
        let catalog = Arc::new(JsonFileCatalog::new(
            layout.catalog_path(),
            layout.lock_path(),
            Duration::from_millis(config.cache.lock_timeout_ms),
            entity.as_str(),
        ));
        Self::open_with_catalog(config, entity, catalog)
    }

    pub fn open_with_catalog(
        config: EngineConfig,
        entity: EntityId,
        catalog: Arc<dyn CatalogBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let layout = CacheLayout::new(&config.cache.root_dir, entity);
        let cache = Arc::new(IndexCache::open(layout.clone())?);
        let joblog = Arc::new(JobLog::open(layout.jobs_dir())?);
        let metadata: Arc<dyn JobMetadata> = joblog.clone();
        let store = Arc::new(CheckpointStore::new(catalog, cache.clone(), metadata.clone()));
        let playback = PlaybackEngine::new(cache.clone(), metadata.clone());
        let policy = RetentionPolicy::new(config.retention.cycles_to_retain)?;
        let pruning = PruningEngine::new(
            cache.clone(),
            store.clone(),
            metadata.clone(),
            policy,
            config.retention.coverage,
        );
        let router = BrowseRouter::new(
            cache.clone(),
            store.clone(),
            playback.clone(),
            metadata,
            config.browse.effective_parallelism(),
        );

        let tracker = CycleTracker::replay(joblog.jobs()?)?;
        if tracker.job_count() == 0 {
            cache.ensure_main()?;
        } else if cache.main_handle()?.is_none() {
            warn!(entity = %layout.entity(), "main index missing; browses fall back to checkpoints and playback");
        }
        info!(
            entity = %layout.entity(),
            cycles = tracker.cycles().len(),
            jobs = tracker.job_count(),
            checkpoints = store.all()?.len(),
            "index lineage opened"
        );

        Ok(Self {
            config,
            layout,
            joblog,
            cache,
            store,
            playback,
            pruning,
            router,
            tracker: RwLock::new(tracker),
            writer: Mutex::new(()),
        })
    }

    pub fn entity(&self) -> &EntityId {
        self.layout.entity()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    fn write_guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.writer.lock().map_err(|_| poisoned("writer"))
    }

    fn read_tracker(&self) -> Result<RwLockReadGuard<'_, CycleTracker>> {
        self.tracker.read().map_err(|_| poisoned("cycle tracker"))
    }

    fn write_tracker(&self) -> Result<RwLockWriteGuard<'_, CycleTracker>> {
        self.tracker.write().map_err(|_| poisoned("cycle tracker"))
    }

    /// Ingests a completed backup job with the file versions it produced.
    pub fn notify_job_completed(&self, job: Job, events: &[VersionEvent]) -> Result<Ingested> {
        let _w = self.write_guard()?;
        let planned = self.read_tracker()?.place(&job)?;
        self.joblog.append(&job, events)?;
        // The tracker only learns about the job once Main has it, so a
        // failed append can be retried as is.
        if let Err(e) = self.cache.append_to_main(&job, planned.cycle, events) {
            warn!(entity = %self.entity(), job = %job.id, error = %e, "main append failed; ingestion rolled back");
            if let Err(undo) = self.joblog.remove(job.id) {
                warn!(job = %job.id, error = %undo, "failed to roll back job log entry");
            }
            return Err(e);
        }
        let placement = self.write_tracker()?.record_job(job.clone())?;
        if let Some(anomaly) = &placement.anomaly {
            warn!(entity = %self.entity(), job = %job.id, cycle = %placement.cycle, "{anomaly}; synthesized a cycle boundary");
        }

        let mut ingested = Ingested {
            cycle: placement.cycle,
            opened: placement.opened,
            completed: placement.completed,
            anomaly: placement.anomaly,
            prune: None,
            prune_error: None,
        };
        if let Some(done) = ingested.completed
            && self.config.retention.auto_prune
        {
            info!(entity = %self.entity(), cycle = %done, "cycle completed; pruning");
            let tracker = self.read_tracker()?;
            match self.pruning.run_prune(&tracker) {
                Ok(report) => ingested.prune = Some(report),
                Err(e) => {
                    warn!(entity = %self.entity(), error = %e, "automatic prune failed");
                    ingested.prune_error = Some(e);
                }
            }
        }
        Ok(ingested)
    }

    pub fn cycles_to_retain(&self) -> usize {
        self.pruning.policy().get()
    }

    /// Takes effect on the next prune trigger.
    pub fn set_cycles_to_retain(&self, n: usize) -> Result<()> {
        self.pruning.policy().set(n)?;
        info!(entity = %self.entity(), cycles_to_retain = n, "retention updated");
        Ok(())
    }

    pub fn invalidate_checkpoint(&self, id: CheckpointId) -> Result<bool> {
        let _w = self.write_guard()?;
        self.store.invalidate(id, "administrative invalidation")
    }

    pub fn run_prune(&self) -> Result<PruneReport> {
        let _w = self.write_guard()?;
        let tracker = self.read_tracker()?;
        self.pruning.run_prune(&tracker)
    }

    pub fn rebuild_main(&self, cancel: &CancelToken) -> Result<RebuildReport> {
        let _w = self.write_guard()?;
        let tracker = self.read_tracker()?;
        self.pruning.rebuild_main(&tracker, cancel)
    }

    pub fn browse(
        &self,
        query: BrowseQuery,
        show_deleted: bool,
        cancel: &CancelToken,
    ) -> Result<Vec<ResolvedSegment>> {
        if let Some(max) = self.config.cache.max_bytes {
            self.cache.reclaim(max)?;
        }
        let plan = {
            let tracker = self.read_tracker()?;
            browse::plan(&tracker, query)?
        };
        self.router.resolve(&plan, show_deleted, cancel)
    }

    /// Merged listing for `query`.
    pub fn browse_items(&self, query: BrowseQuery, show_deleted: bool) -> Result<Vec<BrowseItem>> {
        let segments = self.browse(query, show_deleted, &CancelToken::new())?;
        let items = browse::merge_items(&segments)?;
        for item in &items {
            trace!(path = %item.display_path(), job = %item.job, deleted = item.deleted, "browse item");
        }
        Ok(items)
    }

    /// Temp DB holding exactly `jobs`.
    pub fn build_temp(&self, jobs: &[JobId], cancel: &CancelToken) -> Result<IndexDbHandle> {
        let placed = {
            let tracker = self.read_tracker()?;
            jobs.iter()
                .map(|j| tracker.placed(*j).ok_or_else(|| Error::not_found(j.to_string())))
                .collect::<Result<Vec<PlacedJob>>>()?
        };
        self.playback.build_temp(&placed, cancel)
    }

    pub fn materialize(&self, id: CheckpointId, cancel: &CancelToken) -> Result<IndexDbHandle> {
        let rec = self
            .store
            .get(id)?
            .ok_or_else(|| Error::not_found(id.to_string()))?;
        self.cache.materialize(&rec, cancel)
    }

    pub fn evict(&self, handle: &IndexDbHandle) -> Result<bool> {
        self.cache.evict(handle)
    }

    pub fn exists(&self, handle: &IndexDbHandle) -> bool {
        self.cache.exists(handle)
    }

    pub fn reclaim(&self, max_bytes: u64) -> Result<ReclaimReport> {
        self.cache.reclaim(max_bytes)
    }

    /// Deletes cached DBs of `kinds`, Main included when listed.
    pub fn purge_cache(&self, kinds: &[IndexDbKind]) -> Result<()> {
        let _w = self.write_guard()?;
        self.cache.purge(kinds)
    }

    /// Drops a job's recorded metadata, making it unreplayable.
    pub fn discard_job_metadata(&self, job: JobId) -> Result<bool> {
        self.joblog.discard(job)
    }

    pub fn corrupt_checkpoint(&self, id: CheckpointId) -> Result<()> {
        let _w = self.write_guard()?;
        self.store.corrupt_snapshot(id)
    }

    pub fn main_handle(&self) -> Result<Option<IndexDbHandle>> {
        self.cache.main_handle()
    }

    pub fn checkpoints(&self) -> Result<Vec<CheckpointRecord>> {
        self.store.all()
    }

    pub fn cycles(&self) -> Result<Vec<Cycle>> {
        Ok(self.read_tracker()?.cycles().to_vec())
    }

    pub fn status(&self) -> Result<LineageStatus> {
        let tracker = self.read_tracker()?;
        let in_main: BTreeSet<JobId> = self.cache.main_jobs()?.into_iter().collect();
        let valid = self.store.valid()?;
        let cycles = tracker.cycles();
        let completed = &cycles[..cycles.len().saturating_sub(1)];
        let uncovered_cycles = completed
            .iter()
            .filter(|c| {
                c.placed_jobs()
                    .any(|p| !in_main.contains(&p.job.id) && !pruning::is_covered(&p, &valid))
            })
            .map(|c| c.id)
            .collect();
        Ok(LineageStatus {
            entity: self.entity().to_string(),
            cycles: cycles.len(),
            jobs: tracker.job_count(),
            main_cycles: self
                .pruning
                .main_cycles(&tracker)?
                .iter()
                .map(|c| c.id)
                .collect(),
            checkpoints: self.store.all()?,
            uncovered_cycles,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::model::BackupLevel;

    fn config(root: &std::path::Path) -> EngineConfig {
        let mut cfg = EngineConfig::new(root);
        cfg.retention.auto_prune = false;
        cfg
    }

    #[test]
    fn state_reloads_from_disk() {
        let tmp = tempfile::tempdir().expect("tempdir");
        {
            let e = IndexLineage::open(config(tmp.path()), "sc1").expect("open");
            e.notify_job_completed(
                Job::new(1, BackupLevel::Full, 10, 20),
                &[VersionEvent::write("/a", 1, 9)],
            )
            .expect("ingest");
            e.notify_job_completed(Job::new(2, BackupLevel::Full, 30, 40), &[])
                .expect("ingest");
            e.run_prune().expect("prune");
        }
        let e = IndexLineage::open(config(tmp.path()), "sc1").expect("reopen");
        let status = e.status().expect("status");
        assert_eq!(status.cycles, 2);
        assert_eq!(status.jobs, 2);
        assert_eq!(status.checkpoints.len(), 1);
        assert!(status.coverage_holds());
        assert!(matches!(
            e.notify_job_completed(Job::new(2, BackupLevel::Incremental, 50, 60), &[]),
            Err(Error::DuplicateJob(_))
        ));
    }

    #[test]
    fn auto_prune_runs_on_cycle_completion() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut cfg = EngineConfig::new(tmp.path());
        cfg.retention.cycles_to_retain = 1;
        let e = IndexLineage::open_with_catalog(
            cfg,
            EntityId::parse("sc2").expect("entity"),
            Arc::new(MemoryCatalog::new()),
        )
        .expect("open");
        let first = e
            .notify_job_completed(Job::new(1, BackupLevel::Full, 0, 5), &[])
            .expect("ingest");
        assert!(first.prune.is_none());
        let second = e
            .notify_job_completed(Job::new(2, BackupLevel::SyntheticFull, 10, 15), &[])
            .expect("ingest");
        assert_eq!(second.completed, Some(CycleId::new(1)));
        let report = second.prune.expect("prune ran");
        assert!(report.checkpoint.is_some());
        assert_eq!(report.pruned_cycles, vec![CycleId::new(1)]);
        assert_eq!(e.status().expect("status").main_cycles, vec![CycleId::new(2)]);
    }

    #[test]
    fn rejected_job_leaves_no_trace() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let e = IndexLineage::open(config(tmp.path()), "sc3").expect("open");
        e.notify_job_completed(Job::new(1, BackupLevel::Full, 100, 110), &[])
            .expect("ingest");
        assert!(
            e.notify_job_completed(Job::new(2, BackupLevel::Incremental, 50, 60), &[])
                .is_err()
        );
        assert!(!e.layout().jobs_dir().join("2.job.json").exists());
        assert_eq!(e.status().expect("status").jobs, 1);
    }

    #[test]
    fn failed_main_append_can_be_retried() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let e = IndexLineage::open(config(tmp.path()), "sc4").expect("open");
        e.notify_job_completed(Job::new(1, BackupLevel::Full, 100, 110), &[])
            .expect("ingest");
        let pointer = e.layout().main_pointer();
        let good = std::fs::read_to_string(&pointer).expect("pointer");
        std::fs::write(&pointer, "garbage\n").expect("garble");

        let job = Job::new(2, BackupLevel::Incremental, 120, 130);
        let events = [VersionEvent::write("/b", 1, 120)];
        assert!(e.notify_job_completed(job.clone(), &events).is_err());
        assert_eq!(e.cycles().expect("cycles")[0].jobs.len(), 1);
        assert!(!e.layout().jobs_dir().join("2.job.json").exists());

        std::fs::write(&pointer, good).expect("restore");
        assert_eq!(e.status().expect("status").jobs, 1);
        e.notify_job_completed(job, &events).expect("retry");
        assert_eq!(
            e.main_handle()
                .expect("main")
                .map(|h| crate::indexdb::read_manifest(&h.path).expect("manifest").jobs),
            Some(vec![JobId::new(1), JobId::new(2)])
        );
        drop(e);
        let e = IndexLineage::open(config(tmp.path()), "sc4").expect("reopen");
        assert_eq!(e.cycles().expect("cycles")[0].jobs.len(), 2);
    }

    #[test]
    fn equal_start_times_survive_reopen() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ids = |e: &IndexLineage| -> Vec<Vec<u64>> {
            e.cycles()
                .expect("cycles")
                .iter()
                .map(|c| c.job_ids().map(|j| j.get()).collect())
                .collect()
        };
        {
            let e = IndexLineage::open(config(tmp.path()), "sc5").expect("open");
            e.notify_job_completed(Job::new(5, BackupLevel::Full, 100, 110), &[])
                .expect("full");
            e.notify_job_completed(Job::new(3, BackupLevel::Incremental, 100, 120), &[])
                .expect("incremental");
            assert_eq!(ids(&e), vec![vec![5, 3]]);
        }
        let e = IndexLineage::open(config(tmp.path()), "sc5").expect("reopen");
        assert_eq!(ids(&e), vec![vec![5, 3]]);
        assert!(!e.cycles().expect("cycles")[0].synthesized);
    }

    #[test]
    fn bad_entity_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert!(IndexLineage::open(config(tmp.path()), "../escape").is_err());
    }
}
