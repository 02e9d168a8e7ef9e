//! Physical lifecycle of index DB directories in the cache: the live Main
//! (generations behind an atomically swapped pointer), restored checkpoint
//! DBs, temp playback DBs, and reclamation of disk space.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::catalog::CheckpointRecord;
use crate::error::{Error, Result};
use crate::fsutil::{self, StagingDir};
use crate::indexdb::{
    self, IndexDb, IndexDbHandle, IndexDbKind, IndexDbManifest, IndexDbWriter, VersionRecord,
};
use crate::layout::CacheLayout;
use crate::model::{CycleId, Job, JobId, PlacedJob, Timestamp, VersionEvent};

fn restored_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^cp_(-?\d+)_(-?\d+)$").expect("static regex"))
}

fn temp_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^tmp_(-?\d+)_([0-9a-f]{16})$").expect("static regex"))
}

fn generation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^gen-(\d+)$").expect("static regex"))
}

/// Cache directory of a restored checkpoint. Encodes the coverage bounds
/// only, so restoring the same checkpoint twice lands in the same place.
pub fn restored_name(start_ts: Timestamp, end_ts: Timestamp) -> String {
    format!("cp_{start_ts}_{end_ts}")
}

/// Cache directory of a temp DB: the first job's start plus a digest of the
/// exact job set, so identical requests hit and different sets never alias.
pub fn temp_name(first_start: Timestamp, jobs: &[JobId]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    for j in jobs {
        hasher.update(j.get().to_le_bytes());
    }
    format!("tmp_{first_start}_{}", hex::encode(&hasher.finalize()[..8]))
}

#[derive(Debug, Clone)]
pub struct CachedDb {
    pub handle: IndexDbHandle,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ReclaimReport {
    pub evicted: Vec<IndexDbHandle>,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
}

/// Keeps one Main generation on disk while held. Compaction skips leased
/// generations; they are swept by a later swap once every clone is dropped.
#[derive(Debug, Clone)]
pub struct GenerationLease(Arc<u64>);

impl GenerationLease {
    pub fn generation(&self) -> u64 {
        *self.0
    }
}

/// True when `dir` is a restore of exactly `rec`.
fn restored_from(dir: &Path, rec: &CheckpointRecord) -> bool {
    match indexdb::read_manifest(dir) {
        Ok(m) => {
            let have: BTreeSet<JobId> = m.jobs.into_iter().collect();
            let want: BTreeSet<JobId> = rec.covered_jobs.iter().copied().collect();
            m.source_checkpoint == Some(rec.id) && have == want
        }
        Err(_) => false,
    }
}

pub struct IndexCache {
    layout: CacheLayout,
    main_lock: Mutex<()>,
    leases: Mutex<Vec<Weak<u64>>>,
}

impl IndexCache {
    pub fn open(layout: CacheLayout) -> Result<Self> {
        layout.ensure_dirs()?;
        let cache = Self {
            layout,
            main_lock: Mutex::new(()),
            leases: Mutex::new(Vec::new()),
        };
        cache.discard_partials()?;
        Ok(cache)
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    fn entity(&self) -> &str {
        self.layout.entity().as_str()
    }

    fn handle_for(&self, kind: IndexDbKind, dir: PathBuf) -> IndexDbHandle {
        let rel = dir
            .strip_prefix(self.layout.entity_dir())
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| dir.to_string_lossy().to_string());
        IndexDbHandle {
            id: indexdb::db_id(self.entity(), &rel),
            kind,
            path: dir,
        }
    }

    fn kind_dir(&self, kind: IndexDbKind) -> PathBuf {
        match kind {
            IndexDbKind::Main => self.layout.main_dir(),
            IndexDbKind::CheckpointSnapshot => self.layout.snapshots_dir(),
            IndexDbKind::RestoredCheckpoint => self.layout.restored_dir(),
            IndexDbKind::Temp => self.layout.temp_dir(),
        }
    }

    fn lock_main(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.main_lock.lock().map_err(|_| {
            Error::io(
                "main index lock poisoned",
                std::io::Error::other("poisoned"),
            )
        })
    }

    fn current_generation(&self) -> Result<Option<u64>> {
        let pointer = self.layout.main_pointer();
        let raw = match fs::read_to_string(&pointer) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io_at("read", &pointer, e)),
        };
        let name = raw.trim();
        let generation = generation_re()
            .captures(name)
            .and_then(|c| c[1].parse::<u64>().ok())
            .ok_or_else(|| {
                Error::io(
                    format!(
                        "main pointer {} holds '{name}', expected gen-<n>",
                        pointer.display()
                    ),
                    std::io::Error::from(std::io::ErrorKind::InvalidData),
                )
            })?;
        Ok(Some(generation))
    }

    fn existing_generations(&self) -> Vec<u64> {
        let mut out = Vec::new();
        if let Ok(entries) = fs::read_dir(self.layout.main_dir()) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some(c) = generation_re().captures(&name)
                    && let Ok(n) = c[1].parse::<u64>()
                {
                    out.push(n);
                }
            }
        }
        out.sort_unstable();
        out
    }

    fn live_main(&self) -> Result<Option<(u64, IndexDbHandle)>> {
        let Some(generation) = self.current_generation()? else {
            return Ok(None);
        };
        let dir = self.layout.main_generation(generation);
        if !indexdb::manifest_path(&dir).is_file() {
            return Ok(None);
        }
        Ok(Some((generation, self.handle_for(IndexDbKind::Main, dir))))
    }

    /// Live Main, or `None` when it has been deleted from the cache.
    pub fn main_handle(&self) -> Result<Option<IndexDbHandle>> {
        Ok(self.live_main()?.map(|(_, h)| h))
    }

    fn lock_leases(&self) -> Result<std::sync::MutexGuard<'_, Vec<Weak<u64>>>> {
        self.leases.lock().map_err(|_| {
            Error::io(
                "main lease table poisoned",
                std::io::Error::other("poisoned"),
            )
        })
    }

    /// Live Main together with a lease that keeps its generation readable
    /// across later compactions.
    pub fn lease_main(&self) -> Result<Option<(IndexDbHandle, GenerationLease)>> {
        let mut leases = self.lock_leases()?;
        let Some((generation, handle)) = self.live_main()? else {
            return Ok(None);
        };
        let lease = Arc::new(generation);
        leases.retain(|w| w.strong_count() > 0);
        leases.push(Arc::downgrade(&lease));
        Ok(Some((handle, GenerationLease(lease))))
    }

    /// Jobs physically present in the live Main.
    pub fn main_jobs(&self) -> Result<Vec<JobId>> {
        match self.main_handle()? {
            Some(h) => Ok(indexdb::read_manifest(&h.path)?.jobs),
            None => Ok(Vec::new()),
        }
    }

    fn next_generation(&self) -> Result<u64> {
        let current = self.current_generation()?.unwrap_or(0);
        let highest = self.existing_generations().last().copied().unwrap_or(0);
        Ok(current.max(highest) + 1)
    }

    fn publish_generation(&self, generation: u64) -> Result<()> {
        fsutil::atomic_write_text(&self.layout.main_pointer(), &format!("gen-{generation}\n"))?;
        // The previous generation stays for readers that opened it before
        // the swap, and so does any leased one; anything else older goes.
        let mut leases = self.lock_leases()?;
        leases.retain(|w| w.strong_count() > 0);
        let leased: BTreeSet<u64> = leases.iter().filter_map(|w| w.upgrade().map(|g| *g)).collect();
        for old in self.existing_generations() {
            if old + 1 >= generation {
                continue;
            }
            if leased.contains(&old) {
                debug!(generation = old, "stale main generation still leased");
                continue;
            }
            let dir = self.layout.main_generation(old);
            if let Err(e) = self.layout.safe_remove_dir_all(&dir) {
                warn!(dir = %dir.display(), error = %e, "failed to drop stale main generation");
            }
        }
        Ok(())
    }

    /// Returns the live Main, creating an empty one if it is missing.
    pub fn ensure_main(&self) -> Result<IndexDbHandle> {
        let _g = self.lock_main()?;
        self.ensure_main_locked()
    }

    fn ensure_main_locked(&self) -> Result<IndexDbHandle> {
        if let Some(h) = self.main_handle()? {
            return Ok(h);
        }
        let generation = self.next_generation()?;
        let dir = self.layout.main_generation(generation);
        let handle = self.handle_for(IndexDbKind::Main, dir.clone());
        let stage = StagingDir::create(&self.layout.main_dir(), &format!("gen-{generation}"))?;
        indexdb::create_empty(stage.path(), handle.id.clone(), IndexDbKind::Main, self.entity())?;
        stage.commit(&dir)?;
        self.publish_generation(generation)?;
        info!(entity = %self.entity(), generation, "started empty main index");
        Ok(handle)
    }

    pub fn append_to_main(&self, job: &Job, cycle: CycleId, events: &[VersionEvent]) -> Result<IndexDbManifest> {
        let _g = self.lock_main()?;
        let h = self.ensure_main_locked()?;
        indexdb::append_job_in_place(&h.path, job, cycle, events)
    }

    /// Builds a new Main generation with `fill` and swaps it in atomically.
    /// Readers holding the old handle keep a consistent view; new readers
    /// see only the complete new generation.
    pub fn replace_main<F>(&self, fill: F) -> Result<IndexDbHandle>
    where
        F: FnOnce(&mut IndexDbWriter) -> Result<()>,
    {
        let _g = self.lock_main()?;
        let generation = self.next_generation()?;
        let dir = self.layout.main_generation(generation);
        let handle = self.handle_for(IndexDbKind::Main, dir.clone());
        let stage = StagingDir::create(&self.layout.main_dir(), &format!("gen-{generation}"))?;
        let mut writer =
            IndexDbWriter::create(stage.path(), handle.id.clone(), IndexDbKind::Main, self.entity())?;
        fill(&mut writer)?;
        let mut manifest = writer.finish()?;
        // Main keeps growing by in-place appends, so it is never sealed.
        manifest.digest = None;
        indexdb::write_manifest(stage.path(), &manifest)?;
        if !stage.commit(&dir)? {
            return Err(Error::config(format!(
                "main generation {} already exists",
                dir.display()
            )));
        }
        self.publish_generation(generation)?;
        Ok(handle)
    }

    /// Rewrites Main keeping only `keep` (ordered by start time), copying
    /// their records out of the current Main.
    pub fn compact_main(&self, keep: &[PlacedJob]) -> Result<IndexDbHandle> {
        let current = self
            .main_handle()?
            .ok_or_else(|| Error::CompactionFailed {
                reason: "main index is missing".into(),
            })?;
        let db = IndexDb::open(&current.path).map_err(|e| Error::CompactionFailed {
            reason: e.to_string(),
        })?;
        let mut by_job = BTreeMap::<JobId, Vec<VersionEvent>>::new();
        for VersionRecord { job, event, .. } in db.records().map_err(|e| Error::CompactionFailed {
            reason: e.to_string(),
        })? {
            by_job.entry(job).or_default().push(event);
        }
        let present: BTreeSet<JobId> = db.job_ids().iter().copied().collect();
        self.replace_main(|w| {
            for p in keep {
                if !present.contains(&p.job.id) {
                    continue;
                }
                let events = by_job.remove(&p.job.id).unwrap_or_default();
                w.append_job(&p.job, p.cycle, &events)?;
            }
            Ok(())
        })
        .map_err(|e| match e {
            Error::CompactionFailed { .. } => e,
            other => Error::CompactionFailed {
                reason: other.to_string(),
            },
        })
    }

    /// Restores a checkpoint's snapshot into the cache. Idempotent: an
    /// already restored copy is reused, concurrent restores of the same
    /// checkpoint converge on one directory. Checkpoints with the same
    /// coverage bounds share a directory name, so a copy restored from a
    /// different checkpoint (or a different job set) is replaced.
    pub fn materialize(&self, rec: &CheckpointRecord, cancel: &CancelToken) -> Result<IndexDbHandle> {
        let name = restored_name(rec.start_ts, rec.end_ts);
        let dst = self.layout.restored_dir().join(&name);
        let handle = self.handle_for(IndexDbKind::RestoredCheckpoint, dst.clone());
        for _ in 0..2 {
            if self.exists(&handle) {
                if restored_from(&dst, rec) {
                    fsutil::touch(&dst);
                    debug!(checkpoint = %rec.id, dir = %dst.display(), "restored checkpoint reused");
                    return Ok(handle);
                }
                info!(checkpoint = %rec.id, dir = %dst.display(), "restored copy belongs to another checkpoint; restoring again");
                self.layout.safe_remove_dir_all(&dst)?;
            } else if dst.exists() {
                // Leftover without a manifest; not a usable DB.
                self.layout.safe_remove_dir_all(&dst)?;
            }
            cancel.check()?;
            let stage = self.stage_restore(rec, &name, &handle, cancel)?;
            if stage.commit(&dst)? {
                info!(checkpoint = %rec.id, dir = %dst.display(), "checkpoint restored");
                return Ok(handle);
            }
        }
        Err(Error::io(
            format!("restored directory {} keeps changing under {}", dst.display(), rec.id),
            std::io::Error::from(std::io::ErrorKind::WouldBlock),
        ))
    }

    fn stage_restore(
        &self,
        rec: &CheckpointRecord,
        name: &str,
        handle: &IndexDbHandle,
        cancel: &CancelToken,
    ) -> Result<StagingDir> {
        let fail = |reason: String| Error::CacheMaterializationFailed {
            checkpoint: rec.id,
            reason,
        };
        let src = self.layout.resolve_rel(&rec.snapshot_ref)?;
        let snapshot = IndexDb::open(&src).map_err(|e| fail(e.to_string()))?;
        snapshot.verify().map_err(|e| fail(e.to_string()))?;

        let stage = StagingDir::create(&self.layout.restored_dir(), name)?;
        fsutil::copy_tree(&src, stage.path()).map_err(|e| fail(e.to_string()))?;
        cancel.check()?;
        let mut manifest = snapshot.manifest().clone();
        manifest.id = handle.id.clone();
        manifest.kind = IndexDbKind::RestoredCheckpoint;
        manifest.source_checkpoint = Some(rec.id);
        manifest.created_at = chrono::Utc::now().to_rfc3339();
        indexdb::write_manifest(stage.path(), &manifest)?;
        Ok(stage)
    }

    /// Handle of a cached DB of `kind` named `name`, if fully built.
    pub fn cached(&self, kind: IndexDbKind, name: &str) -> Option<IndexDbHandle> {
        let dir = self.kind_dir(kind).join(name);
        let handle = self.handle_for(kind, dir);
        if self.exists(&handle) {
            fsutil::touch(&handle.path);
            Some(handle)
        } else {
            None
        }
    }

    /// Builds a DB of `kind` under `name` in a staging directory and
    /// publishes it only once `fill` succeeds. A cancelled or failed build
    /// leaves nothing behind.
    pub fn build<F>(&self, kind: IndexDbKind, name: &str, fill: F) -> Result<IndexDbHandle>
    where
        F: FnOnce(&mut IndexDbWriter) -> Result<()>,
    {
        let parent = self.kind_dir(kind);
        let dst = parent.join(name);
        let handle = self.handle_for(kind, dst.clone());
        let stage = StagingDir::create(&parent, name)?;
        let mut writer = IndexDbWriter::create(stage.path(), handle.id.clone(), kind, self.entity())?;
        fill(&mut writer)?;
        writer.finish()?;
        if !stage.commit(&dst)? {
            debug!(dir = %dst.display(), "concurrent build already published");
        }
        Ok(handle)
    }

    pub fn exists(&self, handle: &IndexDbHandle) -> bool {
        indexdb::manifest_path(&handle.path).is_file()
    }

    /// Removes a restored or temp DB. Main is never evicted here.
    pub fn evict(&self, handle: &IndexDbHandle) -> Result<bool> {
        match handle.kind {
            IndexDbKind::Main | IndexDbKind::CheckpointSnapshot => {
                warn!(kind = %handle.kind, dir = %handle.path.display(), "refusing to evict");
                Ok(false)
            }
            IndexDbKind::RestoredCheckpoint | IndexDbKind::Temp => {
                if !handle.path.exists() {
                    return Ok(false);
                }
                if !handle.path.starts_with(self.kind_dir(handle.kind)) {
                    return Err(Error::config(format!(
                        "handle {} does not belong to this cache",
                        handle.path.display()
                    )));
                }
                self.layout.safe_remove_dir_all(&handle.path)?;
                debug!(kind = %handle.kind, dir = %handle.path.display(), "evicted");
                Ok(true)
            }
        }
    }

    /// Evicts the restored copy of a checkpoint, if any.
    pub fn evict_restored(&self, rec: &CheckpointRecord) -> Result<bool> {
        let dir = self
            .layout
            .restored_dir()
            .join(restored_name(rec.start_ts, rec.end_ts));
        let handle = self.handle_for(IndexDbKind::RestoredCheckpoint, dir);
        self.evict(&handle)
    }

    /// Restored and temp DBs currently in the cache.
    pub fn inventory(&self) -> Vec<CachedDb> {
        let mut out = Vec::new();
        for (kind, re) in [
            (IndexDbKind::RestoredCheckpoint, restored_name_re()),
            (IndexDbKind::Temp, temp_name_re()),
        ] {
            let Ok(entries) = fs::read_dir(self.kind_dir(kind)) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if !re.is_match(&name) {
                    continue;
                }
                let handle = self.handle_for(kind, entry.path());
                out.push(CachedDb {
                    bytes: fsutil::dir_size(&handle.path),
                    handle,
                });
            }
        }
        out
    }

    /// Evicts least recently used restored/temp DBs until their total size
    /// fits `max_bytes`.
    pub fn reclaim(&self, max_bytes: u64) -> Result<ReclaimReport> {
        let mut dbs = self.inventory();
        let mut total: u64 = dbs.iter().map(|d| d.bytes).sum();
        dbs.sort_by_key(|d| fsutil::mtime(&d.handle.path));
        let mut report = ReclaimReport::default();
        for db in dbs {
            if total <= max_bytes {
                break;
            }
            if self.evict(&db.handle)? {
                total = total.saturating_sub(db.bytes);
                report.freed_bytes += db.bytes;
                report.evicted.push(db.handle);
            }
        }
        report.remaining_bytes = total;
        if !report.evicted.is_empty() {
            info!(
                entity = %self.entity(),
                evicted = report.evicted.len(),
                freed_bytes = report.freed_bytes,
                "cache reclaimed"
            );
        }
        Ok(report)
    }

    /// Deletes every DB of the given kinds, Main included when asked.
    pub fn purge(&self, kinds: &[IndexDbKind]) -> Result<()> {
        let _g = self.lock_main()?;
        for kind in kinds {
            let dir = self.kind_dir(*kind);
            self.layout.safe_remove_dir_all(&dir)?;
            fsutil::create_dir_all(&dir)?;
            warn!(entity = %self.entity(), kind = %kind, "cache purged");
        }
        Ok(())
    }

    /// Removes staging directories left by interrupted builds.
    pub fn discard_partials(&self) -> Result<usize> {
        let mut removed = 0;
        for parent in [
            self.layout.main_dir(),
            self.layout.snapshots_dir(),
            self.layout.restored_dir(),
            self.layout.temp_dir(),
        ] {
            let Ok(entries) = fs::read_dir(&parent) else {
                continue;
            };
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().starts_with(".partial-") {
                    self.layout.safe_remove_dir_all(&entry.path())?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(entity = %self.entity(), removed, "discarded partial index builds");
        }
        Ok(removed)
    }
}

/// Opens the DB behind `handle` for reading.
pub fn open_db(handle: &IndexDbHandle) -> Result<IndexDb> {
    IndexDb::open(&handle.path)
}
