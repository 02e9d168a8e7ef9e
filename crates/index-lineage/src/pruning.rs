//! Checkpoint-then-compact pruning of the live Main index.
//!
//! Ordering is strict: a checkpoint covering every pruned cycle is durably
//! recorded before Main drops anything, so the union of Main and valid
//! checkpoints keeps covering every completed cycle. A failed checkpoint
//! aborts the prune with Main untouched. A failed compaction is reported and
//! left for the next trigger.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{info, warn};

use crate::cache::IndexCache;
use crate::cancel::CancelToken;
use crate::catalog::CheckpointRecord;
use crate::checkpoints::CheckpointStore;
use crate::config::CheckpointCoverage;
use crate::cycles::CycleTracker;
use crate::error::{Error, Result};
use crate::indexdb::IndexDbHandle;
use crate::joblog::JobMetadata;
use crate::model::{Cycle, CycleId, JobId, PlacedJob};
use crate::playback;

/// "Retain the N most recent cycles in Main". Shared and updatable at any
/// time; the pruning engine reads it once per trigger.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    cycles: Arc<AtomicUsize>,
}

impl RetentionPolicy {
    pub fn new(cycles_to_retain: usize) -> Result<Self> {
        let p = Self {
            cycles: Arc::new(AtomicUsize::new(1)),
        };
        p.set(cycles_to_retain)?;
        Ok(p)
    }

    pub fn get(&self) -> usize {
        self.cycles.load(Ordering::Acquire)
    }

    pub fn set(&self, cycles_to_retain: usize) -> Result<()> {
        if cycles_to_retain == 0 {
            return Err(Error::config("cycles to retain must be at least 1"));
        }
        self.cycles.store(cycles_to_retain, Ordering::Release);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct PruneReport {
    /// Checkpoint minted by this run.
    pub checkpoint: Option<CheckpointRecord>,
    /// Cycles dropped from Main.
    pub pruned_cycles: Vec<CycleId>,
    /// Compaction failed after the checkpoint was recorded; Main stays
    /// over-retained until the next run.
    pub compaction_error: Option<Error>,
}

impl PruneReport {
    pub fn is_noop(&self) -> bool {
        self.checkpoint.is_none() && self.pruned_cycles.is_empty() && self.compaction_error.is_none()
    }
}

#[derive(Debug, Default)]
pub struct RebuildReport {
    pub handle: Option<IndexDbHandle>,
    pub cycles: Vec<CycleId>,
    pub jobs: usize,
}

/// True when some valid checkpoint contains `p`.
pub fn is_covered(p: &PlacedJob, valid: &[CheckpointRecord]) -> bool {
    valid.iter().any(|r| r.contains_job(p.job.id, p.cycle))
}

pub struct PruningEngine {
    cache: Arc<IndexCache>,
    store: Arc<CheckpointStore>,
    metadata: Arc<dyn JobMetadata>,
    policy: RetentionPolicy,
    coverage: CheckpointCoverage,
}

impl PruningEngine {
    pub fn new(
        cache: Arc<IndexCache>,
        store: Arc<CheckpointStore>,
        metadata: Arc<dyn JobMetadata>,
        policy: RetentionPolicy,
        coverage: CheckpointCoverage,
    ) -> Self {
        Self {
            cache,
            store,
            metadata,
            policy,
            coverage,
        }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Cycles with at least one job physically in Main, oldest first.
    pub fn main_cycles<'a>(&self, tracker: &'a CycleTracker) -> Result<Vec<&'a Cycle>> {
        let in_main: BTreeSet<JobId> = self.cache.main_jobs()?.into_iter().collect();
        Ok(tracker
            .cycles()
            .iter()
            .filter(|c| c.job_ids().any(|j| in_main.contains(&j)))
            .collect())
    }

    fn main_placed(&self, tracker: &CycleTracker) -> Result<Vec<PlacedJob>> {
        Ok(self
            .cache
            .main_jobs()?
            .into_iter()
            .filter_map(|j| tracker.placed(j))
            .collect())
    }

    fn coverage_for<'a>(&self, tracker: &'a CycleTracker, main: &[&Cycle]) -> &'a [Cycle] {
        let (Some(first), Some(last)) = (main.first(), main.last()) else {
            return &[];
        };
        let from = match self.coverage {
            CheckpointCoverage::MainSnapshot => first.id.get() as usize - 1,
            CheckpointCoverage::FullHistory => 0,
        };
        let to = last.id.get() as usize;
        tracker.cycles().get(from..to).unwrap_or(&[])
    }

    pub fn run_prune(&self, tracker: &CycleTracker) -> Result<PruneReport> {
        let mut report = PruneReport::default();
        let main = self.main_cycles(tracker)?;
        if main.is_empty() {
            return Ok(report);
        }
        let placed = self.main_placed(tracker)?;

        let mut valid = self.store.valid()?;
        if placed.iter().any(|p| !is_covered(p, &valid)) {
            let cover = self.coverage_for(tracker, &main);
            let rec = self.store.create_checkpoint(cover).inspect_err(|e| {
                warn!(error = %e, "checkpoint creation failed; prune aborted");
            })?;
            valid.push(rec.clone());
            report.checkpoint = Some(rec);
        }

        let retain = self.policy.get();
        if main.len() <= retain {
            return Ok(report);
        }
        let candidates: BTreeSet<CycleId> = main[..main.len() - retain].iter().map(|c| c.id).collect();
        if let Some(p) = placed
            .iter()
            .find(|p| candidates.contains(&p.cycle) && !is_covered(p, &valid))
        {
            warn!(job = %p.job.id, cycle = %p.cycle, "prune candidate not covered; compaction skipped");
            return Ok(report);
        }

        let keep: Vec<PlacedJob> = placed
            .into_iter()
            .filter(|p| !candidates.contains(&p.cycle))
            .collect();
        match self.cache.compact_main(&keep) {
            Ok(h) => {
                report.pruned_cycles = candidates.into_iter().collect();
                info!(
                    pruned = report.pruned_cycles.len(),
                    retained = retain,
                    dir = %h.path.display(),
                    "main index compacted"
                );
            }
            Err(e) => {
                warn!(error = %e, "main compaction failed; will retry on next trigger");
                report.compaction_error = Some(e);
            }
        }
        Ok(report)
    }

    /// Rebuilds Main from the job log: the N most recent cycles plus every
    /// cycle that some valid checkpoint does not fully contain.
    pub fn rebuild_main(&self, tracker: &CycleTracker, cancel: &CancelToken) -> Result<RebuildReport> {
        let cycles = tracker.cycles();
        let retain = self.policy.get();
        let valid = self.store.valid()?;
        let recent_from = cycles.len().saturating_sub(retain);
        let chosen: Vec<&Cycle> = cycles
            .iter()
            .enumerate()
            .filter(|(i, c)| *i >= recent_from || c.placed_jobs().any(|p| !is_covered(&p, &valid)))
            .map(|(_, c)| c)
            .collect();
        let jobs: Vec<PlacedJob> = chosen.iter().flat_map(|c| c.placed_jobs()).collect();
        let handle = self
            .cache
            .replace_main(|w| playback::replay(w, &jobs, self.metadata.as_ref(), cancel))?;
        let report = RebuildReport {
            handle: Some(handle),
            cycles: chosen.iter().map(|c| c.id).collect(),
            jobs: jobs.len(),
        };
        info!(cycles = report.cycles.len(), jobs = report.jobs, "main index rebuilt");
        Ok(report)
    }
}
