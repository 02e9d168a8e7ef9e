//! Browse routing: decides, per query, which index DBs answer which jobs.
//!
//! Resolution order for the jobs a query needs:
//! 1. jobs physically present in the live Main are served by Main;
//! 2. the best-ranked valid checkpoint containing all remaining jobs, or
//!    failing that a most-recent-first greedy split across checkpoints;
//! 3. whatever is left is replayed into temp DBs, one per contiguous run.
//!
//! A checkpoint whose restore fails is invalidated and its jobs are
//! resolved again, so a corrupt snapshot degrades to playback instead of
//! failing the browse.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

use crate::cache::{self, GenerationLease, IndexCache};
use crate::cancel::CancelToken;
use crate::catalog::CheckpointRecord;
use crate::checkpoints::CheckpointStore;
use crate::cycles::CycleTracker;
use crate::error::{Error, Result};
use crate::indexdb::{self, BrowseItem, IndexDbHandle};
use crate::joblog::JobMetadata;
use crate::model::{CheckpointId, CycleId, JobId, PlacedJob, TimeRange, Timestamp};
use crate::playback::PlaybackEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowseQuery {
    /// Point-in-time view as of `to`, over every cycle intersecting the
    /// range.
    Range { from: Timestamp, to: Timestamp },
    /// View as of the given job: its cycle up to and including it.
    Job(JobId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provenance {
    Main,
    Checkpoint(CheckpointId),
    Temp,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Main => f.write_str("main"),
            Provenance::Checkpoint(id) => write!(f, "{id}"),
            Provenance::Temp => f.write_str("temp"),
        }
    }
}

/// Disjoint slice of a query answered by a single index DB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubRange {
    pub start_ts: Timestamp,
    pub end_ts: Timestamp,
    pub cycles: Vec<CycleId>,
    pub jobs: Vec<JobId>,
}

#[derive(Debug, Clone)]
pub struct ResolvedSegment {
    pub sub_range: SubRange,
    pub handle: IndexDbHandle,
    pub provenance: Provenance,
    pub show_deleted: bool,
    /// Pins the Main generation a Main segment reads from.
    lease: Option<GenerationLease>,
}

impl ResolvedSegment {
    /// Main generation this segment keeps alive, for Main segments.
    pub fn main_generation(&self) -> Option<u64> {
        self.lease.as_ref().map(GenerationLease::generation)
    }

    /// Latest version of each path among this segment's jobs only; a
    /// checkpoint DB may hold more jobs than the segment asked for.
    pub fn items(&self) -> Result<Vec<BrowseItem>> {
        let jobs: BTreeSet<JobId> = self.sub_range.jobs.iter().copied().collect();
        cache::open_db(&self.handle)?.items_of(&jobs, self.show_deleted)
    }
}

/// One listing across all segments; for each path the version from the
/// latest starting job wins.
pub fn merge_items(segments: &[ResolvedSegment]) -> Result<Vec<BrowseItem>> {
    let show_deleted = segments.iter().any(|s| s.show_deleted);
    let mut latest = BTreeMap::<String, BrowseItem>::new();
    for seg in segments {
        let jobs: BTreeSet<JobId> = seg.sub_range.jobs.iter().copied().collect();
        for item in cache::open_db(&seg.handle)?.items_of(&jobs, true)? {
            match latest.get(&item.path) {
                Some(prev) if prev.job_start > item.job_start => {}
                _ => {
                    latest.insert(item.path.clone(), item);
                }
            }
        }
    }
    Ok(latest
        .into_values()
        .filter(|i| show_deleted || !i.deleted)
        .collect())
}

/// Jobs a query needs, in start order, plus the bounds reported when the
/// query cannot be resolved.
#[derive(Debug, Clone)]
pub struct BrowsePlan {
    pub bounds: TimeRange,
    pub jobs: Vec<PlacedJob>,
}

pub fn plan(tracker: &CycleTracker, query: BrowseQuery) -> Result<BrowsePlan> {
    match query {
        BrowseQuery::Range { from, to } => {
            let bounds = TimeRange::new(from, to)?;
            let jobs = tracker
                .cycles_in_range(bounds)
                .into_iter()
                .flat_map(|c| c.placed_jobs())
                .filter(|p| p.job.start_ts <= to)
                .collect();
            Ok(BrowsePlan { bounds, jobs })
        }
        BrowseQuery::Job(id) => {
            let cycle = tracker.cycle_containing(id)?;
            let mut jobs = Vec::new();
            let mut bounds = None;
            for p in cycle.placed_jobs() {
                let done = p.job.id == id;
                if done {
                    bounds = Some(TimeRange::new(p.job.start_ts, p.job.end_ts)?);
                }
                jobs.push(p);
                if done {
                    break;
                }
            }
            let bounds = bounds.ok_or_else(|| Error::not_found(id.to_string()))?;
            Ok(BrowsePlan { bounds, jobs })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Main,
    Checkpoint(CheckpointId),
    Temp,
}

/// Runs `tasks` on scoped threads, at most `limit` at a time, preserving
/// order in the output.
fn run_bounded<T, F>(tasks: Vec<F>, limit: usize) -> Vec<Result<T>>
where
    T: Send,
    F: FnOnce() -> Result<T> + Send,
{
    let mut out = Vec::with_capacity(tasks.len());
    let mut tasks = tasks.into_iter().peekable();
    while tasks.peek().is_some() {
        let batch: Vec<F> = tasks.by_ref().take(limit.max(1)).collect();
        if batch.len() == 1 {
            out.extend(batch.into_iter().map(|t| t()));
            continue;
        }
        thread::scope(|s| {
            let handles: Vec<_> = batch.into_iter().map(|t| s.spawn(t)).collect();
            for h in handles {
                out.push(h.join().unwrap_or_else(|_| {
                    Err(Error::io(
                        "browse worker panicked",
                        std::io::Error::other("panic"),
                    ))
                }));
            }
        });
    }
    out
}

fn sub_range(run: &[&PlacedJob]) -> SubRange {
    let mut cycles = Vec::new();
    for p in run {
        if cycles.last() != Some(&p.cycle) {
            cycles.push(p.cycle);
        }
    }
    SubRange {
        start_ts: run.first().map(|p| p.job.start_ts).unwrap_or_default(),
        end_ts: run.iter().map(|p| p.job.end_ts).max().unwrap_or_default(),
        cycles,
        jobs: run.iter().map(|p| p.job.id).collect(),
    }
}

pub struct BrowseRouter {
    cache: Arc<IndexCache>,
    store: Arc<CheckpointStore>,
    playback: PlaybackEngine,
    metadata: Arc<dyn JobMetadata>,
    parallelism: usize,
}

impl BrowseRouter {
    pub fn new(
        cache: Arc<IndexCache>,
        store: Arc<CheckpointStore>,
        playback: PlaybackEngine,
        metadata: Arc<dyn JobMetadata>,
        parallelism: usize,
    ) -> Self {
        Self {
            cache,
            store,
            playback,
            metadata,
            parallelism: parallelism.max(1),
        }
    }

    fn assign(&self, jobs: &[PlacedJob], in_main: &BTreeSet<JobId>) -> Result<Vec<Source>> {
        let mut sources: Vec<Option<Source>> = jobs
            .iter()
            .map(|p| in_main.contains(&p.job.id).then_some(Source::Main))
            .collect();
        let remaining: Vec<usize> = (0..jobs.len()).filter(|i| sources[*i].is_none()).collect();

        if let (Some(&lo), Some(&hi)) = (remaining.first(), remaining.last()) {
            let span_end = remaining.iter().map(|i| jobs[*i].job.end_ts).max().unwrap_or(jobs[hi].job.end_ts);
            let span = TimeRange::new(jobs[lo].job.start_ts, span_end)?;
            let candidates: Vec<CheckpointRecord> = self
                .store
                .valid_checkpoints_covering(span)?
                .into_iter()
                .filter(|r| remaining.iter().any(|i| r.contains_job(jobs[*i].job.id, jobs[*i].cycle)))
                .collect();

            let whole = candidates.iter().find(|r| {
                remaining
                    .iter()
                    .all(|i| r.contains_job(jobs[*i].job.id, jobs[*i].cycle))
            });
            match whole {
                Some(r) => {
                    for i in &remaining {
                        sources[*i] = Some(Source::Checkpoint(r.id));
                    }
                }
                None => {
                    for r in &candidates {
                        for i in &remaining {
                            if sources[*i].is_none() && r.contains_job(jobs[*i].job.id, jobs[*i].cycle) {
                                sources[*i] = Some(Source::Checkpoint(r.id));
                            }
                        }
                    }
                }
            }
        }
        Ok(sources.into_iter().map(|s| s.unwrap_or(Source::Temp)).collect())
    }

    /// Resolves `plan` into one handle per disjoint sub-range.
    pub fn resolve(
        &self,
        plan: &BrowsePlan,
        show_deleted: bool,
        cancel: &CancelToken,
    ) -> Result<Vec<ResolvedSegment>> {
        if plan.jobs.is_empty() {
            return Ok(Vec::new());
        }
        let unresolvable = |reason: String| Error::UnresolvableRange {
            from: plan.bounds.from,
            to: plan.bounds.to,
            reason,
        };

        let main = self.cache.lease_main()?;
        let in_main: BTreeSet<JobId> = match &main {
            Some((h, _)) => indexdb::read_manifest(&h.path)?.jobs.into_iter().collect(),
            None => BTreeSet::new(),
        };

        loop {
            cancel.check()?;
            let sources = self.assign(&plan.jobs, &in_main)?;

            let mut wanted: Vec<CheckpointId> = sources
                .iter()
                .filter_map(|s| match s {
                    Source::Checkpoint(id) => Some(*id),
                    _ => None,
                })
                .collect();
            wanted.sort_unstable();
            wanted.dedup();
            let mut records = Vec::with_capacity(wanted.len());
            for id in wanted {
                let rec = self
                    .store
                    .get(id)?
                    .ok_or_else(|| Error::not_found(id.to_string()))?;
                records.push(rec);
            }

            let tasks: Vec<_> = records
                .iter()
                .map(|rec| move || self.cache.materialize(rec, cancel))
                .collect();
            let mut restored = BTreeMap::<CheckpointId, IndexDbHandle>::new();
            let mut healed = false;
            for (rec, res) in records.iter().zip(run_bounded(tasks, self.parallelism)) {
                match res {
                    Ok(h) => {
                        restored.insert(rec.id, h);
                    }
                    Err(Error::CacheMaterializationFailed { checkpoint, reason }) => {
                        warn!(%checkpoint, %reason, "checkpoint restore failed; invalidating and re-resolving");
                        self.store.invalidate(checkpoint, &reason)?;
                        healed = true;
                    }
                    Err(e) => return Err(e),
                }
            }
            if healed {
                continue;
            }

            // Contiguous runs of jobs with the same source.
            let mut runs: Vec<(Source, Vec<&PlacedJob>)> = Vec::new();
            for (p, src) in plan.jobs.iter().zip(&sources) {
                match runs.last_mut() {
                    Some((s, run)) if s == src => run.push(p),
                    _ => runs.push((*src, vec![p])),
                }
            }

            for (src, run) in &runs {
                if *src != Source::Temp {
                    continue;
                }
                if let Some(p) = run.iter().find(|p| !self.metadata.has_metadata(p.job.id)) {
                    return Err(unresolvable(format!(
                        "{} is in no valid checkpoint, not in main, and its metadata is gone",
                        p.job.id
                    )));
                }
            }
            let temp_runs: Vec<Vec<PlacedJob>> = runs
                .iter()
                .filter(|(s, _)| *s == Source::Temp)
                .map(|(_, run)| run.iter().map(|p| (*p).clone()).collect())
                .collect();
            let tasks: Vec<_> = temp_runs
                .iter()
                .map(|jobs| move || self.playback.build_temp(jobs, cancel))
                .collect();
            let mut temps = Vec::with_capacity(temp_runs.len());
            for res in run_bounded(tasks, self.parallelism) {
                match res {
                    Ok(h) => temps.push(h),
                    Err(Error::MissingJobMetadata(job)) => {
                        return Err(unresolvable(format!("metadata for {job} vanished during playback")));
                    }
                    Err(e) => return Err(e),
                }
            }
            let mut temps = temps.into_iter();

            let mut segments = Vec::with_capacity(runs.len());
            for (src, run) in &runs {
                let (handle, provenance, lease) = match src {
                    Source::Main => {
                        let (h, lease) = main
                            .clone()
                            .ok_or_else(|| unresolvable("main index vanished".into()))?;
                        (h, Provenance::Main, Some(lease))
                    }
                    Source::Checkpoint(id) => {
                        let h = restored
                            .get(id)
                            .cloned()
                            .ok_or_else(|| unresolvable(format!("{id} was not restored")))?;
                        (h, Provenance::Checkpoint(*id), None)
                    }
                    Source::Temp => {
                        let h = temps
                            .next()
                            .ok_or_else(|| unresolvable("temp index missing".into()))?;
                        (h, Provenance::Temp, None)
                    }
                };
                debug!(
                    provenance = %provenance,
                    jobs = run.len(),
                    dir = %handle.path.display(),
                    "sub-range resolved"
                );
                segments.push(ResolvedSegment {
                    sub_range: sub_range(run),
                    handle,
                    provenance,
                    show_deleted,
                    lease,
                });
            }
            info!(
                from = plan.bounds.from,
                to = plan.bounds.to,
                jobs = plan.jobs.len(),
                segments = segments.len(),
                "browse resolved"
            );
            return Ok(segments);
        }
    }
}
