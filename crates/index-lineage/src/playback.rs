use std::sync::Arc;

use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::cache::{self, IndexCache};
use crate::error::{Error, Result};
use crate::indexdb::{IndexDbHandle, IndexDbKind, IndexDbWriter};
use crate::joblog::JobMetadata;
use crate::model::PlacedJob;

/// Replays `jobs` into `w` in start-time order. Single pass, append-only;
/// only the job metadata source is consulted.
pub fn replay(
    w: &mut IndexDbWriter,
    jobs: &[PlacedJob],
    metadata: &dyn JobMetadata,
    cancel: &CancelToken,
) -> Result<()> {
    let mut ordered: Vec<&PlacedJob> = jobs.iter().collect();
    ordered.sort_by_key(|p| (p.job.start_ts, p.job.id));
    for p in ordered {
        cancel.check()?;
        let events = metadata.events(p.job.id)?;
        w.append_job(&p.job, p.cycle, &events)?;
    }
    Ok(())
}

/// Builds throwaway index DBs for jobs that neither Main nor a valid
/// checkpoint can serve.
#[derive(Clone)]
pub struct PlaybackEngine {
    cache: Arc<IndexCache>,
    metadata: Arc<dyn JobMetadata>,
}

impl PlaybackEngine {
    pub fn new(cache: Arc<IndexCache>, metadata: Arc<dyn JobMetadata>) -> Self {
        Self { cache, metadata }
    }

    /// Temp DB holding exactly `jobs`. Identical job sets map to the same
    /// directory, so a repeated request is a cache hit.
    pub fn build_temp(&self, jobs: &[PlacedJob], cancel: &CancelToken) -> Result<IndexDbHandle> {
        let mut ordered = jobs.to_vec();
        ordered.sort_by_key(|p| (p.job.start_ts, p.job.id));
        ordered.dedup_by_key(|p| p.job.id);
        let first = ordered
            .first()
            .ok_or_else(|| Error::not_found("jobs to replay"))?;
        let ids: Vec<_> = ordered.iter().map(|p| p.job.id).collect();
        let name = cache::temp_name(first.job.start_ts, &ids);

        if let Some(hit) = self.cache.cached(IndexDbKind::Temp, &name) {
            debug!(dir = %hit.path.display(), jobs = ids.len(), "temp index reused");
            return Ok(hit);
        }
        cancel.check()?;
        let handle = self.cache.build(IndexDbKind::Temp, &name, |w| {
            replay(w, &ordered, self.metadata.as_ref(), cancel)
        })?;
        info!(dir = %handle.path.display(), jobs = ids.len(), "temp index built");
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::joblog::JobLog;
    use crate::layout::CacheLayout;
    use crate::model::{BackupLevel, CycleId, EntityId, Job, VersionEvent};

    fn setup(root: &std::path::Path) -> (PlaybackEngine, Arc<JobLog>, Vec<PlacedJob>) {
        let layout = CacheLayout::new(root, EntityId::parse("e").expect("entity"));
        let cache = Arc::new(IndexCache::open(layout.clone()).expect("cache"));
        let log = Arc::new(JobLog::open(layout.jobs_dir()).expect("log"));
        let mut placed = Vec::new();
        for (id, level, start) in [
            (1, BackupLevel::Full, 0),
            (2, BackupLevel::Incremental, 10),
            (3, BackupLevel::Incremental, 20),
        ] {
            let job = Job::new(id, level, start, start + 5);
            log.append(&job, &[VersionEvent::write(format!("/f{id}"), id, start)])
                .expect("append");
            placed.push(PlacedJob {
                job,
                cycle: CycleId::new(1),
            });
        }
        (PlaybackEngine::new(cache, log.clone()), log, placed)
    }

    #[test]
    fn temp_holds_exactly_requested_jobs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (pb, _log, placed) = setup(tmp.path());
        let subset = vec![placed[2].clone(), placed[0].clone()];
        let h = pb.build_temp(&subset, &CancelToken::new()).expect("build");
        let db = cache::open_db(&h).expect("open");
        let ids: Vec<u64> = db.job_ids().iter().map(|j| j.get()).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(h.kind, IndexDbKind::Temp);

        let again = pb.build_temp(&subset, &CancelToken::new()).expect("rebuild");
        assert_eq!(again, h);
    }

    #[test]
    fn missing_metadata_aborts_without_leftovers() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (pb, log, placed) = setup(tmp.path());
        log.discard(placed[1].job.id).expect("discard");
        let err = pb.build_temp(&placed, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, Error::MissingJobMetadata(_)));
        assert!(pb.cache.inventory().is_empty());
    }

    #[test]
    fn cancelled_playback_is_discarded() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (pb, _log, placed) = setup(tmp.path());
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            pb.build_temp(&placed, &cancel),
            Err(Error::Cancelled)
        ));
        assert!(pb.cache.inventory().is_empty());
    }
}
