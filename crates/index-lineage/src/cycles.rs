use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::model::{Cycle, CycleId, Job, JobId, PlacedJob, TimeRange};

/// Where `record_job` put a job.
#[derive(Debug)]
pub struct Placement {
    pub cycle: CycleId,
    /// The job opened a new cycle.
    pub opened: bool,
    /// The cycle that the job's arrival completed, if any.
    pub completed: Option<CycleId>,
    /// Non-fatal ingestion anomaly, already absorbed by the tracker.
    pub anomaly: Option<Error>,
}

/// Groups the ordered job stream of one entity into cycles. Cycles are
/// append-only: a cycle is never split, merged or edited once the next one
/// has begun.
#[derive(Debug, Default)]
pub struct CycleTracker {
    cycles: Vec<Cycle>,
    by_job: HashMap<JobId, usize>,
}

impl CycleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a tracker from a persisted job stream in ingestion order.
    /// Anomalies were reported when the jobs were first seen.
    pub fn replay<I: IntoIterator<Item = Job>>(jobs: I) -> Result<Self> {
        let mut tracker = Self::new();
        for job in jobs {
            tracker.record_job(job)?;
        }
        Ok(tracker)
    }

    /// Checks that `job` could be recorded next without recording it.
    pub fn check(&self, job: &Job) -> Result<()> {
        job.validate()?;
        if self.by_job.contains_key(&job.id) {
            return Err(Error::DuplicateJob(job.id));
        }
        if let Some(last) = self.cycles.last().and_then(|c| c.jobs.last())
            && job.start_ts < last.start_ts
        {
            return Err(Error::InvalidJob {
                job: job.id,
                reason: format!(
                    "starts at {} before previously recorded {} ({})",
                    job.start_ts, last.id, last.start_ts
                ),
            });
        }
        Ok(())
    }

    /// Where `job` would land if recorded next, without recording it.
    pub fn place(&self, job: &Job) -> Result<Placement> {
        self.check(job)?;

        let mut anomaly = None;
        let opens = if job.level.starts_cycle() {
            true
        } else if self.cycles.is_empty() {
            anomaly = Some(Error::MalformedSequence { job: job.id });
            true
        } else {
            false
        };

        let last = self.cycles.last().map(|c| c.id);
        let (cycle, completed) = match last {
            Some(id) if !opens => (id, None),
            _ => (CycleId::new(self.cycles.len() as u64 + 1), last),
        };
        Ok(Placement {
            cycle,
            opened: opens,
            completed,
            anomaly,
        })
    }

    pub fn record_job(&mut self, job: Job) -> Result<Placement> {
        let placement = self.place(&job)?;
        if placement.opened {
            self.cycles.push(Cycle {
                id: placement.cycle,
                jobs: Vec::new(),
                synthesized: placement.anomaly.is_some(),
            });
        }
        let idx = self.cycles.len() - 1;
        self.by_job.insert(job.id, idx);
        self.cycles[idx].jobs.push(job);
        Ok(placement)
    }

    pub fn cycles(&self) -> &[Cycle] {
        &self.cycles
    }

    pub fn cycle(&self, id: CycleId) -> Option<&Cycle> {
        let idx = usize::try_from(id.get()).ok()?.checked_sub(1)?;
        self.cycles.get(idx)
    }

    /// Chronological cycles whose span intersects `range`.
    pub fn cycles_in_range(&self, range: TimeRange) -> Vec<&Cycle> {
        self.cycles.iter().filter(|c| c.intersects(range)).collect()
    }

    pub fn cycle_containing(&self, job: JobId) -> Result<&Cycle> {
        self.by_job
            .get(&job)
            .and_then(|idx| self.cycles.get(*idx))
            .ok_or_else(|| Error::not_found(format!("cycle for {job}")))
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.cycle_containing(id)
            .ok()
            .and_then(|c| c.jobs.iter().find(|j| j.id == id))
    }

    /// The last cycle, which may still receive incrementals.
    pub fn open_cycle(&self) -> Option<&Cycle> {
        self.cycles.last()
    }

    pub fn placed(&self, id: JobId) -> Option<PlacedJob> {
        let cycle = self.cycle_containing(id).ok()?;
        let job = cycle.jobs.iter().find(|j| j.id == id)?;
        Some(PlacedJob {
            job: job.clone(),
            cycle: cycle.id,
        })
    }

    pub fn job_count(&self) -> usize {
        self.by_job.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BackupLevel::{Full, Incremental, SyntheticFull};

    fn tracker_with(jobs: &[(u64, crate::model::BackupLevel, i64)]) -> CycleTracker {
        let mut t = CycleTracker::new();
        for (id, level, start) in jobs {
            t.record_job(Job::new(*id, *level, *start, start + 5))
                .expect("record");
        }
        t
    }

    #[test]
    fn full_and_synthetic_full_open_cycles() {
        let t = tracker_with(&[
            (1, Full, 0),
            (2, Incremental, 10),
            (3, SyntheticFull, 20),
            (4, Incremental, 30),
            (5, Incremental, 40),
            (6, Full, 50),
        ]);
        let ids: Vec<Vec<u64>> = t
            .cycles()
            .iter()
            .map(|c| c.job_ids().map(|j| j.get()).collect())
            .collect();
        assert_eq!(ids, vec![vec![1, 2], vec![3, 4, 5], vec![6]]);
        assert_eq!(t.cycle_containing(JobId::new(4)).expect("c").id, CycleId::new(2));
    }

    #[test]
    fn opening_job_reports_completed_cycle() {
        let mut t = tracker_with(&[(1, Full, 0), (2, Incremental, 10)]);
        let p = t
            .record_job(Job::new(3, Full, 20, 25))
            .expect("record");
        assert!(p.opened);
        assert_eq!(p.completed, Some(CycleId::new(1)));
        let p = t
            .record_job(Job::new(4, Incremental, 30, 35))
            .expect("record");
        assert!(!p.opened);
        assert_eq!(p.completed, None);
    }

    #[test]
    fn orphan_incremental_synthesizes_cycle_and_keeps_ingesting() {
        let mut t = CycleTracker::new();
        let p = t
            .record_job(Job::new(1, Incremental, 0, 5))
            .expect("record");
        assert!(matches!(p.anomaly, Some(Error::MalformedSequence { .. })));
        assert!(t.cycles()[0].synthesized);

        let p = t
            .record_job(Job::new(2, Incremental, 10, 15))
            .expect("record");
        assert!(p.anomaly.is_none());
        let p = t.record_job(Job::new(3, Full, 20, 25)).expect("record");
        assert_eq!(p.cycle, CycleId::new(2));
        assert!(!t.cycles()[1].synthesized);
    }

    #[test]
    fn place_predicts_without_recording() {
        let t = tracker_with(&[(1, Full, 0), (2, Incremental, 10)]);
        let p = t.place(&Job::new(3, Incremental, 20, 25)).expect("place");
        assert_eq!((p.cycle, p.opened, p.completed), (CycleId::new(1), false, None));
        let p = t.place(&Job::new(3, Full, 20, 25)).expect("place");
        assert_eq!(
            (p.cycle, p.opened, p.completed),
            (CycleId::new(2), true, Some(CycleId::new(1)))
        );
        assert_eq!(t.job_count(), 2);
        assert_eq!(t.cycles().len(), 1);
    }

    #[test]
    fn equal_start_times_keep_arrival_order() {
        let t = tracker_with(&[(5, Full, 100), (3, Incremental, 100)]);
        let replayed = CycleTracker::replay([
            Job::new(5, Full, 100, 105),
            Job::new(3, Incremental, 100, 105),
        ])
        .expect("replay");
        for tr in [&t, &replayed] {
            let ids: Vec<Vec<u64>> = tr
                .cycles()
                .iter()
                .map(|c| c.job_ids().map(|j| j.get()).collect())
                .collect();
            assert_eq!(ids, vec![vec![5, 3]]);
        }
    }

    #[test]
    fn range_query_returns_intersecting_cycles_in_order() {
        let t = tracker_with(&[
            (1, Full, 0),
            (2, Incremental, 10),
            (3, Full, 100),
            (4, Full, 200),
            (5, Incremental, 210),
        ]);
        let got: Vec<u64> = t
            .cycles_in_range(TimeRange::new(12, 150).expect("range"))
            .iter()
            .map(|c| c.id.get())
            .collect();
        assert_eq!(got, vec![1, 2]);
        assert!(
            t.cycles_in_range(TimeRange::new(300, 400).expect("range"))
                .is_empty()
        );
    }

    #[test]
    fn unknown_job_is_not_found() {
        let t = tracker_with(&[(1, Full, 0)]);
        assert!(matches!(
            t.cycle_containing(JobId::new(99)),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn duplicate_and_out_of_order_rejected() {
        let mut t = tracker_with(&[(1, Full, 100)]);
        assert!(matches!(
            t.record_job(Job::new(1, Incremental, 110, 120)),
            Err(Error::DuplicateJob(_))
        ));
        assert!(matches!(
            t.record_job(Job::new(2, Incremental, 50, 60)),
            Err(Error::InvalidJob { .. })
        ));
        assert_eq!(t.job_count(), 1);
    }
}
