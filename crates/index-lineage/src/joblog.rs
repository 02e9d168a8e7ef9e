use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::fsutil;
use crate::model::{Job, JobId, VersionEvent};

/// Source of the per-job version events that playback replays.
pub trait JobMetadata: Send + Sync {
    fn events(&self, job: JobId) -> Result<Vec<VersionEvent>>;

    /// Cheap probe: can `job` be replayed at all.
    fn has_metadata(&self, job: JobId) -> bool;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobHeader {
    version: u32,
    /// Ingestion order; replay follows it, not start times, since jobs may
    /// share a start time.
    #[serde(default)]
    seq: u64,
    job: Job,
    event_count: usize,
    recorded_at: String,
}

/// Append-only, file-backed record of every ingested job. The header of a
/// job outlives its events: discarding metadata keeps the job in the cycle
/// history while making it unreplayable.
#[derive(Debug)]
pub struct JobLog {
    dir: PathBuf,
    next_seq: AtomicU64,
}

impl JobLog {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fsutil::create_dir_all(&dir)?;
        let log = Self {
            dir,
            next_seq: AtomicU64::new(1),
        };
        let last = log.headers()?.iter().map(|h| h.seq).max().unwrap_or(0);
        log.next_seq.store(last + 1, Ordering::Release);
        Ok(log)
    }

    fn header_path(&self, job: JobId) -> PathBuf {
        self.dir.join(format!("{}.job.json", job.get()))
    }

    fn events_path(&self, job: JobId) -> PathBuf {
        self.dir.join(format!("{}.events.jsonl", job.get()))
    }

    pub fn append(&self, job: &Job, events: &[VersionEvent]) -> Result<()> {
        let header_path = self.header_path(job.id);
        if header_path.exists() {
            return Err(Error::DuplicateJob(job.id));
        }

        // Events land first so a header never points at missing data.
        let mut body = String::new();
        for ev in events {
            let line = serde_json::to_string(ev)
                .map_err(|e| Error::encode(format!("failed to encode event of {}", job.id), e))?;
            body.push_str(&line);
            body.push('\n');
        }
        fsutil::atomic_write_text(&self.events_path(job.id), &body)?;
        fsutil::write_json(
            &header_path,
            &JobHeader {
                version: 2,
                seq: self.next_seq.fetch_add(1, Ordering::AcqRel),
                job: job.clone(),
                event_count: events.len(),
                recorded_at: chrono::Utc::now().to_rfc3339(),
            },
        )?;
        debug!(job = %job.id, events = events.len(), "job metadata recorded");
        Ok(())
    }

    /// Forgets a job entirely, header and events, as if it was never
    /// appended. Used to back out an ingestion that failed further on.
    pub fn remove(&self, job: JobId) -> Result<()> {
        fsutil::clear_dir_or_file(&self.header_path(job))?;
        fsutil::clear_dir_or_file(&self.events_path(job))?;
        debug!(job = %job, "job metadata rolled back");
        Ok(())
    }

    /// All recorded jobs in ingestion order.
    pub fn jobs(&self) -> Result<Vec<Job>> {
        let mut headers = self.headers()?;
        headers.sort_by_key(|h| (h.seq, h.job.start_ts, h.job.id));
        Ok(headers.into_iter().map(|h| h.job).collect())
    }

    fn headers(&self) -> Result<Vec<JobHeader>> {
        let mut out = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| Error::io_at("list", &self.dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io_at("list", &self.dir, e))?;
            let path = entry.path();
            let is_header = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".job.json") && !n.starts_with('.'));
            if !is_header {
                continue;
            }
            if let Some(h) = fsutil::read_json::<JobHeader>(&path)? {
                out.push(h);
            }
        }
        Ok(out)
    }

    /// Drops a job's events, as when its index logs age out.
    pub fn discard(&self, job: JobId) -> Result<bool> {
        let p = self.events_path(job);
        if !p.exists() {
            return Ok(false);
        }
        fsutil::clear_dir_or_file(&p)?;
        warn!(job = %job, "job metadata discarded");
        Ok(true)
    }
}

fn read_events(path: &Path, job: JobId) -> Result<Vec<VersionEvent>> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::MissingJobMetadata(job));
        }
        Err(e) => return Err(Error::io_at("open", path, e)),
    };
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| Error::io_at("read", path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let ev = serde_json::from_str::<VersionEvent>(&line)
            .map_err(|e| Error::encode(format!("failed to parse {}", path.display()), e))?;
        out.push(ev);
    }
    Ok(out)
}

impl JobMetadata for JobLog {
    fn events(&self, job: JobId) -> Result<Vec<VersionEvent>> {
        read_events(&self.events_path(job), job)
    }

    fn has_metadata(&self, job: JobId) -> bool {
        self.events_path(job).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BackupLevel;

    #[test]
    fn append_then_read_back() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let log = JobLog::open(tmp.path().join("jobs")).expect("open");
        let job = Job::new(7, BackupLevel::Full, 100, 110);
        let events = vec![
            VersionEvent::write("/a", 3, 99),
            VersionEvent::delete("/b", 99),
        ];
        log.append(&job, &events).expect("append");
        assert_eq!(log.events(job.id).expect("events"), events);
        assert_eq!(log.jobs().expect("jobs"), vec![job.clone()]);
        assert!(matches!(log.append(&job, &[]), Err(Error::DuplicateJob(_))));
    }

    fn ids(log: &JobLog) -> Vec<u64> {
        log.jobs()
            .expect("jobs")
            .iter()
            .map(|j| j.id.get())
            .collect()
    }

    #[test]
    fn jobs_come_back_in_ingestion_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let log = JobLog::open(tmp.path()).expect("open");
        log.append(&Job::new(5, BackupLevel::Full, 100, 110), &[])
            .expect("append");
        log.append(&Job::new(3, BackupLevel::Incremental, 100, 120), &[])
            .expect("append");
        assert_eq!(ids(&log), vec![5, 3]);

        drop(log);
        let log = JobLog::open(tmp.path()).expect("reopen");
        assert_eq!(ids(&log), vec![5, 3]);
        log.append(&Job::new(1, BackupLevel::Incremental, 100, 130), &[])
            .expect("append after reopen");
        assert_eq!(ids(&log), vec![5, 3, 1]);
    }

    #[test]
    fn removed_job_can_be_appended_again() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let log = JobLog::open(tmp.path()).expect("open");
        let job = Job::new(4, BackupLevel::Full, 0, 1);
        log.append(&job, &[VersionEvent::write("/x", 1, 0)])
            .expect("append");
        log.remove(job.id).expect("remove");
        assert!(log.jobs().expect("jobs").is_empty());
        assert!(!log.has_metadata(job.id));
        log.append(&job, &[]).expect("append again");
        assert_eq!(ids(&log), vec![4]);
    }

    #[test]
    fn discard_keeps_header_but_drops_events() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let log = JobLog::open(tmp.path()).expect("open");
        let job = Job::new(3, BackupLevel::Full, 0, 1);
        log.append(&job, &[VersionEvent::write("/x", 1, 0)])
            .expect("append");
        assert!(log.has_metadata(job.id));
        assert!(log.discard(job.id).expect("discard"));
        assert!(!log.has_metadata(job.id));
        assert!(!log.discard(job.id).expect("second discard"));
        assert_eq!(log.jobs().expect("jobs").len(), 1);
        assert!(matches!(
            log.events(job.id),
            Err(Error::MissingJobMetadata(_))
        ));
    }
}
