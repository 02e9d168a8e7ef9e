//! Physical index DB: a directory holding `db.json` (manifest) and
//! `versions.jsonl` (one version record per line, append-only).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::fsutil;
use crate::model::{CheckpointId, CycleId, Job, JobId, Timestamp, VersionEvent, VersionOp};

const MANIFEST_FILE: &str = "db.json";
const RECORDS_FILE: &str = "versions.jsonl";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexDbKind {
    Main,
    /// Backing snapshot owned by a checkpoint; never handed to readers
    /// directly.
    CheckpointSnapshot,
    RestoredCheckpoint,
    Temp,
}

impl fmt::Display for IndexDbKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IndexDbKind::Main => "main",
            IndexDbKind::CheckpointSnapshot => "checkpoint_snapshot",
            IndexDbKind::RestoredCheckpoint => "restored_checkpoint",
            IndexDbKind::Temp => "temp",
        };
        f.write_str(s)
    }
}

/// Stable id for the DB living at `entity`/`rel`: equal locations yield
/// equal ids.
pub fn db_id(entity: &str, rel: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entity.as_bytes());
    hasher.update(b"/");
    hasher.update(rel.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexDbHandle {
    pub id: String,
    pub kind: IndexDbKind,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDbManifest {
    pub version: u32,
    pub id: String,
    pub kind: IndexDbKind,
    pub entity: String,
    pub jobs: Vec<JobId>,
    pub cycles: Vec<CycleId>,
    pub start_ts: Option<Timestamp>,
    pub end_ts: Option<Timestamp>,
    pub record_count: u64,
    /// sha256 of the record file; sealed DBs only.
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub source_checkpoint: Option<CheckpointId>,
    pub created_at: String,
}

impl IndexDbManifest {
    fn empty(id: String, kind: IndexDbKind, entity: &str) -> Self {
        Self {
            version: FORMAT_VERSION,
            id,
            kind,
            entity: entity.to_string(),
            jobs: Vec::new(),
            cycles: Vec::new(),
            start_ts: None,
            end_ts: None,
            record_count: 0,
            digest: None,
            source_checkpoint: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    fn note_job(&mut self, job: &Job, cycle: CycleId, records: usize) {
        self.jobs.push(job.id);
        if !self.cycles.contains(&cycle) {
            self.cycles.push(cycle);
        }
        self.start_ts = Some(
            self.start_ts
                .map_or(job.start_ts, |s| s.min(job.start_ts)),
        );
        self.end_ts = Some(self.end_ts.map_or(job.end_ts, |e| e.max(job.end_ts)));
        self.record_count += records as u64;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub job: JobId,
    pub job_start: Timestamp,
    #[serde(flatten)]
    pub event: VersionEvent,
}

/// One path as seen by a browse at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrowseItem {
    pub path: String,
    pub size: u64,
    pub mtime: Timestamp,
    pub job: JobId,
    pub job_start: Timestamp,
    pub deleted: bool,
}

impl BrowseItem {
    /// Path made safe for terminals and logs.
    pub fn display_path(&self) -> String {
        crate::sanitize::sanitize_display(&self.path)
    }
}

pub fn manifest_path(dir: &Path) -> PathBuf {
    dir.join(MANIFEST_FILE)
}

pub fn records_path(dir: &Path) -> PathBuf {
    dir.join(RECORDS_FILE)
}

pub fn read_manifest(dir: &Path) -> Result<IndexDbManifest> {
    fsutil::read_json::<IndexDbManifest>(&manifest_path(dir))?
        .ok_or_else(|| Error::not_found(format!("index db manifest in {}", dir.display())))
}

pub fn write_manifest(dir: &Path, m: &IndexDbManifest) -> Result<()> {
    fsutil::write_json(&manifest_path(dir), m)
}

fn file_digest(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).map_err(|e| Error::io_at("open", path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| Error::io_at("read", path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn encode_records(w: &mut impl Write, job: &Job, events: &[VersionEvent], path: &Path) -> Result<()> {
    for ev in events {
        let rec = VersionRecord {
            job: job.id,
            job_start: job.start_ts,
            event: ev.clone(),
        };
        serde_json::to_writer(&mut *w, &rec)
            .map_err(|e| Error::encode(format!("failed to encode record for {}", job.id), e))?;
        w.write_all(b"\n").map_err(|e| Error::io_at("write", path, e))?;
    }
    Ok(())
}

/// Builds a new DB inside an (usually staged) directory.
pub struct IndexDbWriter {
    dir: PathBuf,
    out: BufWriter<fs::File>,
    manifest: IndexDbManifest,
    last_start: Option<Timestamp>,
}

impl IndexDbWriter {
    pub fn create(dir: &Path, id: String, kind: IndexDbKind, entity: &str) -> Result<Self> {
        fsutil::create_dir_all(dir)?;
        let rp = records_path(dir);
        let file = fs::File::create(&rp).map_err(|e| Error::io_at("create", &rp, e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            out: BufWriter::new(file),
            manifest: IndexDbManifest::empty(id, kind, entity),
            last_start: None,
        })
    }

    pub fn set_source_checkpoint(&mut self, checkpoint: CheckpointId) {
        self.manifest.source_checkpoint = Some(checkpoint);
    }

    /// Jobs must arrive in start-time order; replay is single pass.
    pub fn append_job(&mut self, job: &Job, cycle: CycleId, events: &[VersionEvent]) -> Result<()> {
        if let Some(prev) = self.last_start
            && job.start_ts < prev
        {
            return Err(Error::InvalidJob {
                job: job.id,
                reason: "replayed out of start-time order".into(),
            });
        }
        let rp = records_path(&self.dir);
        encode_records(&mut self.out, job, events, &rp)?;
        self.manifest.note_job(job, cycle, events.len());
        self.last_start = Some(job.start_ts);
        Ok(())
    }

    /// Flushes records, stamps the digest and writes the manifest.
    pub fn finish(mut self) -> Result<IndexDbManifest> {
        let rp = records_path(&self.dir);
        self.out.flush().map_err(|e| Error::io_at("flush", &rp, e))?;
        self.out
            .get_ref()
            .sync_all()
            .map_err(|e| Error::io_at("sync", &rp, e))?;
        self.manifest.digest = Some(file_digest(&rp)?);
        write_manifest(&self.dir, &self.manifest)?;
        Ok(self.manifest)
    }
}

/// A crashed append can leave a partial last line behind.
fn ends_mid_line(path: &Path) -> Result<bool> {
    let mut file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(Error::io_at("open", path, e)),
    };
    let len = file
        .metadata()
        .map_err(|e| Error::io_at("stat", path, e))?
        .len();
    if len == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))
        .and_then(|_| file.read_exact(&mut last))
        .map_err(|e| Error::io_at("read", path, e))?;
    Ok(last[0] != b'\n')
}

/// Appends one job to an existing, unsealed DB (the live Main). Records are
/// written before the manifest lists the job, so readers never see a job
/// whose records are incomplete.
pub fn append_job_in_place(dir: &Path, job: &Job, cycle: CycleId, events: &[VersionEvent]) -> Result<IndexDbManifest> {
    let mut manifest = read_manifest(dir)?;
    if manifest.jobs.contains(&job.id) {
        return Err(Error::DuplicateJob(job.id));
    }
    let rp = records_path(dir);
    let torn = ends_mid_line(&rp)?;
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&rp)
        .map_err(|e| Error::io_at("open", &rp, e))?;
    let mut out = BufWriter::new(file);
    if torn {
        out.write_all(b"\n").map_err(|e| Error::io_at("write", &rp, e))?;
    }
    encode_records(&mut out, job, events, &rp)?;
    out.flush().map_err(|e| Error::io_at("flush", &rp, e))?;
    manifest.note_job(job, cycle, events.len());
    manifest.digest = None;
    write_manifest(dir, &manifest)?;
    Ok(manifest)
}

/// Creates an empty, unsealed DB.
pub fn create_empty(dir: &Path, id: String, kind: IndexDbKind, entity: &str) -> Result<IndexDbManifest> {
    fsutil::create_dir_all(dir)?;
    let rp = records_path(dir);
    fs::File::create(&rp).map_err(|e| Error::io_at("create", &rp, e))?;
    let m = IndexDbManifest::empty(id, kind, entity);
    write_manifest(dir, &m)?;
    Ok(m)
}

/// Read side of an index DB.
#[derive(Debug)]
pub struct IndexDb {
    dir: PathBuf,
    manifest: IndexDbManifest,
}

impl IndexDb {
    pub fn open(dir: &Path) -> Result<Self> {
        Ok(Self {
            dir: dir.to_path_buf(),
            manifest: read_manifest(dir)?,
        })
    }

    pub fn manifest(&self) -> &IndexDbManifest {
        &self.manifest
    }

    pub fn job_ids(&self) -> &[JobId] {
        &self.manifest.jobs
    }

    /// Checks the record file against the sealed digest. Unsealed DBs pass.
    pub fn verify(&self) -> Result<()> {
        let Some(expected) = self.manifest.digest.as_deref() else {
            return Ok(());
        };
        let rp = records_path(&self.dir);
        if !rp.is_file() {
            return Err(Error::not_found(format!("record file {}", rp.display())));
        }
        let got = file_digest(&rp)?;
        if got != expected {
            return Err(Error::io(
                format!("digest mismatch for {}", rp.display()),
                std::io::Error::from(std::io::ErrorKind::InvalidData),
            ));
        }
        Ok(())
    }

    /// Records of the jobs the manifest lists. In an unsealed DB torn lines
    /// (an append in flight or cut short by a crash) are skipped; a sealed DB
    /// must parse completely.
    pub fn records(&self) -> Result<Vec<VersionRecord>> {
        let rp = records_path(&self.dir);
        let file = fs::File::open(&rp).map_err(|e| Error::io_at("open", &rp, e))?;
        let listed: BTreeSet<JobId> = self.manifest.jobs.iter().copied().collect();
        let sealed = self.manifest.digest.is_some();
        let mut out = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| Error::io_at("read", &rp, e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<VersionRecord>(&line) {
                Ok(rec) if listed.contains(&rec.job) => out.push(rec),
                Ok(_) => {}
                Err(_) if !sealed => {}
                Err(e) => {
                    return Err(Error::encode(format!("failed to parse {}", rp.display()), e));
                }
            }
        }
        Ok(out)
    }

    /// Latest version of every path among jobs started at or before `at`.
    pub fn items_at(&self, at: Timestamp, show_deleted: bool) -> Result<Vec<BrowseItem>> {
        let recs = self.records()?.into_iter().filter(|r| r.job_start <= at);
        Ok(latest_versions(recs, show_deleted))
    }

    /// Latest version of every path among `jobs` only.
    pub fn items_of(&self, jobs: &BTreeSet<JobId>, show_deleted: bool) -> Result<Vec<BrowseItem>> {
        let recs = self.records()?.into_iter().filter(|r| jobs.contains(&r.job));
        Ok(latest_versions(recs, show_deleted))
    }
}

/// Folds version records into one item per path; the record of the latest
/// starting job wins.
pub fn latest_versions<I>(records: I, show_deleted: bool) -> Vec<BrowseItem>
where
    I: IntoIterator<Item = VersionRecord>,
{
    let mut latest = BTreeMap::<String, BrowseItem>::new();
    for rec in records {
        let item = BrowseItem {
            path: rec.event.path,
            size: rec.event.size,
            mtime: rec.event.mtime,
            job: rec.job,
            job_start: rec.job_start,
            deleted: rec.event.op == VersionOp::Delete,
        };
        match latest.get(&item.path) {
            Some(prev) if prev.job_start > item.job_start => {}
            _ => {
                latest.insert(item.path.clone(), item);
            }
        }
    }
    latest
        .into_values()
        .filter(|i| show_deleted || !i.deleted)
        .collect()
}
