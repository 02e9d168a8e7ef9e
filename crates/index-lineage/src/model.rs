//! Core value types shared by every component: jobs, cycles, ids and the
//! per-file version events a backup job records.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Seconds since the Unix epoch.
pub type Timestamp = i64;

macro_rules! ordinal_id {
    ($name:ident, $prefix:literal) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

ordinal_id!(JobId, "job-");
ordinal_id!(CycleId, "cycle-");
ordinal_id!(CheckpointId, "checkpoint-");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupLevel {
    Full,
    SyntheticFull,
    Incremental,
}

impl BackupLevel {
    /// Full and synthetic full jobs open a new cycle.
    pub fn starts_cycle(self) -> bool {
        matches!(self, BackupLevel::Full | BackupLevel::SyntheticFull)
    }
}

impl fmt::Display for BackupLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackupLevel::Full => "full",
            BackupLevel::SyntheticFull => "synthetic_full",
            BackupLevel::Incremental => "incremental",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub level: BackupLevel,
    pub start_ts: Timestamp,
    pub end_ts: Timestamp,
}

impl Job {
    pub fn new(id: u64, level: BackupLevel, start_ts: Timestamp, end_ts: Timestamp) -> Self {
        Self {
            id: JobId::new(id),
            level,
            start_ts,
            end_ts,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.end_ts < self.start_ts {
            return Err(Error::InvalidJob {
                job: self.id,
                reason: format!("ends at {} before it starts at {}", self.end_ts, self.start_ts),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionOp {
    Write,
    Delete,
}

/// One file/object version produced by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEvent {
    pub path: String,
    pub op: VersionOp,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mtime: Timestamp,
}

impl VersionEvent {
    pub fn write(path: impl Into<String>, size: u64, mtime: Timestamp) -> Self {
        Self {
            path: path.into(),
            op: VersionOp::Write,
            size,
            mtime,
        }
    }

    pub fn delete(path: impl Into<String>, mtime: Timestamp) -> Self {
        Self {
            path: path.into(),
            op: VersionOp::Delete,
            size: 0,
            mtime,
        }
    }
}

/// A full (or synthetic full) job plus the incrementals that depend on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cycle {
    pub id: CycleId,
    pub jobs: Vec<Job>,
    /// Set when the cycle was opened by an orphan incremental instead of a
    /// full backup.
    #[serde(default)]
    pub synthesized: bool,
}

impl Cycle {
    pub fn start_ts(&self) -> Timestamp {
        self.jobs.first().map(|j| j.start_ts).unwrap_or_default()
    }

    pub fn end_ts(&self) -> Timestamp {
        self.jobs.iter().map(|j| j.end_ts).max().unwrap_or_default()
    }

    pub fn job_ids(&self) -> impl Iterator<Item = JobId> + '_ {
        self.jobs.iter().map(|j| j.id)
    }

    pub fn contains_job(&self, job: JobId) -> bool {
        self.jobs.iter().any(|j| j.id == job)
    }

    pub fn intersects(&self, range: TimeRange) -> bool {
        range.intersects(self.start_ts(), self.end_ts())
    }

    pub fn placed_jobs(&self) -> impl Iterator<Item = PlacedJob> + '_ {
        self.jobs.iter().map(|j| PlacedJob {
            job: j.clone(),
            cycle: self.id,
        })
    }
}

/// A job together with the cycle the tracker put it in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedJob {
    pub job: Job,
    pub cycle: CycleId,
}

/// Inclusive time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: Timestamp,
    pub to: Timestamp,
}

impl TimeRange {
    pub fn new(from: Timestamp, to: Timestamp) -> Result<Self> {
        if to < from {
            return Err(Error::UnresolvableRange {
                from,
                to,
                reason: "range end precedes its start".into(),
            });
        }
        Ok(Self { from, to })
    }

    pub fn intersects(&self, start: Timestamp, end: Timestamp) -> bool {
        start <= self.to && end >= self.from
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.from, self.to)
    }
}

/// Identifier of a tracked entity (subclient/backupset) owning one index
/// lineage.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    pub fn parse(raw: &str) -> Result<Self> {
        let id = raw.trim();
        if id.is_empty() {
            return Err(Error::config("entity id is empty"));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
        {
            return Err(Error::config(format!(
                "entity id '{id}' contains invalid characters"
            )));
        }
        if id == "." || id == ".." {
            return Err(Error::config(format!("entity id '{id}' is reserved")));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EntityId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<EntityId> for String {
    fn from(value: EntityId) -> Self {
        value.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
