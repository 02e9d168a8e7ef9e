use std::fmt;
use std::path::Path;

use crate::model::{CheckpointId, JobId, Timestamp};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An incremental arrived with no open cycle to attach to.
    #[error("malformed job sequence: incremental job {job} has no preceding full backup")]
    MalformedSequence { job: JobId },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("job {0} was already recorded")]
    DuplicateJob(JobId),

    #[error("invalid job {job}: {reason}")]
    InvalidJob { job: JobId, reason: String },

    #[error("checkpoint creation failed: {reason}")]
    CheckpointCreationFailed { reason: String },

    #[error("main index compaction failed: {reason}")]
    CompactionFailed { reason: String },

    #[error("range {from}..={to} cannot be resolved: {reason}")]
    UnresolvableRange {
        from: Timestamp,
        to: Timestamp,
        reason: String,
    },

    #[error("failed to materialize checkpoint {checkpoint}: {reason}")]
    CacheMaterializationFailed {
        checkpoint: CheckpointId,
        reason: String,
    },

    #[error("metadata for job {0} is missing from the job log")]
    MissingJobMetadata(JobId),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Encode {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("timed out waiting for lock {0}")]
    LockTimeout(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn io(context: impl fmt::Display, source: std::io::Error) -> Self {
        Self::Io {
            context: context.to_string(),
            source,
        }
    }

    pub fn io_at(verb: &str, path: &Path, source: std::io::Error) -> Self {
        Self::io(format!("failed to {verb} {}", path.display()), source)
    }

    pub fn encode(context: impl fmt::Display, source: serde_json::Error) -> Self {
        Self::Encode {
            context: context.to_string(),
            source,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::Config(msg.into())
    }

    /// Transient conditions that a later attempt may clear. Everything else
    /// is structural and needs a change in data or configuration.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io { .. }
                | Error::LockTimeout(_)
                | Error::CheckpointCreationFailed { .. }
                | Error::CompactionFailed { .. }
                | Error::CacheMaterializationFailed { .. }
        )
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_split() {
        let io = Error::io("failed to read x", std::io::Error::other("boom"));
        assert!(io.is_retryable());
        assert!(Error::LockTimeout("l".into()).is_retryable());
        assert!(
            !Error::UnresolvableRange {
                from: 1,
                to: 2,
                reason: "gone".into()
            }
            .is_retryable()
        );
        assert!(!Error::MalformedSequence { job: JobId::new(7) }.is_retryable());
        assert!(!Error::config("bad").is_retryable());
    }

    #[test]
    fn io_context_is_rendered() {
        let err = Error::io_at(
            "create",
            Path::new("/tmp/x"),
            std::io::Error::other("denied"),
        );
        assert_eq!(err.to_string(), "failed to create /tmp/x: denied");
    }
}
