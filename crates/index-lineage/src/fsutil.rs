use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Process-unique suffix for staging names.
pub fn unique_suffix() -> String {
    format!(
        "{}.{}.{}",
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        STAGING_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

pub fn create_dir_all(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| Error::io_at("create", path, e))
}

pub fn atomic_write_text(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    let file_name = path.file_name().and_then(|s| s.to_str()).ok_or_else(|| {
        Error::io(
            format!("invalid file path for atomic write: {}", path.display()),
            std::io::Error::from(std::io::ErrorKind::InvalidInput),
        )
    })?;
    let tmp = path.with_file_name(format!(".{file_name}.tmp.{}", unique_suffix()));
    fs::write(&tmp, body).map_err(|e| Error::io_at("write temp file", &tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::io(
            format!("failed to rename {} -> {}", tmp.display(), path.display()),
            e,
        )
    })
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value)
        .map_err(|e| Error::encode(format!("failed to encode {}", path.display()), e))?;
    atomic_write_text(path, &body)
}

/// `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::io_at("read", path, e)),
    };
    serde_json::from_str::<T>(&raw)
        .map(Some)
        .map_err(|e| Error::encode(format!("failed to parse {}", path.display()), e))
}

pub fn clear_dir_or_file(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            if meta.file_type().is_dir() {
                fs::remove_dir_all(path).map_err(|e| Error::io_at("remove directory", path, e))
            } else {
                fs::remove_file(path).map_err(|e| Error::io_at("remove", path, e))
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io_at("inspect before cleanup", path, e)),
    }
}

/// Recursive copy of a regular file tree. Index DB directories never hold
/// symlinks, so links are rejected rather than followed.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    create_dir_all(dst)?;
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| {
            Error::io(
                format!("failed to walk {}", src.display()),
                std::io::Error::other(e.to_string()),
            )
        })?;
        let p = entry.path();
        let rel = p.strip_prefix(src).map_err(|e| {
            Error::io(
                format!("failed to relativize {}", p.display()),
                std::io::Error::other(e.to_string()),
            )
        })?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out = dst.join(rel);
        if entry.file_type().is_dir() {
            create_dir_all(&out)?;
        } else if entry.file_type().is_symlink() {
            return Err(Error::io(
                format!("refusing to copy symlink {}", p.display()),
                std::io::Error::from(std::io::ErrorKind::InvalidData),
            ));
        } else {
            if let Some(parent) = out.parent() {
                create_dir_all(parent)?;
            }
            fs::copy(p, &out).map_err(|e| {
                Error::io(
                    format!("failed to copy {} -> {}", p.display(), out.display()),
                    e,
                )
            })?;
        }
    }
    Ok(())
}

pub fn dir_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Marks a cache directory as recently used.
pub fn touch(path: &Path) {
    let _ = filetime::set_file_mtime(path, filetime::FileTime::now());
}

pub fn mtime(path: &Path) -> Option<filetime::FileTime> {
    fs::metadata(path)
        .ok()
        .map(|m| filetime::FileTime::from_last_modification_time(&m))
}

/// Directory staged under a hidden name and renamed into place on commit.
/// Dropping an uncommitted staging dir deletes it, so a cancelled or failed
/// build never leaves a half-written directory under the final name.
pub struct StagingDir {
    path: PathBuf,
    committed: bool,
}

impl StagingDir {
    pub fn create(parent: &Path, final_name: &str) -> Result<Self> {
        let path = parent.join(format!(".partial-{final_name}-{}", unique_suffix()));
        create_dir_all(&path)?;
        Ok(Self {
            path,
            committed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `false` when another builder already published `dst`; the
    /// staged copy is discarded in that case.
    pub fn commit(mut self, dst: &Path) -> Result<bool> {
        if dst.exists() {
            return Ok(false);
        }
        match fs::rename(&self.path, dst) {
            Ok(()) => {
                self.committed = true;
                Ok(true)
            }
            Err(_) if dst.exists() => Ok(false),
            Err(e) => Err(Error::io(
                format!(
                    "failed to publish {} -> {}",
                    self.path.display(),
                    dst.display()
                ),
                e,
            )),
        }
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}

pub struct StoreLock {
    path: PathBuf,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub fn acquire_store_lock(path: &Path, timeout: Duration) -> Result<StoreLock> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    let deadline = Instant::now() + timeout;
    loop {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(_) => {
                return Ok(StoreLock {
                    path: path.to_path_buf(),
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if Instant::now() >= deadline {
                    return Err(Error::LockTimeout(path.display().to_string()));
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => return Err(Error::io_at("acquire lock", path, e)),
        }
    }
}
