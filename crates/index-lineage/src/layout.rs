use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::model::{CheckpointId, EntityId};

/// On-disk namespace of one entity's index lineage inside the cache root.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
    entity: EntityId,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>, entity: EntityId) -> Self {
        Self {
            root: root.into(),
            entity,
        }
    }

    pub fn entity(&self) -> &EntityId {
        &self.entity
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entity_dir(&self) -> PathBuf {
        self.root.join(self.entity.as_str())
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.entity_dir().join("catalog.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.entity_dir().join(".store.lock")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.entity_dir().join("jobs")
    }

    pub fn main_dir(&self) -> PathBuf {
        self.entity_dir().join("main")
    }

    pub fn main_pointer(&self) -> PathBuf {
        self.main_dir().join("CURRENT")
    }

    pub fn main_generation(&self, generation: u64) -> PathBuf {
        self.main_dir().join(format!("gen-{generation}"))
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.entity_dir().join("snapshots")
    }

    pub fn snapshot_rel(&self, checkpoint: CheckpointId) -> String {
        format!("snapshots/cp-{}", checkpoint.get())
    }

    pub fn restored_dir(&self) -> PathBuf {
        self.entity_dir().join("restored")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.entity_dir().join("temp")
    }

    /// Resolves a path stored relative to the entity directory, refusing
    /// anything that would escape it.
    pub fn resolve_rel(&self, rel: &str) -> Result<PathBuf> {
        let rel = rel.trim();
        if rel.is_empty() {
            return Err(Error::config("empty relative cache path"));
        }
        let p = Path::new(rel);
        if p.is_absolute()
            || p.components()
                .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            return Err(Error::config(format!(
                "invalid relative cache path '{rel}' (must stay under the entity directory)"
            )));
        }
        Ok(self.entity_dir().join(p))
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.jobs_dir(),
            self.main_dir(),
            self.snapshots_dir(),
            self.restored_dir(),
            self.temp_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| Error::io_at("create", &dir, e))?;
        }
        Ok(())
    }

    /// Removes `dir` only if it lies inside this entity's namespace.
    pub fn safe_remove_dir_all(&self, dir: &Path) -> Result<()> {
        if !dir.exists() {
            return Ok(());
        }
        let base = self.entity_dir();
        let base_can = base.canonicalize().unwrap_or(base);
        let dir_can = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
        if !dir_can.starts_with(&base_can) || dir_can == base_can {
            return Err(Error::config(format!(
                "refusing to remove '{}' (outside entity cache '{}')",
                dir_can.display(),
                base_can.display()
            )));
        }
        fs::remove_dir_all(&dir_can).map_err(|e| Error::io_at("remove dir", &dir_can, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> CacheLayout {
        CacheLayout::new("/tmp/idx-cache", EntityId::parse("sc1").expect("entity"))
    }

    #[test]
    fn paths_are_partitioned_by_entity() {
        let l = layout();
        assert_eq!(l.catalog_path(), PathBuf::from("/tmp/idx-cache/sc1/catalog.json"));
        assert_eq!(
            l.main_generation(3),
            PathBuf::from("/tmp/idx-cache/sc1/main/gen-3")
        );
        assert_eq!(l.snapshot_rel(CheckpointId::new(2)), "snapshots/cp-2");
    }

    #[test]
    fn resolve_rel_rejects_escape() {
        let l = layout();
        assert!(l.resolve_rel("snapshots/cp-1").is_ok());
        assert!(l.resolve_rel("../other/catalog.json").is_err());
        assert!(l.resolve_rel("/etc/passwd").is_err());
        assert!(l.resolve_rel("").is_err());
    }

    #[test]
    fn safe_remove_refuses_outside_entity() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let l = CacheLayout::new(tmp.path(), EntityId::parse("e").expect("entity"));
        l.ensure_dirs().expect("dirs");
        let outside = tmp.path().join("elsewhere");
        fs::create_dir_all(&outside).expect("outside");
        assert!(l.safe_remove_dir_all(&outside).is_err());
        assert!(outside.exists());
        l.safe_remove_dir_all(&l.temp_dir()).expect("remove temp");
        assert!(!l.temp_dir().exists());
    }
}
