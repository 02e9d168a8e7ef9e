use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use toml::Value;

use crate::error::{Error, Result};

fn default_lock_timeout_ms() -> u64 {
    15_000
}

fn default_cycles_to_retain() -> usize {
    2
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    pub root_dir: PathBuf,
    /// Quota for restored and temp DBs; Main is never counted or evicted.
    #[serde(default)]
    pub max_bytes: Option<u64>,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl CacheConfig {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            max_bytes: None,
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

/// Which cycles a freshly minted checkpoint covers.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointCoverage {
    /// Every cycle currently held by Main.
    #[default]
    MainSnapshot,
    /// Every cycle from the start of history through the newest Main cycle.
    FullHistory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionConfig {
    #[serde(default = "default_cycles_to_retain")]
    pub cycles_to_retain: usize,
    pub coverage: CheckpointCoverage,
    #[serde(default = "default_true")]
    pub auto_prune: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            cycles_to_retain: default_cycles_to_retain(),
            coverage: CheckpointCoverage::MainSnapshot,
            auto_prune: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrowseConfig {
    /// 0 = one worker per CPU.
    pub max_parallel: usize,
}

impl BrowseConfig {
    pub fn effective_parallelism(&self) -> usize {
        if self.max_parallel == 0 {
            num_cpus::get().max(1)
        } else {
            self.max_parallel
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            filter: "info".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub browse: BrowseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache: CacheConfig::new(root_dir),
            retention: RetentionConfig::default(),
            browse: BrowseConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let cfg: EngineConfig = value
            .try_into()
            .map_err(|e| Error::config(format!("failed to deserialize engine config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.root_dir.as_os_str().is_empty() {
            return Err(Error::config("cache.root_dir is empty"));
        }
        if self.retention.cycles_to_retain == 0 {
            return Err(Error::config(
                "retention.cycles_to_retain must be at least 1",
            ));
        }
        Ok(())
    }
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::config(format!(
            "config extends cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path).map_err(|e| Error::io_at("read config", path, e))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    if let Some(ext) = value.get("extends").and_then(Value::as_str) {
        out = load_value_inner(&resolve_ref_path(path, ext), stack)?;
    }
    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
    }
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

/// Loads an engine config, following a root-level `extends = "base.toml"`
/// chain. Relative `cache.root_dir` values resolve against the file that
/// declares the final merged document.
pub fn load(path: &Path) -> Result<EngineConfig> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value_inner(path, &mut stack)?;
    let mut cfg = EngineConfig::from_value(value)?;
    if cfg.cache.root_dir.is_relative() {
        cfg.cache.root_dir = resolve_ref_path(path, &cfg.cache.root_dir.to_string_lossy());
    }
    Ok(cfg)
}
