//! 缓存配置：目录、告警阈值与开关，可从环境变量或 YAML 文件加载。
//!
//! Cache configuration.
//!
//! Resolution order for [`CacheConfig::from_env`]:
//!
//! | Source | Keys |
//! |--------|------|
//! | defaults | `<temp_dir>/provesid_cache`, 5 GB threshold, warnings on |
//! | `PROVESID_CACHE_CONFIG` | YAML file with the fields of [`CacheConfig`] |
//! | environment | `PROVESID_CACHE_DIR`, `PROVESID_CACHE_WARN_GB`, `PROVESID_CACHE_WARNINGS` |

use crate::cache::monitor::{bytes_to_gb, gb_to_bytes, DEFAULT_WARNING_THRESHOLD_BYTES};
use crate::{Error, ErrorContext, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const ENV_CACHE_DIR: &str = "PROVESID_CACHE_DIR";
pub const ENV_WARN_GB: &str = "PROVESID_CACHE_WARN_GB";
pub const ENV_WARNINGS: &str = "PROVESID_CACHE_WARNINGS";
pub const ENV_CONFIG_FILE: &str = "PROVESID_CACHE_CONFIG";

const DEFAULT_DIR_NAME: &str = "provesid_cache";
const DEFAULT_COMPACTION_RATIO: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Root directory; one subdirectory per namespace.
    pub cache_dir: PathBuf,
    pub warning_threshold_bytes: u64,
    pub warnings_enabled: bool,
    /// Index logs are compacted once they hold this many records per live entry.
    pub compaction_ratio: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join(DEFAULT_DIR_NAME),
            warning_threshold_bytes: DEFAULT_WARNING_THRESHOLD_BYTES,
            warnings_enabled: true,
            compaction_ratio: DEFAULT_COMPACTION_RATIO,
        }
    }
}

/// On-disk shape of a YAML config file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    cache_dir: Option<PathBuf>,
    warning_threshold_gb: Option<f64>,
    warnings_enabled: Option<bool>,
    compaction_ratio: Option<usize>,
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cache_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_warning_threshold_bytes(mut self, bytes: u64) -> Self {
        self.warning_threshold_bytes = bytes;
        self
    }

    pub fn with_warning_threshold_gb(mut self, gb: f64) -> Self {
        self.warning_threshold_bytes = gb_to_bytes(gb);
        self
    }

    pub fn with_warnings_enabled(mut self, enabled: bool) -> Self {
        self.warnings_enabled = enabled;
        self
    }

    pub fn with_compaction_ratio(mut self, ratio: usize) -> Self {
        self.compaction_ratio = ratio;
        self
    }

    pub fn warning_threshold_gb(&self) -> f64 {
        bytes_to_gb(self.warning_threshold_bytes)
    }

    /// Defaults, overlaid with `PROVESID_CACHE_CONFIG` (if set) and then the environment.
    pub fn from_env() -> Result<Self> {
        let base = match std::env::var(ENV_CONFIG_FILE) {
            Ok(path) if !path.is_empty() => Self::from_yaml_file(path)?,
            _ => Self::default(),
        };
        base.apply_env(|k| std::env::var(k).ok())
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("cannot read cache config: {}", e),
                ErrorContext::new()
                    .with_field_path(path.display().to_string())
                    .with_source("config"),
            )
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: FileConfig = if text.trim().is_empty() {
            FileConfig::default()
        } else {
            serde_yaml::from_str(text).map_err(|e| {
                Error::configuration_with_context(
                    format!("invalid cache config: {}", e),
                    ErrorContext::new().with_source("config"),
                )
            })?
        };
        let mut cfg = Self::default();
        if let Some(dir) = file.cache_dir {
            cfg.cache_dir = dir;
        }
        if let Some(gb) = file.warning_threshold_gb {
            cfg.warning_threshold_bytes = parse_threshold_gb(gb, "warning_threshold_gb")?;
        }
        if let Some(enabled) = file.warnings_enabled {
            cfg.warnings_enabled = enabled;
        }
        if let Some(ratio) = file.compaction_ratio {
            cfg.compaction_ratio = ratio;
        }
        Ok(cfg)
    }

    fn apply_env(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(dir) = var(ENV_CACHE_DIR).filter(|s| !s.is_empty()) {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(raw) = var(ENV_WARN_GB) {
            let gb: f64 = raw.trim().parse().map_err(|_| {
                Error::configuration_with_context(
                    format!("expected a number of gigabytes, got '{}'", raw),
                    ErrorContext::new()
                        .with_field_path(ENV_WARN_GB)
                        .with_source("config"),
                )
            })?;
            self.warning_threshold_bytes = parse_threshold_gb(gb, ENV_WARN_GB)?;
        }
        if let Some(raw) = var(ENV_WARNINGS) {
            self.warnings_enabled = parse_bool(&raw).ok_or_else(|| {
                Error::configuration_with_context(
                    format!("expected true/false, got '{}'", raw),
                    ErrorContext::new()
                        .with_field_path(ENV_WARNINGS)
                        .with_source("config"),
                )
            })?;
        }
        Ok(self)
    }
}

fn parse_threshold_gb(gb: f64, field: &str) -> Result<u64> {
    if gb.is_finite() && gb > 0.0 {
        Ok(gb_to_bytes(gb))
    } else {
        Err(Error::configuration_with_context(
            "warning threshold must be a positive number of gigabytes",
            ErrorContext::new()
                .with_field_path(field)
                .with_details(format!("got {}", gb))
                .with_source("config"),
        ))
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
