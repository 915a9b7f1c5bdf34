//! 进程级默认缓存实例与管理函数。
//!
//! Process-wide default cache.
//!
//! Clients that are not handed an explicit [`CacheManager`] share this one.
//! It is created on first use from [`CacheConfig::from_env`] unless
//! [`init_global`] ran first; after that it cannot be replaced.

use crate::archive::{ArchiveFormat, ExportReport, ImportMode, ImportReport};
use crate::cache::{CacheInfo, CacheManager, NamespaceInfo, Scope, SizeInfo};
use crate::config::CacheConfig;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

static GLOBAL_MANAGER: once_cell::sync::OnceCell<Arc<CacheManager>> = once_cell::sync::OnceCell::new();

/// Install `config` as the process-wide cache. Fails if it already exists.
pub fn init_global(config: CacheConfig) -> Result<Arc<CacheManager>> {
    let manager = Arc::new(CacheManager::new(config)?);
    GLOBAL_MANAGER
        .set(manager.clone())
        .map_err(|_| Error::AlreadyInitialized)?;
    tracing::info!(dir = %manager.cache_dir().display(), "initialized global cache");
    Ok(manager)
}

/// The process-wide cache, created from the environment on first use.
pub fn global() -> Result<Arc<CacheManager>> {
    GLOBAL_MANAGER
        .get_or_try_init(|| CacheConfig::from_env().and_then(CacheManager::new).map(Arc::new))
        .cloned()
}

impl CacheManager {
    /// See [`global`].
    pub fn global() -> Result<Arc<CacheManager>> {
        global()
    }
}

pub fn get_cache_info() -> Result<CacheInfo> {
    global()?.info()
}

pub fn get_cache_size() -> Result<SizeInfo> {
    global()?.size_info(&Scope::All)
}

pub fn export_cache(path: impl AsRef<Path>, format: ArchiveFormat) -> Result<ExportReport> {
    global()?.export(path, &Scope::All, format)
}

/// `merge = true` keeps local entries on conflict; `false` replaces every
/// namespace the archive covers and leaves the rest alone.
pub fn import_cache(path: impl AsRef<Path>, merge: bool) -> Result<ImportReport> {
    global()?.import(path, &Scope::All, ImportMode::from_merge(merge))
}

pub fn clear_cache() -> Result<usize> {
    global()?.clear(&Scope::All)
}

pub fn set_cache_warning_threshold(gb: f64) -> Result<()> {
    if !(gb.is_finite() && gb > 0.0) {
        return Err(Error::configuration_with_context(
            "warning threshold must be a positive number of gigabytes",
            crate::ErrorContext::new()
                .with_details(format!("got {}", gb))
                .with_source("global"),
        ));
    }
    global()?.set_warning_threshold_gb(gb);
    Ok(())
}

pub fn enable_cache_warnings(enabled: bool) -> Result<()> {
    global()?.enable_warnings(enabled);
    Ok(())
}

pub fn export_namespace(namespace: &str, path: impl AsRef<Path>, format: ArchiveFormat) -> Result<ExportReport> {
    global()?.export(path, &Scope::namespace(namespace), format)
}

pub fn import_namespace(namespace: &str, path: impl AsRef<Path>, merge: bool) -> Result<ImportReport> {
    global()?.import(path, &Scope::namespace(namespace), ImportMode::from_merge(merge))
}

pub fn namespace_info(namespace: &str) -> Result<NamespaceInfo> {
    global()?.namespace_info(namespace)
}

pub fn all_namespace_info() -> Result<BTreeMap<String, NamespaceInfo>> {
    Ok(global()?.info()?.namespaces)
}
