//! Cache manager.

use super::disk::{validate_namespace, VerifyReport};
use super::key::{CacheKey, KeyDeriver};
use super::monitor::{bytes_to_gb, bytes_to_mb, SizeMonitor, SizeReport, SizeWarning, WarningSink};
use super::namespace::{unshare, CachePolicy, HitSource, Lookup, NamespaceCache, Persistence};
use super::payload::Payload;
use crate::config::CacheConfig;
use crate::{Error, Result};
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Which namespaces an operation covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    All,
    Namespace(String),
}

impl Scope {
    pub fn namespace(ns: impl Into<String>) -> Self {
        Scope::Namespace(ns.into())
    }

    pub fn as_namespace(&self) -> Option<&str> {
        match self {
            Scope::All => None,
            Scope::Namespace(ns) => Some(ns),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::All => f.write_str("all"),
            Scope::Namespace(ns) => f.write_str(ns),
        }
    }
}

/// Snapshot of the whole cache, as reported by [`CacheManager::info`].
#[derive(Debug, Clone, Serialize)]
pub struct CacheInfo {
    pub cache_directory: String,
    pub memory_entries: usize,
    pub disk_entries: usize,
    pub total_size_bytes: u64,
    pub total_size_mb: f64,
    pub total_size_gb: f64,
    pub file_count: usize,
    pub warning_threshold_gb: f64,
    pub warnings_enabled: bool,
    pub namespaces: BTreeMap<String, NamespaceInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NamespaceInfo {
    pub cache_directory: String,
    pub memory_entries: usize,
    pub disk_entries: usize,
    pub total_size_bytes: u64,
    pub total_size_mb: f64,
    pub in_flight: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SizeInfo {
    pub bytes: u64,
    pub mb: f64,
    pub gb: f64,
    pub files: usize,
}

impl From<SizeReport> for SizeInfo {
    fn from(r: SizeReport) -> Self {
        Self {
            bytes: r.total_bytes,
            mb: bytes_to_mb(r.total_bytes),
            gb: bytes_to_gb(r.total_bytes),
            files: r.entry_count,
        }
    }
}

/// Orchestrates memory and disk tiers for every namespace under one cache root.
///
/// Namespaces are opened lazily on first use. Hold it in an `Arc` and share
/// it between clients; [`CacheManager::global`](crate::global) provides the
/// process-wide default.
pub struct CacheManager {
    config: CacheConfig,
    deriver: KeyDeriver,
    monitor: SizeMonitor,
    namespaces: RwLock<HashMap<String, Arc<NamespaceCache>>>,
    discovered: AtomicBool,
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> Result<Self> {
        fs::create_dir_all(&config.cache_dir).map_err(|e| Error::disk_write(&config.cache_dir, e))?;
        let monitor = SizeMonitor::new(config.warning_threshold_bytes, config.warnings_enabled);
        Ok(Self {
            config,
            deriver: KeyDeriver::new(),
            monitor,
            namespaces: RwLock::new(HashMap::new()),
            discovered: AtomicBool::new(false),
        })
    }

    /// Cache rooted at `dir` with default settings.
    pub fn at(dir: impl AsRef<Path>) -> Result<Self> {
        Self::new(CacheConfig::default().with_cache_dir(dir))
    }

    pub fn with_key_deriver(mut self, deriver: KeyDeriver) -> Self {
        self.deriver = deriver;
        self
    }

    pub fn with_warning_sink(self, sink: Arc<dyn WarningSink>) -> Self {
        self.monitor.set_sink(sink);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn cache_dir(&self) -> &Path {
        &self.config.cache_dir
    }

    pub fn key_deriver(&self) -> &KeyDeriver {
        &self.deriver
    }

    pub fn monitor(&self) -> &SizeMonitor {
        &self.monitor
    }

    pub fn derive_key<A>(&self, namespace: &str, call_signature: &str, args: &A) -> Result<CacheKey>
    where
        A: Serialize + ?Sized,
    {
        self.deriver.derive(namespace, call_signature, args)
    }

    /// The cache for `namespace`, opening it on first use.
    pub fn namespace(&self, namespace: &str) -> Result<Arc<NamespaceCache>> {
        {
            let open = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(ns) = open.get(namespace) {
                return Ok(ns.clone());
            }
        }
        validate_namespace(namespace)?;
        let mut open = self.namespaces.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(ns) = open.get(namespace) {
            return Ok(ns.clone());
        }
        let ns = Arc::new(NamespaceCache::open(
            &self.config.cache_dir,
            namespace,
            self.config.compaction_ratio,
        )?);
        tracing::debug!(namespace, dir = %ns.disk().dir().display(), "opened cache namespace");
        open.insert(namespace.to_string(), ns.clone());
        Ok(ns)
    }

    /// Every namespace, including ones on disk that this process has not used yet.
    pub fn namespaces(&self) -> Result<Vec<Arc<NamespaceCache>>> {
        if !self.discovered.load(Ordering::Acquire) {
            self.discover()?;
        }
        let open = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = open.values().cloned().collect();
        all.sort_by(|a, b| a.namespace().cmp(b.namespace()));
        Ok(all)
    }

    pub fn namespace_names(&self) -> Result<Vec<String>> {
        Ok(self
            .namespaces()?
            .iter()
            .map(|ns| ns.namespace().to_string())
            .collect())
    }

    fn discover(&self) -> Result<()> {
        let root = &self.config.cache_dir;
        let read_dir = match fs::read_dir(root) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.discovered.store(true, Ordering::Release);
                return Ok(());
            }
            Err(e) => return Err(Error::disk_read(root, e)),
        };
        for dirent in read_dir {
            let dirent = dirent.map_err(|e| Error::disk_read(root, e))?;
            if !dirent.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = dirent.file_name().to_string_lossy().into_owned();
            if validate_namespace(&name).is_ok() {
                self.namespace(&name)?;
            }
        }
        self.discovered.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn scoped(&self, scope: &Scope) -> Result<Vec<Arc<NamespaceCache>>> {
        match scope {
            Scope::All => self.namespaces(),
            Scope::Namespace(ns) => Ok(vec![self.namespace(ns)?]),
        }
    }

    /// Return the cached value for the call, computing and storing it on a miss.
    ///
    /// Concurrent callers for the same key share one execution of `compute`.
    /// Errors from `compute` are returned to every waiter and never cached.
    pub async fn get_or_compute<A, T, F, Fut, E>(
        &self,
        namespace: &str,
        call_signature: &str,
        args: &A,
        compute: F,
    ) -> Result<T>
    where
        A: Serialize + ?Sized,
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>> + 'static,
    {
        self.fetch(namespace, call_signature, args, CachePolicy::ReadWrite, compute)
            .await
            .map(|lookup| lookup.value)
    }

    /// Like [`get_or_compute`](Self::get_or_compute), reporting where the value
    /// came from and whether it was persisted.
    pub async fn fetch<A, T, F, Fut, E>(
        &self,
        namespace: &str,
        call_signature: &str,
        args: &A,
        policy: CachePolicy,
        compute: F,
    ) -> Result<Lookup<T>>
    where
        A: Serialize + ?Sized,
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>> + 'static,
    {
        let key = self.derive_key(namespace, call_signature, args)?;
        let compute = async move {
            let value = compute().await.map_err(Error::compute)?;
            Payload::json(&value)
        }
        .boxed();
        let lookup = self
            .fetch_payload(namespace, call_signature, key, policy, compute)
            .await?;
        let value = lookup.value.decode::<T>()?;
        Ok(Lookup {
            value,
            source: lookup.source,
            persistence: lookup.persistence,
            read_error: lookup.read_error,
        })
    }

    /// Cache raw bytes (stored as binary payloads, exportable only in binary archives).
    pub async fn get_or_compute_bytes<A, B, F, Fut, E>(
        &self,
        namespace: &str,
        call_signature: &str,
        args: &A,
        compute: F,
    ) -> Result<Bytes>
    where
        A: Serialize + ?Sized,
        B: Into<Bytes> + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<B, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>> + 'static,
    {
        let key = self.derive_key(namespace, call_signature, args)?;
        let compute = async move {
            let bytes = compute().await.map_err(Error::compute)?;
            Ok::<_, Error>(Payload::binary(bytes))
        }
        .boxed();
        let lookup = self
            .fetch_payload(namespace, call_signature, key, CachePolicy::ReadWrite, compute)
            .await?;
        Ok(lookup.value.bytes)
    }

    /// Look up a cached value without computing.
    pub async fn get<A, T>(&self, namespace: &str, call_signature: &str, args: &A) -> Result<Option<T>>
    where
        A: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let key = self.derive_key(namespace, call_signature, args)?;
        match self.namespace(namespace)?.read(key).await? {
            Some((payload, _)) => Ok(Some(payload.decode()?)),
            None => Ok(None),
        }
    }

    /// Delete the entry for one call from both tiers.
    pub fn invalidate<A>(&self, namespace: &str, call_signature: &str, args: &A) -> Result<bool>
    where
        A: Serialize + ?Sized,
    {
        let key = self.derive_key(namespace, call_signature, args)?;
        self.namespace(namespace)?.invalidate(&key)
    }

    async fn fetch_payload(
        &self,
        namespace: &str,
        call_signature: &str,
        key: CacheKey,
        policy: CachePolicy,
        compute: BoxFuture<'static, Result<Payload>>,
    ) -> Result<Lookup<Payload>> {
        let cache = self.namespace(namespace)?;
        let mut read_error = None;

        if policy == CachePolicy::ReadWrite {
            match cache.read(key).await {
                Ok(Some((payload, source))) => {
                    tracing::debug!(namespace, call_signature, key = %key, ?source, "cache hit");
                    return Ok(Lookup {
                        value: payload,
                        source,
                        persistence: Persistence::AlreadyCached,
                        read_error: None,
                    });
                }
                Ok(None) => {
                    tracing::debug!(namespace, call_signature, key = %key, "cache miss");
                }
                Err(e) => {
                    tracing::warn!(
                        namespace,
                        call_signature,
                        key = %key,
                        error = %e,
                        "cache read failed, recomputing"
                    );
                    read_error = Some(Arc::new(e));
                }
            }
        }

        if policy == CachePolicy::Bypass {
            let payload = compute.await?;
            return Ok(Lookup {
                value: payload,
                source: HitSource::Computed,
                persistence: Persistence::Skipped,
                read_error: None,
            });
        }

        let (flight, leader) = cache.start_flight(
            key,
            Some(call_signature.to_string()),
            policy == CachePolicy::ReadWrite,
            compute,
        );
        let computed = flight.await.map_err(|e| unshare(&e))?;

        if leader && matches!(computed.persistence, Persistence::Stored) {
            if let Err(e) = self.check_threshold() {
                tracing::warn!(error = %e, "cache size check failed");
            }
        }
        let source = if computed.reused {
            HitSource::Memory
        } else if leader {
            HitSource::Computed
        } else {
            HitSource::Shared
        };
        Ok(Lookup {
            value: computed.payload,
            source,
            persistence: computed.persistence,
            read_error,
        })
    }

    /// Remove every entry in `scope`. Returns the number of entries removed.
    pub fn clear(&self, scope: &Scope) -> Result<usize> {
        let mut removed = 0;
        for ns in self.scoped(scope)? {
            removed += ns.clear()?;
        }
        tracing::info!(%scope, removed, "cleared cache");
        self.check_threshold()?;
        Ok(removed)
    }

    pub fn stat(&self, scope: &Scope) -> Result<SizeReport> {
        Ok(self
            .scoped(scope)?
            .iter()
            .fold(SizeReport::default(), |acc, ns| acc.add(ns.report())))
    }

    /// Compare the aggregate size of every namespace to the warning threshold.
    pub fn check_threshold(&self) -> Result<Option<SizeWarning>> {
        let total = self.stat(&Scope::All)?;
        Ok(self.monitor.check_threshold(total.total_bytes))
    }

    pub fn set_warning_threshold(&self, bytes: u64) {
        self.monitor.set_threshold_bytes(bytes);
    }

    pub fn set_warning_threshold_gb(&self, gb: f64) {
        self.monitor.set_threshold_bytes(super::monitor::gb_to_bytes(gb));
    }

    pub fn enable_warnings(&self, enabled: bool) {
        self.monitor.enable_warnings(enabled);
    }

    /// Rebuild each namespace index from its entry files.
    pub fn verify(&self, scope: &Scope) -> Result<BTreeMap<String, VerifyReport>> {
        let mut out = BTreeMap::new();
        for ns in self.scoped(scope)? {
            let report = ns.disk().verify()?;
            if !report.is_clean() {
                tracing::info!(namespace = ns.namespace(), ?report, "repaired cache index");
            }
            out.insert(ns.namespace().to_string(), report);
        }
        Ok(out)
    }

    /// Re-read on-disk state written by other processes: new namespace
    /// directories and each index log in `scope`.
    pub fn refresh(&self, scope: &Scope) -> Result<()> {
        if matches!(scope, Scope::All) {
            self.discover()?;
        }
        for ns in self.scoped(scope)? {
            ns.disk().reload()?;
        }
        Ok(())
    }

    pub fn namespace_info(&self, namespace: &str) -> Result<NamespaceInfo> {
        let ns = self.namespace(namespace)?;
        ns.disk().reload()?;
        Ok(describe(&ns))
    }

    pub fn info(&self) -> Result<CacheInfo> {
        self.refresh(&Scope::All)?;
        let mut namespaces = BTreeMap::new();
        let mut memory_entries = 0;
        let mut total = SizeReport::default();
        for ns in self.namespaces()? {
            memory_entries += ns.memory().len();
            total = total.add(ns.report());
            namespaces.insert(ns.namespace().to_string(), describe(&ns));
        }
        Ok(CacheInfo {
            cache_directory: self.config.cache_dir.display().to_string(),
            memory_entries,
            disk_entries: total.entry_count,
            total_size_bytes: total.total_bytes,
            total_size_mb: total.total_mb(),
            total_size_gb: total.total_gb(),
            file_count: total.entry_count,
            warning_threshold_gb: bytes_to_gb(self.monitor.threshold_bytes()),
            warnings_enabled: self.monitor.warnings_enabled(),
            namespaces,
        })
    }

    pub fn size_info(&self, scope: &Scope) -> Result<SizeInfo> {
        self.refresh(scope)?;
        Ok(self.stat(scope)?.into())
    }
}

fn describe(ns: &NamespaceCache) -> NamespaceInfo {
    let report = ns.report();
    NamespaceInfo {
        cache_directory: ns.disk().dir().display().to_string(),
        memory_entries: ns.memory().len(),
        disk_entries: report.entry_count,
        total_size_bytes: report.total_bytes,
        total_size_mb: report.total_mb(),
        in_flight: ns.in_flight(),
    }
}
