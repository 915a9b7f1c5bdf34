//! Per-namespace cache: memory tier, disk store and in-flight table.

use super::disk::DiskStore;
use super::flight::{Flight, FlightGuard, SingleFlight};
use super::key::CacheKey;
use super::memory::MemoryTier;
use super::monitor::SizeReport;
use super::payload::Payload;
use crate::{Error, ErrorContext, Result};
use futures::future::{BoxFuture, FutureExt};
use std::path::Path;
use std::sync::Arc;

/// How a single lookup uses the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CachePolicy {
    /// Read both tiers, compute and store on miss.
    #[default]
    ReadWrite,
    /// Skip the lookup, always compute, overwrite the stored entry.
    Refresh,
    /// Compute without touching the cache.
    Bypass,
}

impl CachePolicy {
    /// `use_cache = false` still stores fresh results, it only skips reading.
    pub fn from_use_cache(use_cache: bool) -> Self {
        if use_cache {
            CachePolicy::ReadWrite
        } else {
            CachePolicy::Refresh
        }
    }
}

/// Where a returned value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitSource {
    Memory,
    Disk,
    /// This caller ran the compute function.
    Computed,
    /// Another caller's in-flight computation produced the value.
    Shared,
}

/// What happened to the value's persistent copy.
#[derive(Debug, Clone)]
pub enum Persistence {
    /// Written to memory and disk.
    Stored,
    /// Served from an existing entry; nothing written.
    AlreadyCached,
    /// Bypass policy; nothing written.
    Skipped,
    /// The value is correct but could not be persisted to disk.
    Degraded(Arc<Error>),
}

/// A value plus how the cache produced it.
#[derive(Debug, Clone)]
pub struct Lookup<T> {
    pub value: T,
    pub source: HitSource,
    pub persistence: Persistence,
    /// The stored entry could not be read, so the value was recomputed.
    pub read_error: Option<Arc<Error>>,
}

impl<T> Lookup<T> {
    pub fn is_hit(&self) -> bool {
        matches!(self.source, HitSource::Memory | HitSource::Disk)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.persistence, Persistence::Degraded(_)) || self.read_error.is_some()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        Lookup {
            value: f(self.value),
            source: self.source,
            persistence: self.persistence,
            read_error: self.read_error,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Computed {
    pub payload: Payload,
    pub persistence: Persistence,
    /// The leader found the value in memory before computing.
    pub reused: bool,
}

pub(crate) type FlightOutcome = std::result::Result<Computed, Arc<Error>>;

/// Cache state owned by one namespace.
///
/// Refresh computations get their own flight table: a caller that skipped the
/// lookup never joins a flight that may answer from memory.
pub struct NamespaceCache {
    namespace: String,
    memory: MemoryTier,
    disk: DiskStore,
    flights: Arc<SingleFlight<FlightOutcome>>,
    refresh_flights: Arc<SingleFlight<FlightOutcome>>,
}

impl NamespaceCache {
    pub(crate) fn open(root: &Path, namespace: &str, compaction_ratio: usize) -> Result<Self> {
        Ok(Self {
            namespace: namespace.to_string(),
            memory: MemoryTier::new(),
            disk: DiskStore::open(root, namespace, compaction_ratio)?,
            flights: Arc::new(SingleFlight::new()),
            refresh_flights: Arc::new(SingleFlight::new()),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    pub fn disk(&self) -> &DiskStore {
        &self.disk
    }

    pub fn in_flight(&self) -> usize {
        self.flights.in_flight() + self.refresh_flights.in_flight()
    }

    pub fn report(&self) -> SizeReport {
        let (entry_count, total_bytes) = self.disk.totals();
        SizeReport {
            entry_count,
            total_bytes,
        }
    }

    /// Drop both tiers. Returns the number of entry files removed.
    pub fn clear(&self) -> Result<usize> {
        self.memory.clear();
        self.disk.clear()
    }

    pub fn invalidate(&self, key: &CacheKey) -> Result<bool> {
        let in_memory = self.memory.delete(key);
        Ok(self.disk.delete(key)? || in_memory)
    }

    /// Memory first, then disk. A disk hit refreshes the memory tier.
    pub(crate) async fn read(self: &Arc<Self>, key: CacheKey) -> Result<Option<(Payload, HitSource)>> {
        if let Some(payload) = self.memory.get(&key) {
            return Ok(Some((payload, HitSource::Memory)));
        }
        let this = Arc::clone(self);
        let found = tokio::task::spawn_blocking(move || this.disk.get(&key))
            .await
            .map_err(join_error)??;
        Ok(found.map(|(payload, _)| {
            self.memory.put(key, payload.clone());
            (payload, HitSource::Disk)
        }))
    }

    /// Store in both tiers. Disk failures degrade persistence but never lose the value.
    pub(crate) async fn persist(
        self: &Arc<Self>,
        key: CacheKey,
        payload: &Payload,
        source: Option<String>,
    ) -> Persistence {
        self.memory.put(key, payload.clone());
        let this = Arc::clone(self);
        let owned = payload.clone();
        let written =
            tokio::task::spawn_blocking(move || this.disk.put(key, &owned, source.as_deref()))
                .await
                .map_err(join_error)
                .and_then(|r| r);
        match written {
            Ok(_) => Persistence::Stored,
            Err(e) => {
                tracing::warn!(
                    namespace = %self.namespace,
                    key = %key,
                    error = %e,
                    "cache write failed, value returned without persistence"
                );
                Persistence::Degraded(Arc::new(e))
            }
        }
    }

    /// Join the computation for `key` or start it in a spawned task.
    ///
    /// With `recheck`, the leader first looks in memory again so a flight that
    /// finished between this caller's miss and its join is not repeated.
    /// Without it, only other non-rechecking callers are joined.
    pub(crate) fn start_flight(
        self: &Arc<Self>,
        key: CacheKey,
        source: Option<String>,
        recheck: bool,
        compute: BoxFuture<'static, Result<Payload>>,
    ) -> (Flight<FlightOutcome>, bool) {
        let table = if recheck {
            &self.flights
        } else {
            &self.refresh_flights
        };
        table.join_or_start(key, || {
            let this = Arc::clone(self);
            let table = Arc::clone(table);
            let handle = tokio::spawn(async move {
                let _guard = FlightGuard::new(table, key);
                if recheck {
                    if let Some(payload) = this.memory.get(&key) {
                        return Ok(Computed {
                            payload,
                            persistence: Persistence::AlreadyCached,
                            reused: true,
                        });
                    }
                }
                let payload = match compute.await {
                    Ok(payload) => payload,
                    Err(e) => return Err(Arc::new(e)),
                };
                let persistence = this.persist(key, &payload, source).await;
                Ok(Computed {
                    payload,
                    persistence,
                    reused: false,
                })
            });
            async move {
                handle
                    .await
                    .unwrap_or_else(|e| Err(Arc::new(join_error(e))))
            }
            .boxed()
        })
    }
}

fn join_error(e: tokio::task::JoinError) -> Error {
    let what = if e.is_panic() { "panicked" } else { "was cancelled" };
    Error::runtime_with_context(
        format!("cache task {}", what),
        ErrorContext::new().with_source("namespace_cache"),
    )
}

/// Convert a flight error back into an owned error for one waiter.
///
/// Compute errors keep their original (shared) source so callers can downcast.
pub(crate) fn unshare(err: &Arc<Error>) -> Error {
    match err.as_ref() {
        Error::Compute(inner) => Error::Compute(inner.clone()),
        Error::KeyDerivation { message } => Error::key_derivation(message.clone()),
        other => Error::runtime_with_context(
            other.to_string(),
            ErrorContext::new().with_source("singleflight"),
        ),
    }
}
