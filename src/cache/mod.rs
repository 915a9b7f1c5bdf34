//! 混合缓存核心：内存层 + 磁盘层，按命名空间划分，并发请求合并为单次计算。
//!
//! # Cache core
//!
//! Every API client memoizes its network calls through this module. A call
//! is identified by `(namespace, call_signature, args)`; the first request
//! computes the value, later ones are served from memory or disk.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CacheManager`] | get-or-compute, clear, stat, warnings, verify; one per cache root |
//! | [`ServiceCache`] | a client's namespace-bound handle with a default [`CachePolicy`] |
//! | [`CachedFn`] | compute function wrapped behind the cache |
//! | [`KeyDeriver`] | canonical SHA-256 keys from call inputs |
//! | [`MemoryTier`] | unbounded in-process map, dropped only on explicit clear |
//! | [`DiskStore`] | one file per entry plus a replayable index log |
//! | [`SizeMonitor`] | threshold warning, once per crossing |
//!
//! ## Example
//!
//! ```rust,no_run
//! use provesid_cache::{CacheConfig, CacheManager};
//!
//! # async fn demo() -> provesid_cache::Result<()> {
//! let cache = CacheManager::new(CacheConfig::default().with_cache_dir("/tmp/pv"))?;
//! let compound: serde_json::Value = cache
//!     .get_or_compute("pubchem", "get_compound_by_cid", &(2244,), || async {
//!         Ok::<_, std::io::Error>(serde_json::json!({"CID": 2244, "MolecularFormula": "C9H8O4"}))
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency
//!
//! Concurrent requests for the same missing key share one computation that
//! runs in its own task; a caller that stops waiting does not cancel it.
//! Compute errors reach every waiter and are never stored.

mod disk;
mod flight;
mod index;
mod key;
mod manager;
mod memory;
pub mod monitor;
mod namespace;
mod payload;
pub mod service;

pub use disk::{DiskStore, VerifyReport, WriteMode};
pub(crate) use disk::validate_namespace;
pub use flight::{Flight, FlightGuard, SingleFlight};
pub use index::{EntryMeta, NamespaceIndex};
pub use key::{CacheKey, KeyDeriver};
pub use manager::{CacheInfo, CacheManager, NamespaceInfo, Scope, SizeInfo};
pub use memory::MemoryTier;
pub use monitor::{InMemoryWarningSink, SizeMonitor, SizeReport, SizeWarning, TracingWarningSink, WarningSink};
pub use namespace::{CachePolicy, HitSource, Lookup, NamespaceCache, Persistence};
pub use payload::{Payload, PayloadFormat};
pub use service::{CachedFn, ServiceCache};
