//! # provesid-cache
//!
//! 化学数据库客户端共享的持久化缓存：内存 + 磁盘两级、命名空间隔离、并发去重。
//!
//! Persistent compute-if-absent cache shared by the PROVESID chemical
//! database clients (PubChem, CAS Common Chemistry, NCI resolver, PubChem
//! View, ClassyFire, OPSIN).
//!
//! ## Overview
//!
//! Each client owns a namespace and routes its rate-limited, idempotent
//! network calls through [`CacheManager::get_or_compute`]. Results are kept
//! in memory for the life of the process and on disk under a fixed root so
//! they survive restarts and can be exported to another machine.
//!
//! ## Key Features
//!
//! - **Two tiers**: in-memory map in front of an atomic, file-per-entry disk store
//! - **Singleflight**: concurrent identical requests run the compute function once
//! - **Errors are not cached**: a failed request is retried by the next caller
//! - **Size warnings**: one warning per crossing of a configurable threshold
//! - **Portable archives**: binary or JSON export, merge or replace on import
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use provesid_cache::cache::service::PUBCHEM;
//! use provesid_cache::ServiceCache;
//!
//! #[tokio::main]
//! async fn main() -> provesid_cache::Result<()> {
//!     let cache = ServiceCache::for_service(PUBCHEM)?;
//!     let formula: String = cache
//!         .get_or_compute("get_formula", &(2244,), || async {
//!             Ok::<_, std::io::Error>("C9H8O4".to_string())
//!         })
//!         .await?;
//!     println!("{}", formula);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cache`] | key derivation, memory and disk tiers, manager, service handles |
//! | [`archive`] | export and import of portable archives |
//! | [`config`] | [`CacheConfig`] from defaults, YAML and environment |
//! | [`global`] | process-wide default manager and management functions |
//! | [`logging`] | tracing subscriber setup |

pub mod archive;
pub mod cache;
pub mod config;
pub mod error;
pub mod global;
pub mod logging;

pub use archive::{ArchiveFormat, ExportReport, ImportMode, ImportReport};
pub use cache::{
    CacheInfo, CacheKey, CacheManager, CachePolicy, CachedFn, HitSource, Lookup, NamespaceInfo,
    Payload, PayloadFormat, Persistence, Scope, ServiceCache, SizeInfo,
};
pub use config::CacheConfig;
pub use error::{Error, ErrorContext};
pub use global::{
    all_namespace_info, clear_cache, enable_cache_warnings, export_cache, export_namespace,
    get_cache_info, get_cache_size, import_cache, import_namespace, init_global, namespace_info,
    set_cache_warning_threshold,
};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
