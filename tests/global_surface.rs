//! Process-wide cache and its management functions.
//!
//! The global manager can be initialised once per process, so everything
//! lives in a single test.

use provesid_cache::cache::service::{ServiceCache, PUBCHEM};
use provesid_cache::{
    all_namespace_info, clear_cache, enable_cache_warnings, export_cache, get_cache_info,
    get_cache_size, import_cache, init_global, namespace_info, set_cache_warning_threshold,
    ArchiveFormat, CacheConfig, CacheManager, Error,
};
use serde_json::{json, Value};
use std::sync::Arc;

#[tokio::test]
async fn test_global_manager_lifecycle() {
    let root = tempfile::tempdir().unwrap();
    let manager = init_global(CacheConfig::default().with_cache_dir(root.path().join("cache"))).unwrap();
    assert!(Arc::ptr_eq(&manager, &CacheManager::global().unwrap()));
    assert!(matches!(
        init_global(CacheConfig::default()),
        Err(Error::AlreadyInitialized)
    ));

    let pubchem = ServiceCache::for_service(PUBCHEM).unwrap();
    let compound: Value = pubchem
        .get_or_compute("get_compound_by_cid", &(2244,), || async {
            Ok::<_, std::io::Error>(json!({"CID": 2244, "MolecularFormula": "C9H8O4"}))
        })
        .await
        .unwrap();
    assert_eq!(compound["CID"], 2244);

    let info = get_cache_info().unwrap();
    assert!(info.disk_entries >= 1);
    assert!(info.cache_directory.ends_with("cache"));
    assert!((info.warning_threshold_gb - 5.0).abs() < 1e-9);
    assert_eq!(namespace_info("pubchem").unwrap().disk_entries, 1);
    assert!(all_namespace_info().unwrap().contains_key("pubchem"));
    let size = get_cache_size().unwrap();
    assert_eq!(size.files, 1);
    assert!(size.bytes > 0);

    set_cache_warning_threshold(0.25).unwrap();
    assert!(set_cache_warning_threshold(-1.0).is_err());
    enable_cache_warnings(false).unwrap();
    let info = get_cache_info().unwrap();
    assert!((info.warning_threshold_gb - 0.25).abs() < 1e-9);
    assert!(!info.warnings_enabled);

    let archive = root.path().join("backup.json");
    assert_eq!(export_cache(&archive, ArchiveFormat::Text).unwrap().entries, 1);
    assert_eq!(clear_cache().unwrap(), 1);
    assert_eq!(get_cache_size().unwrap().files, 0);

    let report = import_cache(&archive, true).unwrap();
    assert!(report.success());
    assert_eq!(report.applied, 1);
    let again: Value = pubchem
        .get_or_compute("get_compound_by_cid", &(2244,), || async {
            Err::<Value, _>(std::io::Error::other("network disabled"))
        })
        .await
        .unwrap();
    assert_eq!(again, compound);
}
