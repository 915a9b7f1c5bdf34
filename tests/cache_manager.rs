//! End-to-end behaviour of the two-tier cache through the public API.

use provesid_cache::cache::{InMemoryWarningSink, WarningSink};
use provesid_cache::{CacheConfig, CacheManager, CachePolicy, HitSource, Lookup, Persistence, Scope};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
enum ClientError {
    #[error("HTTP 503 from {0}")]
    Unavailable(&'static str),
}

fn open(dir: &std::path::Path) -> CacheManager {
    CacheManager::new(CacheConfig::default().with_cache_dir(dir)).unwrap()
}

#[tokio::test]
async fn test_aspirin_lookup_is_computed_once() {
    let root = tempfile::tempdir().unwrap();
    let cache = open(root.path());
    let calls = Arc::new(AtomicUsize::new(0));

    let mut results = Vec::new();
    for _ in 0..2 {
        let calls = calls.clone();
        let compound: Value = cache
            .get_or_compute("pubchem", "get_compound_by_cid", &[2244], move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ClientError>(json!({"CID": 2244, "MolecularFormula": "C9H8O4"}))
            })
            .await
            .unwrap();
        results.push(compound);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(results[0], results[1]);
    assert_eq!(results[0]["MolecularFormula"], "C9H8O4");
    let info = cache.info().unwrap();
    assert!(info.disk_entries >= 1);
    assert_eq!(info.namespaces["pubchem"].disk_entries, 1);
}

#[tokio::test]
async fn test_values_survive_restart() {
    let root = tempfile::tempdir().unwrap();
    {
        let cache = open(root.path());
        let _: String = cache
            .get_or_compute("cas", "detail", &("50-78-2",), || async {
                Ok::<_, ClientError>("Aspirin".to_string())
            })
            .await
            .unwrap();
    }

    let cache = open(root.path());
    let lookup: Lookup<String> = cache
        .fetch("cas", "detail", &("50-78-2",), CachePolicy::ReadWrite, || async {
            Err::<String, _>(ClientError::Unavailable("commonchemistry.cas.org"))
        })
        .await
        .unwrap();
    assert_eq!(lookup.value, "Aspirin");
    assert_eq!(lookup.source, HitSource::Disk);
    assert!(matches!(lookup.persistence, Persistence::AlreadyCached));
}

#[tokio::test]
async fn test_failures_propagate_unchanged_and_are_retried() {
    let root = tempfile::tempdir().unwrap();
    let cache = open(root.path());

    let err = cache
        .get_or_compute("pubchemview", "get_property", &(2244, "Boiling Point"), || async {
            Err::<Value, _>(ClientError::Unavailable("pubchem.ncbi.nlm.nih.gov"))
        })
        .await
        .unwrap_err();
    let source = err.compute_source::<ClientError>().unwrap();
    assert_eq!(source.to_string(), "HTTP 503 from pubchem.ncbi.nlm.nih.gov");
    assert_eq!(cache.size_info(&Scope::All).unwrap().files, 0);

    let value: Value = cache
        .get_or_compute("pubchemview", "get_property", &(2244, "Boiling Point"), || async {
            Ok::<_, ClientError>(json!("140 °C"))
        })
        .await
        .unwrap();
    assert_eq!(value, "140 °C");
}

#[tokio::test]
async fn test_argument_order_and_option_maps() {
    let root = tempfile::tempdir().unwrap();
    let cache = open(root.path());
    let calls = Arc::new(AtomicUsize::new(0));

    let options = [
        json!({"format": "json", "timeout": 30}),
        json!({"timeout": 30, "format": "json"}),
    ];
    for opts in &options {
        let calls = calls.clone();
        let _: u32 = cache
            .get_or_compute("nci", "resolve", &("aspirin", opts), move || async move {
                Ok::<_, ClientError>(calls.fetch_add(1, Ordering::SeqCst) as u32)
            })
            .await
            .unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1, "map key order must not matter");

    let calls2 = calls.clone();
    let _: u32 = cache
        .get_or_compute("nci", "resolve", &(options[0].clone(), "aspirin"), move || async move {
            Ok::<_, ClientError>(calls2.fetch_add(1, Ordering::SeqCst) as u32)
        })
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2, "argument order must matter");
}

#[tokio::test]
async fn test_warning_fires_once_per_crossing() {
    let root = tempfile::tempdir().unwrap();
    let sink = Arc::new(InMemoryWarningSink::new());
    let cache = CacheManager::new(
        CacheConfig::default()
            .with_cache_dir(root.path())
            .with_warning_threshold_bytes(1_000),
    )
    .unwrap()
    .with_warning_sink(sink.clone() as Arc<dyn WarningSink>);

    let blob = "C".repeat(300);
    for i in 0..8u32 {
        let blob = blob.clone();
        let _: String = cache
            .get_or_compute("opsin", "name_to_smiles", &(i,), move || async move {
                Ok::<_, ClientError>(blob)
            })
            .await
            .unwrap();
    }
    assert_eq!(sink.len(), 1);
    assert!(sink.events()[0].total_bytes > 1_000);

    // Re-enabling re-arms the warning even though the total never dropped.
    cache.enable_warnings(false);
    cache.enable_warnings(true);
    assert!(cache.check_threshold().unwrap().is_some());
    assert!(cache.check_threshold().unwrap().is_none());
    assert_eq!(sink.len(), 2);

    // Raising the threshold above the total silences it.
    cache.set_warning_threshold(1_000_000);
    assert!(cache.check_threshold().unwrap().is_none());
    assert_eq!(sink.len(), 2);
}

#[tokio::test]
async fn test_disabled_warnings_stay_silent() {
    let root = tempfile::tempdir().unwrap();
    let sink = Arc::new(InMemoryWarningSink::new());
    let cache = CacheManager::new(
        CacheConfig::default()
            .with_cache_dir(root.path())
            .with_warning_threshold_bytes(10)
            .with_warnings_enabled(false),
    )
    .unwrap()
    .with_warning_sink(sink.clone() as Arc<dyn WarningSink>);

    let _: String = cache
        .get_or_compute("global", "anything", &(), || async {
            Ok::<_, ClientError>("x".repeat(64))
        })
        .await
        .unwrap();
    assert!(sink.is_empty());
    assert!(!cache.info().unwrap().warnings_enabled);
}

#[tokio::test]
async fn test_verify_repairs_a_deleted_index() {
    let root = tempfile::tempdir().unwrap();
    {
        let cache = open(root.path());
        for cid in [2244u32, 2519, 702] {
            let _: u32 = cache
                .get_or_compute("pubchem", "cid", &(cid,), move || async move { Ok::<_, ClientError>(cid) })
                .await
                .unwrap();
        }
    }
    std::fs::remove_file(root.path().join("pubchem").join("index.log")).unwrap();

    let cache = open(root.path());
    assert_eq!(cache.size_info(&Scope::namespace("pubchem")).unwrap().files, 3);
    let reports = cache.verify(&Scope::All).unwrap();
    assert!(reports["pubchem"].is_clean());
    assert_eq!(reports["pubchem"].entries, 3);
}

#[tokio::test]
async fn test_info_sees_entries_written_by_another_manager() {
    let root = tempfile::tempdir().unwrap();
    let writer = open(root.path());
    let reader = open(root.path());
    assert_eq!(reader.info().unwrap().disk_entries, 0);

    writer
        .get_or_compute("pubchem", "get_compound_by_cid", &[2244], || async {
            Ok::<_, ClientError>(json!({"CID": 2244}))
        })
        .await
        .unwrap();
    writer
        .get_or_compute("cas", "detail", &["50-78-2"], || async { Ok::<_, ClientError>(json!("aspirin")) })
        .await
        .unwrap();

    let info = reader.info().unwrap();
    assert_eq!(info.disk_entries, 2);
    assert!(info.namespaces.contains_key("cas"));

    writer
        .get_or_compute("pubchem", "get_compound_by_cid", &[702], || async {
            Ok::<_, ClientError>(json!({"CID": 702}))
        })
        .await
        .unwrap();
    assert_eq!(reader.size_info(&Scope::namespace("pubchem")).unwrap().files, 2);
    assert_eq!(reader.namespace_info("pubchem").unwrap().disk_entries, 2);
}
