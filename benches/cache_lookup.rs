//! Benchmarks for cache lookups
//!
//! This benchmark measures:
//! - Key derivation for small and nested argument lists
//! - Warm memory hits through `get_or_compute`
//! - Cold disk hits after a restart

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use provesid_cache::cache::KeyDeriver;
use provesid_cache::{CacheManager, CachePolicy};
use serde_json::{json, Value};

fn bench_key_derivation(c: &mut Criterion) {
    let deriver = KeyDeriver::new();
    let mut group = c.benchmark_group("key_derivation");

    group.bench_function("single_cid", |b| {
        b.iter(|| deriver.derive("pubchem", "get_compound_by_cid", black_box(&(2244,))))
    });

    for props in [4usize, 32, 256] {
        let names: Vec<String> = (0..props).map(|i| format!("Property{}", i)).collect();
        let args = json!({"cids": [2244, 2519, 702], "properties": names, "options": {"b": 1, "a": 2}});
        group.throughput(Throughput::Elements(props as u64));
        group.bench_with_input(BenchmarkId::new("properties", props), &args, |b, args| {
            b.iter(|| deriver.derive_value("pubchem", "get_properties", black_box(args)))
        });
    }
    group.finish();
}

fn bench_lookups(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let compound = json!({"CID": 2244, "MolecularFormula": "C9H8O4", "MolecularWeight": "180.16"});

    let warm = CacheManager::at(dir.path()).unwrap();
    runtime.block_on(async {
        for cid in 0..1_000u32 {
            let value = compound.clone();
            let _: Value = warm
                .get_or_compute("pubchem", "get_compound_by_cid", &(cid,), move || async move {
                    Ok::<_, std::io::Error>(value)
                })
                .await
                .unwrap();
        }
    });

    let mut group = c.benchmark_group("lookup");
    group.bench_function("memory_hit", |b| {
        b.to_async(&runtime).iter(|| async {
            let v: Value = warm
                .get_or_compute("pubchem", "get_compound_by_cid", &(black_box(500u32),), || async {
                    Ok::<_, std::io::Error>(Value::Null)
                })
                .await
                .unwrap();
            v
        })
    });

    group.bench_function("disk_hit", |b| {
        b.to_async(&runtime).iter(|| async {
            // A fresh manager has an empty memory tier, so every call reads the entry file.
            let cold = CacheManager::at(dir.path()).unwrap();
            let lookup = cold
                .fetch::<_, Value, _, _, _>(
                    "pubchem",
                    "get_compound_by_cid",
                    &(black_box(500u32),),
                    CachePolicy::ReadWrite,
                    || async { Ok::<_, std::io::Error>(Value::Null) },
                )
                .await
                .unwrap();
            lookup.value
        })
    });
    group.finish();
}

criterion_group!(benches, bench_key_derivation, bench_lookups);
criterion_main!(benches);
