//! provesid-cache — 缓存目录的查看、导出、导入与修复工具
//!
//! Usage:
//!   provesid-cache info [namespace]                 Show cache statistics
//!   provesid-cache size                             Show total size
//!   provesid-cache export <path> [--format f] [--namespace ns]
//!   provesid-cache import <path> [--replace] [--namespace ns]
//!   provesid-cache clear [namespace]                Delete entries
//!   provesid-cache verify [namespace]               Rebuild indexes from entry files
//!   provesid-cache inspect <namespace> <hex-key>    Print one entry

use anyhow::{bail, Context};
use base64::Engine as _;
use provesid_cache::config::ENV_CACHE_DIR;
use provesid_cache::{ArchiveFormat, CacheConfig, CacheKey, CacheManager, ImportMode, PayloadFormat, Scope};
use std::path::PathBuf;

fn main() {
    provesid_cache::logging::init_tracing();
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let rest = &args[2..];
    let result = match args[1].as_str() {
        "info" => cmd_info(rest),
        "size" => cmd_size(rest),
        "export" => cmd_export(rest),
        "import" => cmd_import(rest),
        "clear" => cmd_clear(rest),
        "verify" => cmd_verify(rest),
        "inspect" => cmd_inspect(rest),
        "version" | "--version" | "-V" => {
            println!("provesid-cache {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };
    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn print_usage() {
    println!(
        r#"provesid-cache — PROVESID 缓存管理工具

USAGE:
    provesid-cache <COMMAND> [OPTIONS] [--dir <path>]

COMMANDS:
    info [namespace]                          Show cache statistics as JSON
    size                                      Show total cache size
    export <path> [--format binary|text] [--namespace ns]
                                              Write the cache to an archive
    import <path> [--replace] [--namespace ns]
                                              Merge (or replace from) an archive
    clear [namespace]                         Delete cached entries
    verify [namespace]                        Rebuild indexes from entry files
    inspect <namespace> <hex-key>             Print one entry
    version                                   Show version information
    help                                      Show this help message

ENVIRONMENT:
    PROVESID_CACHE_DIR          Cache root directory
    PROVESID_CACHE_CONFIG       YAML config file
    RUST_LOG                    Log filter (default: info)"#
    );
}

/// Split `args` into positionals and `--flag [value]` options.
struct Args {
    positional: Vec<String>,
    dir: Option<PathBuf>,
    format: Option<String>,
    namespace: Option<String>,
    replace: bool,
}

fn parse_args(args: &[String]) -> anyhow::Result<Args> {
    let mut parsed = Args {
        positional: Vec::new(),
        dir: None,
        format: None,
        namespace: None,
        replace: false,
    };
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--dir" => parsed.dir = Some(PathBuf::from(value_of(&mut iter, "--dir")?)),
            "--format" => parsed.format = Some(value_of(&mut iter, "--format")?),
            "--namespace" | "-n" => parsed.namespace = Some(value_of(&mut iter, "--namespace")?),
            "--replace" => parsed.replace = true,
            flag if flag.starts_with("--") => bail!("unknown option {flag}"),
            _ => parsed.positional.push(arg.clone()),
        }
    }
    Ok(parsed)
}

fn value_of<'a>(iter: &mut impl Iterator<Item = &'a String>, flag: &str) -> anyhow::Result<String> {
    iter.next()
        .cloned()
        .with_context(|| format!("{flag} needs a value"))
}

fn open(args: &Args) -> anyhow::Result<CacheManager> {
    let mut config = CacheConfig::from_env()?;
    if let Some(dir) = &args.dir {
        config = config.with_cache_dir(dir);
    }
    CacheManager::new(config).with_context(|| {
        format!(
            "cannot open cache (set {ENV_CACHE_DIR} or use --dir)"
        )
    })
}

fn scope_of(ns: Option<&String>) -> Scope {
    match ns {
        Some(ns) => Scope::namespace(ns.as_str()),
        None => Scope::All,
    }
}

fn cmd_info(args: &[String]) -> anyhow::Result<()> {
    let args = parse_args(args)?;
    let cache = open(&args)?;
    let json = match args.positional.first() {
        Some(ns) => serde_json::to_string_pretty(&cache.namespace_info(ns)?)?,
        None => serde_json::to_string_pretty(&cache.info()?)?,
    };
    println!("{json}");
    Ok(())
}

fn cmd_size(args: &[String]) -> anyhow::Result<()> {
    let args = parse_args(args)?;
    let cache = open(&args)?;
    let size = cache.size_info(&scope_of(args.positional.first()))?;
    println!(
        "{} files, {} bytes ({:.2} MB, {:.3} GB)",
        size.files, size.bytes, size.mb, size.gb
    );
    Ok(())
}

fn cmd_export(args: &[String]) -> anyhow::Result<()> {
    let args = parse_args(args)?;
    let Some(path) = args.positional.first() else {
        bail!("usage: provesid-cache export <path> [--format binary|text] [--namespace ns]");
    };
    let format: ArchiveFormat = match &args.format {
        Some(f) => f.parse()?,
        None => ArchiveFormat::Binary,
    };
    let cache = open(&args)?;
    let scope = scope_of(args.namespace.as_ref());
    let report = cache.export(path, &scope, format)?;
    println!(
        "Exported {} entries ({} bytes, {}) from {} to {}",
        report.entries,
        report.bytes,
        format.as_str(),
        scope,
        path
    );
    Ok(())
}

fn cmd_import(args: &[String]) -> anyhow::Result<()> {
    let args = parse_args(args)?;
    let Some(path) = args.positional.first() else {
        bail!("usage: provesid-cache import <path> [--replace] [--namespace ns]");
    };
    let cache = open(&args)?;
    let mode = if args.replace {
        ImportMode::Replace
    } else {
        ImportMode::Merge
    };
    let report = cache.import(path, &scope_of(args.namespace.as_ref()), mode)?;
    println!(
        "Applied {} entries, kept {} existing",
        report.applied, report.skipped
    );
    if let Some((key, err)) = &report.failed {
        bail!("import stopped at entry {key}: {err}");
    }
    Ok(())
}

fn cmd_clear(args: &[String]) -> anyhow::Result<()> {
    let args = parse_args(args)?;
    let cache = open(&args)?;
    let scope = scope_of(args.positional.first());
    let removed = cache.clear(&scope)?;
    println!("Removed {removed} entries from {scope}");
    Ok(())
}

fn cmd_verify(args: &[String]) -> anyhow::Result<()> {
    let args = parse_args(args)?;
    let cache = open(&args)?;
    let reports = cache.verify(&scope_of(args.positional.first()))?;
    if reports.is_empty() {
        println!("No namespaces found in {}", cache.cache_dir().display());
    }
    for (ns, r) in &reports {
        let status = if r.is_clean() { "ok" } else { "repaired" };
        println!(
            "{ns}: {status} ({} entries, {} orphans indexed, {} missing dropped, {} corrupt removed, {} stale temp files removed)",
            r.entries, r.orphans_indexed, r.missing_dropped, r.corrupt_removed, r.stale_tmp_removed
        );
    }
    Ok(())
}

fn cmd_inspect(args: &[String]) -> anyhow::Result<()> {
    let args = parse_args(args)?;
    let [ns, key] = args.positional.as_slice() else {
        bail!("usage: provesid-cache inspect <namespace> <hex-key>");
    };
    let key = CacheKey::from_hex(key)?;
    let cache = open(&args)?;
    let Some((payload, meta)) = cache.namespace(ns)?.disk().get(&key)? else {
        bail!("no entry {key} in namespace {ns}");
    };
    let value = match payload.format {
        PayloadFormat::Json => payload.decode::<serde_json::Value>()?,
        PayloadFormat::Binary => serde_json::Value::String(
            base64::engine::general_purpose::STANDARD.encode(&payload.bytes),
        ),
    };
    let doc = serde_json::json!({ "meta": meta, "value": value });
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}
