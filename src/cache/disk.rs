//! 磁盘存储：每个条目一个文件，临时文件 + 原子重命名写入。
//!
//! Persistent per-namespace entry store.
//!
//! Layout under `<cache_root>/<namespace>/`:
//!
//! | File | Content |
//! |------|---------|
//! | `<hex-key>.entry` | magic, JSON [`EntryMeta`] header, payload bytes |
//! | `index.log` | JSON-lines put/del records replayed on open |
//! | `.<hex-key>.<uuid>.tmp` | in-progress write, renamed over the entry when complete |
//!
//! Entry files carry their own metadata, so the rename that publishes a
//! payload publishes its metadata in the same step and the index can always
//! be rebuilt from a directory scan.

use super::index::{self, EntryMeta, NamespaceIndex};
use super::key::CacheKey;
use super::payload::Payload;
use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const ENTRY_MAGIC: &[u8; 4] = b"PVC1";
const ENTRY_EXT: &str = "entry";
const INDEX_FILE: &str = "index.log";
const MIN_COMPACTION_RECORDS: usize = 64;
/// Temp files younger than this may belong to a writer in another process.
const STALE_TMP_AGE: Duration = Duration::from_secs(600);

/// How [`DiskStore::write_entry`] treats an existing entry for the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Overwrite,
    IfAbsent,
}

/// Outcome of a consistency check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub entries: usize,
    pub orphans_indexed: usize,
    pub missing_dropped: usize,
    pub corrupt_removed: usize,
    pub stale_tmp_removed: usize,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.orphans_indexed == 0
            && self.missing_dropped == 0
            && self.corrupt_removed == 0
            && self.stale_tmp_removed == 0
    }
}

struct StoreState {
    index: NamespaceIndex,
    log_records: usize,
}

/// File-backed store for a single namespace.
pub struct DiskStore {
    namespace: String,
    dir: PathBuf,
    index_path: PathBuf,
    compaction_ratio: usize,
    state: Mutex<StoreState>,
}

impl DiskStore {
    /// Open (creating if needed) the store for `namespace` under `root`.
    pub fn open(root: &Path, namespace: &str, compaction_ratio: usize) -> Result<Self> {
        validate_namespace(namespace)?;
        let dir = root.join(namespace);
        fs::create_dir_all(&dir).map_err(|e| Error::disk_write(&dir, e))?;
        let index_path = dir.join(INDEX_FILE);

        let store = Self {
            namespace: namespace.to_string(),
            dir,
            index_path,
            compaction_ratio: compaction_ratio.max(2),
            state: Mutex::new(StoreState {
                index: NamespaceIndex::new(),
                log_records: 0,
            }),
        };

        match index::replay(&store.index_path)? {
            Some(replay) => {
                let needs_rewrite = replay.skipped > 0;
                let mut st = store.lock();
                st.log_records = replay.records;
                st.index = replay.index;
                if needs_rewrite {
                    tracing::warn!(
                        namespace = %store.namespace,
                        skipped = replay.skipped,
                        "index log had unreadable records, compacting"
                    );
                    index::rewrite(&store.index_path, &st.index)?;
                    st.log_records = st.index.len();
                }
            }
            None => {
                let report = store.verify()?;
                if report.entries > 0 {
                    tracing::info!(
                        namespace = %store.namespace,
                        entries = report.entries,
                        "rebuilt missing index from entry files"
                    );
                }
            }
        }
        Ok(store)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.{}", key.to_hex(), ENTRY_EXT))
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read an entry. Absent files are `Ok(None)`; unreadable or torn files are `DiskRead`.
    pub fn get(&self, key: &CacheKey) -> Result<Option<(Payload, EntryMeta)>> {
        let path = self.entry_path(key);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::disk_read(&path, e)),
        };
        let (meta, payload) = decode_entry(Bytes::from(raw)).map_err(|m| Error::disk_read(&path, m))?;
        if meta.key != *key {
            return Err(Error::disk_read(
                &path,
                format!("entry header names key {}", meta.key),
            ));
        }
        Ok(Some((payload, meta)))
    }

    /// Persist a freshly computed payload, replacing any previous entry.
    pub fn put(&self, key: CacheKey, payload: &Payload, source: Option<&str>) -> Result<EntryMeta> {
        let meta = EntryMeta {
            key,
            namespace: self.namespace.clone(),
            size_bytes: payload.len() as u64,
            created_at: Utc::now(),
            format: payload.format,
            source: source.map(str::to_string),
        };
        self.write_entry(&meta, payload, WriteMode::Overwrite)?;
        Ok(meta)
    }

    /// Write an entry with caller-supplied metadata. Returns `false` when
    /// `mode` is [`WriteMode::IfAbsent`] and the key already exists.
    pub fn write_entry(&self, meta: &EntryMeta, payload: &Payload, mode: WriteMode) -> Result<bool> {
        let mut meta = meta.clone();
        meta.namespace = self.namespace.clone();
        meta.size_bytes = payload.len() as u64;
        meta.format = payload.format;

        let path = self.entry_path(&meta.key);
        if mode == WriteMode::IfAbsent && (self.contains(&meta.key) || path.exists()) {
            return Ok(false);
        }

        let encoded = encode_entry(&meta, payload)?;
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", meta.key.to_hex(), uuid::Uuid::new_v4().simple()));
        if let Err(e) = write_file_synced(&tmp, &encoded) {
            let _ = fs::remove_file(&tmp);
            return Err(Error::disk_write(&tmp, e));
        }

        let mut st = self.lock();
        if mode == WriteMode::IfAbsent && (st.index.contains(&meta.key) || path.exists()) {
            drop(st);
            let _ = fs::remove_file(&tmp);
            return Ok(false);
        }
        if let Err(e) = fs::rename(&tmp, &path) {
            drop(st);
            let _ = fs::remove_file(&tmp);
            return Err(Error::disk_write(&path, e));
        }
        st.index.insert(meta.clone());
        index::append_put(&self.index_path, &meta)?;
        st.log_records += 1;
        self.maybe_compact(&mut st);
        Ok(true)
    }

    pub fn delete(&self, key: &CacheKey) -> Result<bool> {
        let path = self.entry_path(key);
        let mut st = self.lock();
        let existed = match fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(Error::disk_write(&path, e)),
        };
        let indexed = st.index.remove(key).is_some();
        if existed || indexed {
            index::append_del(&self.index_path, *key)?;
            st.log_records += 1;
            self.maybe_compact(&mut st);
        }
        Ok(existed || indexed)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().index.contains(key)
    }

    pub fn list(&self) -> Vec<EntryMeta> {
        self.lock().index.list()
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.lock().index.keys().copied().collect()
    }

    pub fn total_size(&self) -> u64 {
        self.lock().index.total_bytes()
    }

    pub fn len(&self) -> usize {
        self.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(entry_count, total_bytes)` read under one lock.
    pub fn totals(&self) -> (usize, u64) {
        let st = self.lock();
        (st.index.len(), st.index.total_bytes())
    }

    /// Remove every entry of this namespace. Returns the number of files removed.
    pub fn clear(&self) -> Result<usize> {
        let mut st = self.lock();
        let mut removed = 0;
        for path in self.entry_files()? {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::disk_write(&path, e)),
            }
        }
        st.index.clear();
        index::rewrite(&self.index_path, &st.index)?;
        st.log_records = 0;
        Ok(removed)
    }

    /// Reload the index log, picking up entries appended by other processes.
    pub fn reload(&self) -> Result<()> {
        let mut st = self.lock();
        if let Some(replay) = index::replay(&self.index_path)? {
            st.index = replay.index;
            st.log_records = replay.records;
        }
        Ok(())
    }

    /// Rebuild the index from the entry files on disk.
    ///
    /// Drops records whose file is gone, indexes entry files the log missed,
    /// removes unreadable entry files and stale temp files, then rewrites the log.
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut st = self.lock();
        let mut report = VerifyReport::default();
        let mut rebuilt = NamespaceIndex::new();

        let read_dir = fs::read_dir(&self.dir).map_err(|e| Error::disk_read(&self.dir, e))?;
        for dirent in read_dir {
            let dirent = dirent.map_err(|e| Error::disk_read(&self.dir, e))?;
            let path = dirent.path();
            let name = dirent.file_name().to_string_lossy().into_owned();

            if name.ends_with(".tmp") {
                if is_stale(&path) && fs::remove_file(&path).is_ok() {
                    report.stale_tmp_removed += 1;
                }
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXT) {
                continue;
            }

            let decoded = fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|raw| decode_entry(Bytes::from(raw)));
            match decoded {
                Ok((meta, _)) if path == self.entry_path(&meta.key) => {
                    if !st.index.contains(&meta.key) {
                        report.orphans_indexed += 1;
                    }
                    rebuilt.insert(meta);
                }
                Ok(_) | Err(_) => {
                    tracing::warn!(path = %path.display(), "removing unreadable cache entry");
                    fs::remove_file(&path).map_err(|e| Error::disk_write(&path, e))?;
                    report.corrupt_removed += 1;
                }
            }
        }

        report.missing_dropped = st.index.keys().filter(|k| !rebuilt.contains(k)).count();
        report.entries = rebuilt.len();
        index::rewrite(&self.index_path, &rebuilt)?;
        st.log_records = rebuilt.len();
        st.index = rebuilt;
        Ok(report)
    }

    fn entry_files(&self) -> Result<Vec<PathBuf>> {
        let read_dir = fs::read_dir(&self.dir).map_err(|e| Error::disk_read(&self.dir, e))?;
        let mut out = Vec::new();
        for dirent in read_dir {
            let path = dirent.map_err(|e| Error::disk_read(&self.dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(ENTRY_EXT) {
                out.push(path);
            }
        }
        Ok(out)
    }

    fn maybe_compact(&self, st: &mut StoreState) {
        let live = st.index.len().max(MIN_COMPACTION_RECORDS);
        if st.log_records <= live * self.compaction_ratio {
            return;
        }
        match index::rewrite(&self.index_path, &st.index) {
            Ok(()) => {
                tracing::debug!(namespace = %self.namespace, records = st.log_records, live = st.index.len(), "compacted index log");
                st.log_records = st.index.len();
            }
            Err(e) => tracing::warn!(namespace = %self.namespace, error = %e, "index compaction failed"),
        }
    }
}

/// Namespaces become directory names, so they must be a single plain path component.
pub(crate) fn validate_namespace(namespace: &str) -> Result<()> {
    let ok = !namespace.is_empty()
        && namespace.len() <= 128
        && !namespace.starts_with('.')
        && namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if ok {
        Ok(())
    } else {
        Err(Error::configuration_with_context(
            format!("invalid cache namespace '{}'", namespace),
            crate::ErrorContext::new()
                .with_field_path("namespace")
                .with_details("expected ASCII letters, digits, '_', '-' or '.', not starting with '.'")
                .with_source("disk_store"),
        ))
    }
}

fn write_file_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}

fn is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.elapsed().ok())
        .map(|age| age >= STALE_TMP_AGE)
        .unwrap_or(false)
}

pub(crate) fn encode_entry(meta: &EntryMeta, payload: &Payload) -> Result<Vec<u8>> {
    let header = serde_json::to_vec(meta)?;
    let mut buf = BytesMut::with_capacity(8 + header.len() + payload.len());
    buf.put_slice(ENTRY_MAGIC);
    buf.put_u32(header.len() as u32);
    buf.put_slice(&header);
    buf.put_slice(&payload.bytes);
    Ok(buf.to_vec())
}

pub(crate) fn decode_entry(raw: Bytes) -> std::result::Result<(EntryMeta, Payload), String> {
    if raw.len() < 8 || &raw[..4] != ENTRY_MAGIC {
        return Err("not a cache entry file".to_string());
    }
    let header_len = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]) as usize;
    let body = 8usize
        .checked_add(header_len)
        .filter(|end| *end <= raw.len())
        .ok_or_else(|| "truncated entry header".to_string())?;
    let meta: EntryMeta =
        serde_json::from_slice(&raw[8..body]).map_err(|e| format!("bad entry header: {}", e))?;
    let payload = raw.slice(body..);
    if payload.len() as u64 != meta.size_bytes {
        return Err(format!(
            "payload is {} bytes, header says {}",
            payload.len(),
            meta.size_bytes
        ));
    }
    let format = meta.format;
    Ok((meta, Payload::new(format, payload)))
}
