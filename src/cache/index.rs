//! Per-namespace metadata index backed by an append-only JSON-lines log.

use super::key::CacheKey;
use super::payload::PayloadFormat;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

/// Metadata stored alongside every persisted entry.
///
/// Unknown fields are ignored when reading so newer writers stay readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub key: CacheKey,
    pub namespace: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub format: PayloadFormat,
    /// Call signature (or other origin) that produced the entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogRecord {
    Put(EntryMeta),
    Del { key: CacheKey },
}

/// Incrementally maintained aggregate of one namespace's entries.
#[derive(Debug, Default, Clone)]
pub struct NamespaceIndex {
    entries: BTreeMap<CacheKey, EntryMeta>,
    total_bytes: u64,
}

impl NamespaceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, meta: EntryMeta) {
        self.total_bytes += meta.size_bytes;
        if let Some(old) = self.entries.insert(meta.key, meta) {
            self.total_bytes -= old.size_bytes;
        }
    }

    pub fn remove(&mut self, key: &CacheKey) -> Option<EntryMeta> {
        let old = self.entries.remove(key)?;
        self.total_bytes -= old.size_bytes;
        Some(old)
    }

    pub fn get(&self, key: &CacheKey) -> Option<&EntryMeta> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.entries.keys()
    }

    pub fn list(&self) -> Vec<EntryMeta> {
        self.entries.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
    }
}

/// Result of replaying an index log.
#[derive(Debug, Default)]
pub(crate) struct Replay {
    pub index: NamespaceIndex,
    /// Records read, including superseded ones.
    pub records: usize,
    /// Lines that could not be parsed (torn appends, unknown ops).
    pub skipped: usize,
}

/// Replay the log at `path`. A missing log yields `None`.
pub(crate) fn replay(path: &Path) -> Result<Option<Replay>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::disk_read(path, e)),
    };
    let mut out = Replay::default();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| Error::disk_read(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogRecord>(&line) {
            Ok(LogRecord::Put(meta)) => out.index.insert(meta),
            Ok(LogRecord::Del { key }) => {
                out.index.remove(&key);
            }
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "skipping unreadable index record");
                out.skipped += 1;
                continue;
            }
        }
        out.records += 1;
    }
    Ok(Some(out))
}

pub(crate) fn append_put(path: &Path, meta: &EntryMeta) -> Result<()> {
    append(path, &LogRecord::Put(meta.clone()))
}

pub(crate) fn append_del(path: &Path, key: CacheKey) -> Result<()> {
    append(path, &LogRecord::Del { key })
}

fn append(path: &Path, record: &LogRecord) -> Result<()> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::disk_write(path, e))?;
    // One write per record so concurrent appenders interleave whole lines.
    file.write_all(&line).map_err(|e| Error::disk_write(path, e))
}

/// Atomically replace the log with one `put` record per live entry.
pub(crate) fn rewrite(path: &Path, index: &NamespaceIndex) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = dir.join(format!(".index-{}.tmp", uuid::Uuid::new_v4()));
    let result = (|| -> Result<()> {
        let mut file = File::create(&tmp).map_err(|e| Error::disk_write(&tmp, e))?;
        let mut buf = Vec::with_capacity(index.len() * 200);
        for meta in index.entries.values() {
            serde_json::to_writer(&mut buf, &LogRecord::Put(meta.clone()))?;
            buf.push(b'\n');
        }
        file.write_all(&buf).map_err(|e| Error::disk_write(&tmp, e))?;
        file.sync_all().map_err(|e| Error::disk_write(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| Error::disk_write(path, e))
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}
