//! 缓存归档：整库或单命名空间的导出、导入与合并。
//!
//! # Cache archives
//!
//! A cache, or one namespace of it, can be written to a single portable file
//! and merged into (or used to replace) another cache.
//!
//! | Format | Payloads | Layout |
//! |--------|----------|--------|
//! | [`ArchiveFormat::Binary`] | any | `PVCA`, version byte, JSON header, framed entries |
//! | [`ArchiveFormat::Text`] | JSON only | one JSON document with the values inlined |
//!
//! Export is all-or-nothing: the archive is assembled in a temp file and
//! renamed into place only when every entry was read. Import is best-effort
//! forward progress: entries are committed one at a time and the first
//! failure stops the import, reported in [`ImportReport::failed`].

mod binary;
mod text;

use crate::cache::{validate_namespace, CacheManager, EntryMeta, Payload, Scope, WriteMode};
use crate::{Error, ErrorContext, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::Path;

pub const ARCHIVE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    Binary,
    Text,
}

impl ArchiveFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveFormat::Binary => "binary",
            ArchiveFormat::Text => "text",
        }
    }

    /// Guess the format from the first bytes of an archive.
    pub fn detect(raw: &[u8]) -> Option<Self> {
        if raw.starts_with(binary::MAGIC) {
            return Some(ArchiveFormat::Binary);
        }
        match raw.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') => Some(ArchiveFormat::Text),
            _ => None,
        }
    }
}

impl std::str::FromStr for ArchiveFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "binary" | "bin" => Ok(ArchiveFormat::Binary),
            "text" | "json" => Ok(ArchiveFormat::Text),
            other => Err(Error::configuration_with_context(
                format!("unknown archive format '{}'", other),
                ErrorContext::new()
                    .with_field_path("format")
                    .with_details("expected binary or text"),
            )),
        }
    }
}

/// What import does with entries already in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Keep local entries; only add keys that are missing.
    Merge,
    /// Clear the target scope first, then write every archived entry.
    Replace,
}

impl ImportMode {
    pub fn from_merge(merge: bool) -> Self {
        if merge {
            ImportMode::Merge
        } else {
            ImportMode::Replace
        }
    }
}

/// Self-describing header shared by both formats. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveHeader {
    pub format: String,
    pub version: u32,
    pub scope: String,
    pub entry_count: u64,
    pub created_at: DateTime<Utc>,
}

impl ArchiveHeader {
    fn new(format: &str, scope: &Scope, entry_count: usize) -> Self {
        Self {
            format: format.to_string(),
            version: ARCHIVE_VERSION,
            scope: scope.to_string(),
            entry_count: entry_count as u64,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub meta: EntryMeta,
    pub payload: Payload,
}

/// A decoded archive.
#[derive(Debug, Clone)]
pub struct Archive {
    pub header: ArchiveHeader,
    pub entries: Vec<ArchiveEntry>,
}

impl Archive {
    pub fn decode(raw: bytes::Bytes) -> Result<Self> {
        match ArchiveFormat::detect(&raw) {
            Some(ArchiveFormat::Binary) => binary::decode(raw),
            Some(ArchiveFormat::Text) => text::decode(&raw),
            None => Err(format_error("unrecognized archive: expected PVCA magic or a JSON document")),
        }
    }

    pub fn encode(&self, format: ArchiveFormat) -> Result<Vec<u8>> {
        match format {
            ArchiveFormat::Binary => binary::encode(self),
            ArchiveFormat::Text => text::encode(self),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExportReport {
    pub entries: usize,
    pub bytes: u64,
}

#[derive(Debug, Default)]
pub struct ImportReport {
    pub applied: usize,
    /// Entries left alone because the key already existed locally.
    pub skipped: usize,
    /// Hex key and error of the entry that stopped the import.
    pub failed: Option<(String, Error)>,
}

impl ImportReport {
    pub fn success(&self) -> bool {
        self.failed.is_none()
    }
}

pub(crate) fn format_error(msg: impl Into<String>) -> Error {
    Error::import_format_with_context(msg, ErrorContext::new().with_source("archive"))
}

impl CacheManager {
    /// Collect every entry in `scope` into an [`Archive`].
    pub fn snapshot(&self, scope: &Scope, format: ArchiveFormat) -> Result<Archive> {
        let mut entries = Vec::new();
        for ns in self.scoped(scope)? {
            for meta in ns.disk().list() {
                // Deleted since listing.
                let Some((payload, meta)) = ns.disk().get(&meta.key)? else {
                    continue;
                };
                entries.push(ArchiveEntry { meta, payload });
            }
        }
        let tag = match format {
            ArchiveFormat::Binary => binary::FORMAT_TAG,
            ArchiveFormat::Text => text::FORMAT_TAG,
        };
        Ok(Archive {
            header: ArchiveHeader::new(tag, scope, entries.len()),
            entries,
        })
    }

    /// Write `scope` to `path`. Nothing is written if any entry fails.
    pub fn export(&self, path: impl AsRef<Path>, scope: &Scope, format: ArchiveFormat) -> Result<ExportReport> {
        let path = path.as_ref();
        let archive = self.snapshot(scope, format)?;
        let encoded = archive.encode(format)?;

        let tmp = path.with_file_name(format!(
            ".{}.{}.tmp",
            path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
            uuid::Uuid::new_v4().simple()
        ));
        let written = fs::File::create(&tmp)
            .and_then(|mut f| {
                f.write_all(&encoded)?;
                f.sync_all()
            })
            .and_then(|_| fs::rename(&tmp, path));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(Error::disk_write(path, e));
        }

        let report = ExportReport {
            entries: archive.entries.len(),
            bytes: encoded.len() as u64,
        };
        tracing::info!(
            path = %path.display(),
            %scope,
            format = format.as_str(),
            entries = report.entries,
            bytes = report.bytes,
            "exported cache"
        );
        Ok(report)
    }

    /// Read an archive from `path` and apply it to `scope`.
    ///
    /// An unreadable or malformed archive fails before anything is changed.
    pub fn import(&self, path: impl AsRef<Path>, scope: &Scope, mode: ImportMode) -> Result<ImportReport> {
        let path = path.as_ref();
        let raw = fs::read(path).map_err(|e| Error::disk_read(path, e))?;
        let archive = Archive::decode(raw.into())?;
        if archive.header.version > ARCHIVE_VERSION {
            tracing::warn!(
                version = archive.header.version,
                supported = ARCHIVE_VERSION,
                "archive written by a newer version, reading known fields only"
            );
        }
        let report = self.apply(archive, scope, mode)?;
        tracing::info!(
            path = %path.display(),
            %scope,
            applied = report.applied,
            skipped = report.skipped,
            failed = report.failed.is_some(),
            "imported cache"
        );
        Ok(report)
    }

    /// Apply a decoded archive. Entries outside `scope` are ignored.
    pub fn apply(&self, archive: Archive, scope: &Scope, mode: ImportMode) -> Result<ImportReport> {
        if mode == ImportMode::Replace {
            let mut removed = 0;
            for name in replaced_namespaces(&archive, scope) {
                if validate_namespace(&name).is_ok() {
                    removed += self.namespace(&name)?.clear()?;
                }
            }
            tracing::info!(%scope, removed, "cleared namespaces replaced by import");
        }
        let write_mode = match mode {
            ImportMode::Merge => WriteMode::IfAbsent,
            ImportMode::Replace => WriteMode::Overwrite,
        };

        let mut report = ImportReport::default();
        for entry in archive.entries {
            if let Some(ns) = scope.as_namespace() {
                if entry.meta.namespace != ns {
                    continue;
                }
            }
            let key = entry.meta.key;
            let written = self
                .namespace(&entry.meta.namespace)
                .and_then(|ns| ns.disk().write_entry(&entry.meta, &entry.payload, write_mode));
            match written {
                Ok(true) => report.applied += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "import stopped");
                    report.failed = Some((key.to_hex(), e));
                    break;
                }
            }
        }
        if let Err(e) = self.check_threshold() {
            tracing::warn!(error = %e, "cache size check failed");
        }
        Ok(report)
    }
}

/// Namespaces a replacing import empties first.
///
/// A namespace scope names exactly one. Otherwise a namespace archive replaces
/// its own namespace, and a whole-cache archive replaces the namespaces it
/// carries entries for. Namespaces absent from the archive are untouched.
fn replaced_namespaces(archive: &Archive, scope: &Scope) -> BTreeSet<String> {
    if let Some(ns) = scope.as_namespace() {
        return BTreeSet::from([ns.to_string()]);
    }
    let mut names: BTreeSet<String> = archive
        .entries
        .iter()
        .map(|e| e.meta.namespace.clone())
        .collect();
    if archive.header.scope != Scope::All.to_string() {
        names.insert(archive.header.scope.clone());
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_format() {
        assert_eq!(ArchiveFormat::detect(b"PVCA\x01"), Some(ArchiveFormat::Binary));
        assert_eq!(ArchiveFormat::detect(b"  \n{\"format\":1}"), Some(ArchiveFormat::Text));
        assert_eq!(ArchiveFormat::detect(b"PK\x03\x04"), None);
        assert_eq!(ArchiveFormat::detect(b""), None);
    }

    #[test]
    fn test_parse_format_names() {
        assert_eq!("TEXT".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::Text);
        assert_eq!("bin".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::Binary);
        assert!("pickle".parse::<ArchiveFormat>().is_err());
    }

    #[test]
    fn test_unrecognized_archive_is_import_format_error() {
        let err = Archive::decode(bytes::Bytes::from_static(b"not an archive")).unwrap_err();
        assert!(matches!(err, Error::ImportFormat { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_import_mode_from_merge() {
        assert_eq!(ImportMode::from_merge(true), ImportMode::Merge);
        assert_eq!(ImportMode::from_merge(false), ImportMode::Replace);
    }
}
