//! Text (JSON) archives. Only JSON payloads can be represented.

use super::{format_error, Archive, ArchiveEntry, ArchiveHeader};
use crate::cache::{EntryMeta, Payload, PayloadFormat};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub(super) const FORMAT_TAG: &str = "provesid-cache-text";

#[derive(Serialize, Deserialize)]
struct TextArchive {
    #[serde(flatten)]
    header: ArchiveHeader,
    entries: Vec<TextEntry>,
}

#[derive(Serialize, Deserialize)]
struct TextEntry {
    #[serde(flatten)]
    meta: EntryMeta,
    value: Value,
}

pub(super) fn encode(archive: &Archive) -> Result<Vec<u8>> {
    let mut entries = Vec::with_capacity(archive.entries.len());
    for entry in &archive.entries {
        let value = match entry.payload.to_json_value() {
            Some(value) => value?,
            None => {
                return Err(Error::UnsupportedPayload {
                    key: entry.meta.key.to_hex(),
                })
            }
        };
        entries.push(TextEntry {
            meta: entry.meta.clone(),
            value,
        });
    }
    let doc = TextArchive {
        header: archive.header.clone(),
        entries,
    };
    Ok(serde_json::to_vec_pretty(&doc)?)
}

pub(super) fn decode(raw: &[u8]) -> Result<Archive> {
    let doc: TextArchive =
        serde_json::from_slice(raw).map_err(|e| format_error(format!("bad text archive: {}", e)))?;
    if doc.header.format != FORMAT_TAG {
        return Err(format_error(format!(
            "text archive has format '{}', expected '{}'",
            doc.header.format, FORMAT_TAG
        )));
    }
    let mut entries = Vec::with_capacity(doc.entries.len());
    for TextEntry { mut meta, value } in doc.entries {
        let payload = Payload::json(&value)?;
        meta.format = PayloadFormat::Json;
        meta.size_bytes = payload.len() as u64;
        entries.push(ArchiveEntry { meta, payload });
    }
    Ok(Archive {
        header: doc.header,
        entries,
    })
}
