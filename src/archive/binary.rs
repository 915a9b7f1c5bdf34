//! Binary archive framing.
//!
//! ```text
//! "PVCA" | layout:u8 | header_len:u32 | header JSON
//! repeated: meta_len:u32 | meta JSON | payload_len:u64 | payload
//! ```
//! All integers are big-endian.

use super::{format_error, Archive, ArchiveEntry, ArchiveHeader};
use crate::cache::{EntryMeta, Payload};
use crate::Result;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub(super) const MAGIC: &[u8; 4] = b"PVCA";
pub(super) const FORMAT_TAG: &str = "provesid-cache-binary";
const LAYOUT: u8 = 1;

pub(super) fn encode(archive: &Archive) -> Result<Vec<u8>> {
    let header = serde_json::to_vec(&archive.header)?;
    let payload_bytes: usize = archive.entries.iter().map(|e| e.payload.len()).sum();
    let mut buf = BytesMut::with_capacity(9 + header.len() + payload_bytes + archive.entries.len() * 256);
    buf.put_slice(MAGIC);
    buf.put_u8(LAYOUT);
    buf.put_u32(header.len() as u32);
    buf.put_slice(&header);
    for entry in &archive.entries {
        let meta = serde_json::to_vec(&entry.meta)?;
        buf.put_u32(meta.len() as u32);
        buf.put_slice(&meta);
        buf.put_u64(entry.payload.len() as u64);
        buf.put_slice(&entry.payload.bytes);
    }
    Ok(buf.to_vec())
}

pub(super) fn decode(mut raw: Bytes) -> Result<Archive> {
    if raw.remaining() < 9 || &raw[..4] != MAGIC {
        return Err(format_error("binary archive is truncated or has a bad magic"));
    }
    raw.advance(4);
    let layout = raw.get_u8();
    if layout != LAYOUT {
        return Err(format_error(format!(
            "unsupported binary archive layout {} (expected {})",
            layout, LAYOUT
        )));
    }
    let header_len = raw.get_u32() as usize;
    let header: ArchiveHeader = serde_json::from_slice(&take(&mut raw, header_len, "header")?)
        .map_err(|e| format_error(format!("bad archive header: {}", e)))?;

    let mut entries = Vec::with_capacity(header.entry_count.min(1 << 16) as usize);
    while raw.has_remaining() {
        let index = entries.len();
        if raw.remaining() < 4 {
            return Err(format_error(format!("entry {} is truncated", index)));
        }
        let meta_len = raw.get_u32() as usize;
        let meta: EntryMeta = serde_json::from_slice(&take(&mut raw, meta_len, "entry metadata")?)
            .map_err(|e| format_error(format!("bad metadata for entry {}: {}", index, e)))?;
        if raw.remaining() < 8 {
            return Err(format_error(format!("entry {} is truncated", index)));
        }
        let payload_len = usize::try_from(raw.get_u64())
            .map_err(|_| format_error(format!("entry {} payload length overflows", index)))?;
        let bytes = take(&mut raw, payload_len, "payload")?;
        let format = meta.format;
        entries.push(ArchiveEntry {
            meta,
            payload: Payload::new(format, bytes),
        });
    }
    if entries.len() as u64 != header.entry_count {
        return Err(format_error(format!(
            "header announces {} entries, archive holds {}",
            header.entry_count,
            entries.len()
        )));
    }
    Ok(Archive { header, entries })
}

fn take(raw: &mut Bytes, len: usize, what: &str) -> Result<Bytes> {
    if raw.remaining() < len {
        return Err(format_error(format!(
            "{} needs {} bytes, {} left",
            what,
            len,
            raw.remaining()
        )));
    }
    Ok(raw.split_to(len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKey, PayloadFormat, Scope};
    use chrono::Utc;
    use serde_json::json;

    fn sample() -> Archive {
        let entries: Vec<ArchiveEntry> = [
            Payload::json(&json!({"CID": 2244})).unwrap(),
            Payload::binary(vec![0u8, 159, 146, 150]),
        ]
        .into_iter()
        .enumerate()
        .map(|(i, payload)| ArchiveEntry {
            meta: EntryMeta {
                key: CacheKey::from_bytes([i as u8; 32]),
                namespace: "pubchem".into(),
                size_bytes: payload.len() as u64,
                created_at: Utc::now(),
                format: payload.format,
                source: None,
            },
            payload,
        })
        .collect();
        Archive {
            header: ArchiveHeader::new(FORMAT_TAG, &Scope::All, entries.len()),
            entries,
        }
    }

    #[test]
    fn test_binary_archive_keeps_binary_payloads() {
        let archive = sample();
        let decoded = decode(Bytes::from(encode(&archive).unwrap())).unwrap();
        assert_eq!(decoded.header, archive.header);
        assert_eq!(decoded.entries.len(), 2);
        assert_eq!(decoded.entries[1].payload.format, PayloadFormat::Binary);
        assert_eq!(decoded.entries[1].payload.bytes.as_ref(), &[0u8, 159, 146, 150]);
    }

    #[test]
    fn test_truncated_archive_is_rejected() {
        let raw = encode(&sample()).unwrap();
        let err = decode(Bytes::copy_from_slice(&raw[..raw.len() - 2])).unwrap_err();
        assert!(err.to_string().contains("payload needs"));
    }

    #[test]
    fn test_unknown_layout_is_rejected() {
        let mut raw = encode(&sample()).unwrap();
        raw[4] = 9;
        assert!(decode(Bytes::from(raw)).is_err());
    }

    #[test]
    fn test_unknown_header_fields_are_ignored() {
        let header = json!({
            "format": FORMAT_TAG,
            "version": 3,
            "scope": "all",
            "entry_count": 0,
            "created_at": "2024-05-01T00:00:00Z",
            "compression": "none"
        });
        let header = serde_json::to_vec(&header).unwrap();
        let mut raw = BytesMut::new();
        raw.put_slice(MAGIC);
        raw.put_u8(LAYOUT);
        raw.put_u32(header.len() as u32);
        raw.put_slice(&header);
        let decoded = decode(raw.freeze()).unwrap();
        assert_eq!(decoded.header.version, 3);
        assert!(decoded.entries.is_empty());
    }
}
