//! Raw info-dictionary parser: verified bencoded bytes in, torrent name,
//! total size and file list out. Parsing never panics on hostile input.

use thiserror::Error;

use crate::bencode::{self, BencodeError, Value};
use crate::model::{FileEntry, InfoHash};

#[derive(Debug, Error)]
pub enum InfoError {
    #[error(transparent)]
    Decode(#[from] BencodeError),
    #[error("top-level info value is not a dictionary")]
    NotADictionary,
}

#[derive(Debug, PartialEq)]
pub struct ParsedInfo {
    pub name: String,
    pub total_size: u64,
    pub files: Vec<FileEntry>,
}

/// Decodes a raw `info` dictionary. Multi-file layouts sum per-entry lengths
/// and join path segments with `/`; single-file layouts synthesize one entry
/// named after the torrent, falling back to the info-hash when unnamed.
pub fn parse(hash: InfoHash, raw: &[u8]) -> Result<ParsedInfo, InfoError> {
    let value = bencode::decode(raw)?;
    if value.as_dict().is_none() {
        return Err(InfoError::NotADictionary);
    }

    let name = value
        .get(b"name.utf-8")
        .or_else(|| value.get(b"name"))
        .and_then(Value::as_bytes)
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| hash.to_string());

    if let Some(entries) = value.get(b"files").and_then(Value::as_list) {
        let mut files = Vec::with_capacity(entries.len());
        let mut total: u64 = 0;
        for entry in entries {
            let length = entry
                .get(b"length")
                .and_then(Value::as_int)
                .unwrap_or(0)
                .max(0) as u64;
            total = total.saturating_add(length);
            let path = entry
                .get(b"path.utf-8")
                .or_else(|| entry.get(b"path"))
                .and_then(Value::as_list)
                .map(|segs| join_path(segs))
                .unwrap_or_default();
            if path.is_empty() {
                continue;
            }
            files.push(FileEntry { path, length });
        }
        return Ok(ParsedInfo {
            name,
            total_size: total,
            files,
        });
    }

    let length = value
        .get(b"length")
        .and_then(Value::as_int)
        .unwrap_or(0)
        .max(0) as u64;
    Ok(ParsedInfo {
        total_size: length,
        files: vec![FileEntry {
            path: name.clone(),
            length,
        }],
        name,
    })
}

fn join_path(segments: &[Value]) -> String {
    let mut out = String::new();
    for seg in segments {
        let Some(bytes) = seg.as_bytes() else {
            continue;
        };
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&String::from_utf8_lossy(bytes));
    }
    out
}
