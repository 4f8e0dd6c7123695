//! The authoritative file manifest and its wire form.
//!
//! The control plane serves the manifest as a zstd-compressed Avro datum:
//! an array of `fileinfo` records with `path`, `hash` and `size` fields.
//! The record and field names are wire-visible and must match exactly.

use crate::error::Result;
use apache_avro::Schema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::OnceLock;
use tracing::warn;

/// One manifest entry. Identity is `hash` alone; `path` is only the
/// server-origin fetch URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub hash: String,
    pub size: i64,
}

const FILE_LIST_SCHEMA: &str = r#"{
  "type": "array",
  "items": {
    "type": "record",
    "name": "fileinfo",
    "fields": [
      {"name": "path", "type": "string"},
      {"name": "hash", "type": "string"},
      {"name": "size", "type": "long"}
    ]
  }
}"#;

fn schema() -> &'static Schema {
    static SCHEMA: OnceLock<Schema> = OnceLock::new();
    SCHEMA.get_or_init(|| Schema::parse_str(FILE_LIST_SCHEMA).expect("manifest schema is valid"))
}

/// Decode a zstd-compressed Avro manifest body.
pub fn decode_manifest(compressed: &[u8]) -> Result<Vec<FileEntry>> {
    let raw = zstd::decode_all(Cursor::new(compressed))?;
    let value = apache_avro::from_avro_datum(schema(), &mut Cursor::new(raw), None)?;
    let entries: Vec<FileEntry> = apache_avro::from_value(&value)?;
    Ok(entries)
}

/// Encode entries into the wire form.
pub fn encode_manifest(entries: &[FileEntry]) -> Result<Vec<u8>> {
    let value = apache_avro::to_value(entries)?;
    let datum = apache_avro::to_avro_datum(schema(), value)?;
    Ok(zstd::encode_all(Cursor::new(datum), 0)?)
}

/// Collapse the manifest into set semantics keyed by hash.
///
/// Two entries with the same hash are the same file: the later `path` wins.
/// Differing sizes under one hash violate the manifest contract and are
/// surfaced as a warning, keeping the later entry.
pub fn dedupe_by_hash(entries: Vec<FileEntry>) -> Vec<FileEntry> {
    let mut by_hash: HashMap<String, usize> = HashMap::with_capacity(entries.len());
    let mut out: Vec<FileEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        match by_hash.get(&entry.hash) {
            Some(&idx) => {
                if out[idx].size != entry.size {
                    warn!(
                        hash = %entry.hash,
                        old_size = out[idx].size,
                        new_size = entry.size,
                        "manifest carries conflicting sizes for one hash"
                    );
                }
                out[idx] = entry;
            }
            None => {
                by_hash.insert(entry.hash.clone(), out.len());
                out.push(entry);
            }
        }
    }
    out
}
