//! Serialized forms stored in the blob store.
//!
//! A directory is a JSON blob:
//!
//! ```json
//! {"type":"directory","entries":{"a.txt":{"kind":"file","digest":"sha1-…","size":3,"mtime":1700000000}}}
//! ```
//!
//! Entries are kept in a `BTreeMap` so the encoding of a given listing is
//! stable and its digest deterministic. The roots index follows the same
//! shape with `"type":"roots"`.

use std::collections::BTreeMap;

use blobfs_cas::{BlobStore, Digest};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VfsError};

/// Bytes sniffed from the front of a blob before a full directory decode.
const SNIFF_LEN: usize = 64;
const DIRECTORY_TAG: &str = r#""type":"directory""#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub kind: EntryKind,
    pub digest: Digest,
    pub size: u64,
    /// Seconds since the Unix epoch.
    pub mtime: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub entries: BTreeMap<String, EntryRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootIndex {
    pub roots: BTreeMap<String, Digest>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Schema {
    Directory(DirectoryRecord),
    Roots(RootIndex),
}

impl DirectoryRecord {
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(&Schema::Directory(self.clone()))
    }

    /// Decode a blob, `None` if it is not a directory.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        match serde_json::from_slice(bytes) {
            Ok(Schema::Directory(dir)) => Some(dir),
            _ => None,
        }
    }

    /// Decode a blob that must be a directory.
    pub fn decode_strict(bytes: &[u8], what: &Digest) -> Result<Self> {
        Self::decode(bytes).ok_or_else(|| VfsError::Corrupt {
            what: what.to_string(),
            reason: "not a directory record".to_string(),
        })
    }

    /// Fetch `digest` and decode it if it carries the directory tag.
    ///
    /// Only a short prefix is read first, so probing large file blobs
    /// does not pull their whole content.
    pub fn sniff(store: &dyn BlobStore, digest: &Digest) -> Result<Option<Self>> {
        let mut head = [0u8; SNIFF_LEN];
        let n = store.read_at(digest, 0, &mut head)?;
        let head = String::from_utf8_lossy(&head[..n]);
        if !head.starts_with('{') || !head.contains(DIRECTORY_TAG) {
            return Ok(None);
        }
        let bytes = store.get(digest)?;
        Ok(Self::decode(&bytes))
    }
}

impl RootIndex {
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(&Schema::Roots(self.clone()))
    }

    pub fn decode(bytes: &[u8], what: &Digest) -> Result<Self> {
        match serde_json::from_slice(bytes) {
            Ok(Schema::Roots(index)) => Ok(index),
            Ok(_) => Err(VfsError::Corrupt {
                what: what.to_string(),
                reason: "not a roots index".to_string(),
            }),
            Err(e) => Err(VfsError::Corrupt {
                what: what.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

fn encode(schema: &Schema) -> Result<Vec<u8>> {
    serde_json::to_vec(schema).map_err(|e| VfsError::Corrupt {
        what: "schema".to_string(),
        reason: e.to_string(),
    })
}
