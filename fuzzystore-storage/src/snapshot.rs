//! Snapshot persistence for the in-memory backend.
//!
//! A snapshot is a single JSON document holding the entries that were live
//! when it was taken and the per-source update versions, with a CRC32C over
//! the serialized data. It is written to a temporary file and renamed into
//! place; the temporary file is removed if that fails.

use crate::backend::StoredEntry;
use crate::error::StorageError;
use fuzzystore_protocol::HASH_BYTES;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::Path;

const SNAPSHOT_FORMAT: u32 = 1;

/// Serialized form of one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub flag: u8,
    /// Hex-encoded digest.
    pub digest: String,
    pub value: i32,
    pub created: u64,
    pub ts: u64,
    pub expires_at: u64,
    #[serde(default)]
    pub weak: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shingles: Option<Vec<u64>>,
}

impl From<&StoredEntry> for SnapshotEntry {
    fn from(entry: &StoredEntry) -> Self {
        Self {
            flag: entry.flag,
            digest: hex::encode(entry.digest),
            value: entry.value,
            created: entry.created,
            ts: entry.ts,
            expires_at: entry.expires_at,
            weak: entry.weak,
            shingles: entry.shingles.clone(),
        }
    }
}

impl TryFrom<SnapshotEntry> for StoredEntry {
    type Error = StorageError;

    fn try_from(entry: SnapshotEntry) -> Result<Self, Self::Error> {
        let raw = hex::decode(&entry.digest)
            .map_err(|e| StorageError::InvalidDigest(format!("{}: {}", entry.digest, e)))?;
        let digest: [u8; HASH_BYTES] = raw.try_into().map_err(|raw: Vec<u8>| {
            StorageError::InvalidDigest(format!("{} has {} bytes", entry.digest, raw.len()))
        })?;

        Ok(StoredEntry {
            flag: entry.flag,
            digest,
            value: entry.value,
            created: entry.created,
            ts: entry.ts,
            expires_at: entry.expires_at,
            weak: entry.weak,
            shingles: entry.shingles,
        })
    }
}

/// Snapshot contents covered by the checksum.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub entries: Vec<SnapshotEntry>,
    #[serde(default)]
    pub versions: BTreeMap<String, u64>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    format: u32,
    created_at: u64,
    checksum: String,
    data: Snapshot,
}

impl Snapshot {
    fn checksum(&self) -> Result<String, StorageError> {
        let bytes = serde_json::to_vec(self)?;
        Ok(format!("{:08x}", crc32c::crc32c(&bytes)))
    }

    /// Writes the snapshot atomically.
    pub fn save(&self, path: &Path, now: u64) -> Result<(), StorageError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let file = SnapshotFile {
            format: SNAPSHOT_FORMAT,
            created_at: now,
            checksum: self.checksum()?,
            data: self.clone(),
        };
        let bytes = serde_json::to_vec(&file)?;

        let tmp_path = path.with_extension("tmp");
        if let Err(e) = write_and_rename(&tmp_path, path, &bytes) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        tracing::debug!(
            "Wrote snapshot {} ({} entries, {} bytes)",
            path.display(),
            self.entries.len(),
            bytes.len()
        );
        Ok(())
    }

    /// Loads a snapshot, returning `None` if the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, StorageError> {
        if !path.exists() {
            return Ok(None);
        }

        let reader = BufReader::new(File::open(path)?);
        let file: SnapshotFile = serde_json::from_reader(reader)?;

        if file.format != SNAPSHOT_FORMAT {
            return Err(StorageError::UnknownFormat {
                path: path.to_path_buf(),
                format: file.format,
            });
        }

        let actual = file.data.checksum()?;
        if actual != file.checksum {
            return Err(StorageError::ChecksumMismatch(path.to_path_buf()));
        }

        Ok(Some(file.data))
    }
}

fn write_and_rename(tmp_path: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = File::create(tmp_path)?;
    tmp.write_all(bytes)?;
    tmp.sync_all()?;
    drop(tmp);
    fs::rename(tmp_path, path)
}
