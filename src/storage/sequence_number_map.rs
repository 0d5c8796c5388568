//! Sequence number store
//!
//! Maps the payload hash of a storage entry to the sequence number and
//! timestamp it was last stored with. The map is a plain durable dictionary:
//! the ordering rule (only a strictly greater sequence number replaces the
//! stored one) is enforced by the storage layer that uses it.
//!
//! # Persistence
//!
//! ```text
//! file = bincode(Vec<SequenceNumberEntry>)   sorted by hash
//! ```
//!
//! The whole map is read at startup and written on flush. Entries are kept in
//! a `BTreeMap`, so an unmodified map always serializes to the same bytes.

use crate::types::{Hash, now_millis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

/// Security limit for file load: ~44 bytes per entry, over a million entries
const MAX_SEQUENCE_MAP_FILE_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("sequence map file too large: {0} bytes")]
    FileTooLarge(u64),
}

/// Stored state for one payload hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapValue {
    pub sequence_number: u32,
    /// Wall clock at storage, unix millis
    pub time_stamp: u64,
}

impl MapValue {
    pub fn new(sequence_number: u32) -> Self {
        Self {
            sequence_number,
            time_stamp: now_millis(),
        }
    }
}

/// Persisted record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceNumberEntry {
    pub hash: Hash,
    pub sequence_number: u32,
    pub time_stamp: u64,
}

/// Thread-safe map, locked as a whole per operation
#[derive(Debug, Default)]
pub struct SequenceNumberMap {
    map: Mutex<BTreeMap<Hash, MapValue>>,
    /// Mutated since the last successful save
    dirty: AtomicBool,
}

impl SequenceNumberMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, hash: &Hash) -> Option<MapValue> {
        self.map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(hash)
            .copied()
    }

    pub fn contains_key(&self, hash: &Hash) -> bool {
        self.map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(hash)
    }

    /// Insert or overwrite; returns the previous value
    pub fn put(&self, hash: Hash, value: MapValue) -> Option<MapValue> {
        let previous = self
            .map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(hash, value);
        self.dirty.store(true, Ordering::SeqCst);
        previous
    }

    /// Insert only if `value` carries a strictly greater sequence number
    /// than the stored one. Compare and insert happen under one lock.
    /// `Err` returns the stored value that won.
    pub fn put_if_greater(
        &self,
        hash: Hash,
        value: MapValue,
    ) -> Result<Option<MapValue>, MapValue> {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        match map.get(&hash) {
            Some(stored) if value.sequence_number <= stored.sequence_number => Err(*stored),
            _ => {
                let previous = map.insert(hash, value);
                self.dirty.store(true, Ordering::SeqCst);
                Ok(previous)
            }
        }
    }

    pub fn remove(&self, hash: &Hash) -> Option<MapValue> {
        let removed = self
            .map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(hash);
        if removed.is_some() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Entries in hash order
    pub fn to_entries(&self) -> Vec<SequenceNumberEntry> {
        self.map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(hash, value)| SequenceNumberEntry {
                hash: *hash,
                sequence_number: value.sequence_number,
                time_stamp: value.time_stamp,
            })
            .collect()
    }

    /// Later duplicates of a hash win
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = SequenceNumberEntry>,
    {
        let map = entries
            .into_iter()
            .map(|e| {
                (
                    e.hash,
                    MapValue {
                        sequence_number: e.sequence_number,
                        time_stamp: e.time_stamp,
                    },
                )
            })
            .collect();
        Self {
            map: Mutex::new(map),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        Ok(bincode::serialize(&self.to_entries())?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, StorageError> {
        if data.len() as u64 > MAX_SEQUENCE_MAP_FILE_SIZE {
            return Err(StorageError::FileTooLarge(data.len() as u64));
        }
        let entries: Vec<SequenceNumberEntry> = bincode::deserialize(data)?;
        Ok(Self::from_entries(entries))
    }

    /// Load from file. A missing file is an empty map.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();

        // Security: reject oversized files before reading them
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > MAX_SEQUENCE_MAP_FILE_SIZE => {
                return Err(StorageError::FileTooLarge(meta.len()));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No sequence map at {}, starting empty", path.display());
                return Ok(Self::new());
            }
            Err(e) => return Err(e.into()),
        }

        let map = Self::from_bytes(&std::fs::read(path)?)?;
        info!("Loaded {} sequence numbers from {}", map.len(), path.display());
        Ok(map)
    }

    /// Write to a temp file, then rename it over `path`
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), StorageError> {
        let path = path.as_ref();
        // Cleared first so a concurrent put during the write stays dirty
        self.dirty.store(false, Ordering::SeqCst);

        let result = self.to_bytes().and_then(|data| {
            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, &data)?;
            std::fs::rename(&tmp, path)?;
            Ok(data.len())
        });

        match result {
            Ok(size) => {
                debug!("Saved sequence map to {} ({} bytes)", path.display(), size);
                Ok(())
            }
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Save only if mutated since the last save. Returns whether it wrote.
    pub fn flush_if_dirty<P: AsRef<Path>>(&self, path: P) -> Result<bool, StorageError> {
        if !self.is_dirty() {
            return Ok(false);
        }
        self.save(path)?;
        Ok(true)
    }
}
