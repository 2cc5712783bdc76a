//! The write-ahead log: an append-only mirror of every memtable insert,
//! replayed on startup to rebuild the memtable after a crash.
//!
//! A single open file handle is cached per WAL path in a [`WalRegistry`]
//! owned by the engine rather than stashed behind a process-wide
//! `lazy_static!` singleton, so multiple engines in one process never
//! contend over the same handle. The handle is reopened after `clear`
//! truncates the file.

use crate::kv::{self, KVPair};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

type Result<T> = std::result::Result<T, WalError>;

#[derive(Error, Debug)]
pub enum WalError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Corruption(#[from] kv::KvError),
}

pub struct Wal {
    file: File,
}

impl Wal {
    fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        Ok(Wal { file })
    }

    /// Appends one `key,value\n` record and flushes it to the OS.
    pub fn append(&mut self, key: &str, value: &str) -> Result<()> {
        let record = kv::to_record(key, value);
        self.file.write_all(record.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }

    /// Truncates the WAL to zero length. The caller must still hold this
    /// handle (or re-fetch it from the registry) to append again.
    pub fn clear(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Replays every record currently in the log, in append order.
    pub fn replay(&mut self) -> Result<Vec<KVPair>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut records = Vec::new();
        for line in BufReader::new(&self.file).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            records.push(kv::parse_record(&line)?);
        }
        self.file.seek(SeekFrom::End(0))?;
        Ok(records)
    }
}

/// Engine-owned, path-keyed cache of open WAL handles.
#[derive(Default)]
pub struct WalRegistry {
    handles: HashMap<PathBuf, Wal>,
}

impl WalRegistry {
    pub fn new() -> Self {
        WalRegistry {
            handles: HashMap::new(),
        }
    }

    /// Returns the cached handle for `path`, opening (and caching) one if
    /// this is the first access.
    pub fn handle(&mut self, path: &Path) -> Result<&mut Wal> {
        if !self.handles.contains_key(path) {
            let wal = Wal::open(path)?;
            self.handles.insert(path.to_path_buf(), wal);
        }
        Ok(self.handles.get_mut(path).expect("just inserted"))
    }

    pub fn append(&mut self, path: &Path, key: &str, value: &str) -> Result<()> {
        self.handle(path)?.append(key, value)
    }

    pub fn clear(&mut self, path: &Path) -> Result<()> {
        self.handle(path)?.clear()
    }

    pub fn replay(&mut self, path: &Path) -> Result<Vec<KVPair>> {
        self.handle(path)?.replay()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_and_replay_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");
        let mut registry = WalRegistry::new();
        registry.append(&path, "k1", "v1").unwrap();
        registry.append(&path, "k2", "v2").unwrap();

        let records = registry.replay(&path).unwrap();
        assert_eq!(records[0].key, "k1");
        assert_eq!(records[0].value, "v1");
        assert_eq!(records[1].key, "k2");
        assert_eq!(records[1].value, "v2");
    }

    #[test]
    fn clear_truncates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");
        let mut registry = WalRegistry::new();
        registry.append(&path, "k1", "v1").unwrap();
        registry.clear(&path).unwrap();
        registry.append(&path, "k2", "v2").unwrap();

        let records = registry.replay(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "k2");
    }

    #[test]
    fn corrupted_line_surfaces_as_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");
        std::fs::write(&path, "not-a-valid-record\n").unwrap();
        let mut registry = WalRegistry::new();
        assert!(registry.replay(&path).is_err());
    }
}
