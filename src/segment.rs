//! On-disk sorted segment files: flush-from-memtable, binary search,
//! pairwise streaming merge, and physical key deletion.
//!
//! Every operation here opens the file(s) it needs and closes them before
//! returning; no file handle outlives a single call.
//! Level membership (which of L1/L2/L3 a segment belongs to) is bookkeeping
//! owned by the engine/compaction engine, not by `SegmentStore` itself —
//! this type only knows how to read and write segment files by name.

use crate::filter::{Amf, FilterError};
use crate::kv::{self, KvError};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::time::SystemTime;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SegmentError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Corruption(#[from] KvError),

    #[error(transparent)]
    Filter(#[from] FilterError),
}

type Result<T> = std::result::Result<T, SegmentError>;

pub struct FlushOutcome {
    /// (key, cumulative byte offset) pairs sampled at the configured
    /// sparsity, in write order.
    pub sparse_entries: Vec<(String, u64)>,
    pub record_count: usize,
}

pub struct SegmentStore {
    directory: PathBuf,
}

impl SegmentStore {
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        Ok(SegmentStore { directory })
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.directory.join(id)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.path_for(id).exists()
    }

    /// Writes `entries` (already in ascending key order, as a memtable's
    /// `in_order()` iterator yields) to a new segment file named `id`,
    /// adding every key to `filter` and sampling one sparse-index entry per
    /// `sparsity` records.
    pub fn flush<'a, I>(&self, id: &str, entries: I, filter: &mut Amf, sparsity: usize) -> Result<FlushOutcome>
    where
        I: Iterator<Item = (&'a str, &'a str)>,
    {
        let path = self.path_for(id);
        let mut file = File::create(&path)?;
        let sparsity = sparsity.max(1);
        let mut counter = sparsity;
        let mut offset: u64 = 0;
        let mut sparse_entries = Vec::new();
        let mut record_count = 0;

        for (key, value) in entries {
            if counter == 1 {
                sparse_entries.push((key.to_owned(), offset));
                counter = sparsity + 1;
            }
            let record = kv::to_record(key, value);
            file.write_all(record.as_bytes())?;
            offset += record.len() as u64;
            filter.add(key)?;
            counter -= 1;
            record_count += 1;
        }
        file.flush()?;
        Ok(FlushOutcome {
            sparse_entries,
            record_count,
        })
    }

    /// Binary-searches segment `id` for `key`. If `hint_offset` is given
    /// (from the sparse index), only the bytes from that offset onward are
    /// loaded and searched; otherwise the whole file is read.
    pub fn search(&self, id: &str, key: &str, hint_offset: Option<u64>) -> Result<Option<String>> {
        let path = self.path_for(id);
        let content = fs::read_to_string(&path)?;
        let start = hint_offset.unwrap_or(0) as usize;
        let start = start.min(content.len());
        let mut lines: Vec<&str> = content[start..].lines().collect();

        while !lines.is_empty() {
            let mid = (lines.len() - 1) / 2;
            let candidate_key = kv::parse_key(lines[mid])?;
            match key.cmp(candidate_key) {
                Ordering::Equal => return Ok(Some(kv::parse_record(lines[mid])?.value)),
                Ordering::Less => lines.truncate(mid),
                Ordering::Greater => lines = lines.split_off(mid + 1),
            }
        }
        Ok(None)
    }

    /// Two-pointer streaming merge of `older` and `newer` into a fresh
    /// segment `new_id`. On a key collision, `newer`'s record wins (Design
    /// Notes: "merge winner rule"). `older` and `newer` are left on disk;
    /// the caller removes them once it has recorded the new segment in
    /// metadata (Ordering guarantee (c): no segment is deleted before its
    /// merged successor is fully written).
    pub fn merge(&self, older: &str, newer: &str, new_id: &str) -> Result<()> {
        let older_reader = BufReader::new(File::open(self.path_for(older))?);
        let newer_reader = BufReader::new(File::open(self.path_for(newer))?);
        let mut older_lines = older_reader.lines();
        let mut newer_lines = newer_reader.lines();

        let mut out = File::create(self.path_for(new_id))?;
        let mut line1 = older_lines.next().transpose()?;
        let mut line2 = newer_lines.next().transpose()?;

        loop {
            match (&line1, &line2) {
                (None, None) => break,
                (None, Some(l2)) => {
                    writeln!(out, "{}", l2)?;
                    line2 = newer_lines.next().transpose()?;
                }
                (Some(l1), None) => {
                    writeln!(out, "{}", l1)?;
                    line1 = older_lines.next().transpose()?;
                }
                (Some(l1), Some(l2)) => {
                    let k1 = kv::parse_key(l1)?;
                    let k2 = kv::parse_key(l2)?;
                    match k1.cmp(k2) {
                        Ordering::Equal => {
                            writeln!(out, "{}", l2)?;
                            line1 = older_lines.next().transpose()?;
                            line2 = newer_lines.next().transpose()?;
                        }
                        Ordering::Less => {
                            writeln!(out, "{}", l1)?;
                            line1 = older_lines.next().transpose()?;
                        }
                        Ordering::Greater => {
                            writeln!(out, "{}", l2)?;
                            line2 = newer_lines.next().transpose()?;
                        }
                    }
                }
            }
        }
        out.flush()?;
        Ok(())
    }

    /// Rewrites segment `id`, dropping every record whose key is in `keys`.
    /// Returns whether anything was actually removed.
    pub fn delete_keys(&self, id: &str, keys: &HashSet<String>) -> Result<bool> {
        let path = self.path_for(id);
        let temp_path = self.directory.join(format!("{}_temp", id));

        let mut deleted = false;
        {
            let input = BufReader::new(File::open(&path)?);
            let mut output = File::create(&temp_path)?;
            for line in input.lines() {
                let line = line?;
                if line.is_empty() {
                    continue;
                }
                let key = kv::parse_key(&line)?;
                if keys.contains(key) {
                    deleted = true;
                } else {
                    writeln!(output, "{}", line)?;
                }
            }
            output.flush()?;
        }
        fs::remove_file(&path)?;
        fs::rename(&temp_path, &path)?;
        Ok(deleted)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        fs::remove_file(self.path_for(id))?;
        Ok(())
    }

    /// Segment size in megabytes (decimal, matching the reference
    /// implementation's `os.path.getsize(...) / 1_000_000`).
    pub fn size_mb(&self, id: &str) -> Result<f64> {
        let bytes = fs::metadata(self.path_for(id))?.len();
        Ok(bytes as f64 / 1_000_000.0)
    }

    pub fn modified_hours_ago(&self, id: &str) -> Result<f64> {
        let modified = fs::metadata(self.path_for(id))?.modified()?;
        let elapsed = SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default();
        Ok(elapsed.as_secs_f64() / 3600.0)
    }

    /// Reads every key in segment `id`, in file order (ascending). Used by
    /// the compaction engine to rebuild a fresh AMF over a freshly-merged
    /// segment, and by `SparseIndex::rebuild`.
    pub fn scan_keys(&self, id: &str) -> Result<Vec<String>> {
        let content = fs::read_to_string(self.path_for(id))?;
        content
            .lines()
            .map(|line| kv::parse_key(line).map(|k| k.to_owned()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::AmfKind;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, SegmentStore) {
        let dir = tempdir().unwrap();
        let store = SegmentStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn flush_then_search() {
        let (_dir, store) = store();
        let mut filter = Amf::new(AmfKind::Bloom, 10, 0.1);
        let entries = vec![("k1", "v1"), ("k2", "v2"), ("k3", "v3")];
        store
            .flush("seg-1", entries.into_iter(), &mut filter, 2)
            .unwrap();

        assert_eq!(store.search("seg-1", "k2", None).unwrap(), Some("v2".into()));
        assert_eq!(store.search("seg-1", "k4", None).unwrap(), None);
    }

    #[test]
    fn merge_prefers_newer_on_tie() {
        let (_dir, store) = store();
        let mut f1 = Amf::new(AmfKind::Bloom, 10, 0.1);
        let mut f2 = Amf::new(AmfKind::Bloom, 10, 0.1);
        store
            .flush("older", vec![("a", "1"), ("b", "2")].into_iter(), &mut f1, 100)
            .unwrap();
        store
            .flush("newer", vec![("b", "3"), ("c", "4")].into_iter(), &mut f2, 100)
            .unwrap();

        store.merge("older", "newer", "merged").unwrap();

        assert_eq!(store.search("merged", "a", None).unwrap(), Some("1".into()));
        assert_eq!(store.search("merged", "b", None).unwrap(), Some("3".into()));
        assert_eq!(store.search("merged", "c", None).unwrap(), Some("4".into()));
        assert_eq!(store.scan_keys("merged").unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn delete_keys_removes_matching_records_only() {
        let (_dir, store) = store();
        let mut filter = Amf::new(AmfKind::Bloom, 10, 0.1);
        store
            .flush(
                "seg-1",
                vec![("a", "1"), ("b", "2"), ("c", "3")].into_iter(),
                &mut filter,
                100,
            )
            .unwrap();

        let mut keys = HashSet::new();
        keys.insert("b".to_owned());
        let removed = store.delete_keys("seg-1", &keys).unwrap();
        assert!(removed);
        assert_eq!(store.search("seg-1", "b", None).unwrap(), None);
        assert_eq!(store.search("seg-1", "a", None).unwrap(), Some("1".into()));
    }

    #[test]
    fn sparse_hint_narrows_search() {
        let (_dir, store) = store();
        let mut filter = Amf::new(AmfKind::Bloom, 10, 0.1);
        let outcome = store
            .flush(
                "seg-1",
                vec![("a", "1"), ("b", "2"), ("c", "3")].into_iter(),
                &mut filter,
                2,
            )
            .unwrap();

        assert_eq!(outcome.sparse_entries.len(), 1);
        let (_, offset) = outcome.sparse_entries[0];
        assert_eq!(store.search("seg-1", "c", Some(offset)).unwrap(), Some("3".into()));
    }
}
