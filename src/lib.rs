//!
//! A Rust implementation of a tiered key-value store using [Log Structured Merge Trees](https://en.wikipedia.org/wiki/Log-structured_merge-tree#:~:text=In%20computer%20science%2C%20the%20log,%2C%20maintain%20key%2Dvalue%20pairs.)
//!
//! ## Example Usage
//! ```
//! use tiered_lsm::LSMBuilder;
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dir = tempfile::tempdir()?;
//!     let mut lsm = LSMBuilder::new()
//!         .segments_directory(dir.path().join("segments"))
//!         .wal_path(dir.path().join("wal.log"))
//!         .size_threshold(2)
//!         .build()?;
//!
//!     lsm.set("k1", "v1")?;
//!     lsm.set("k2", "v2")?;
//!     lsm.set("k1", "v_1_1")?;
//!     assert_eq!(lsm.get("k1")?, Some("v_1_1".to_owned()));
//!     Ok(())
//! }
//! ```
//! ## Design
//!
//! `tiered_lsm` is an embedded key-value store that uses LSM-trees and leverages a
//! [write-ahead log](https://en.wikipedia.org/wiki/Write-ahead_logging) (WAL) for crash recovery.
//!
//! ### Write
//! * The entry is appended to the WAL.
//! * If the key is new and the memtable is at capacity, the memtable is flushed to a new L1
//!   segment (with its own approximate-membership filter and sparse-index entries), and a
//!   compaction pass runs across all three levels.
//! * The entry is inserted into the memtable.
//!
//! ### Read
//! * The memtable is checked first; a hit there (the newest copy of the key) wins outright.
//! * Otherwise, segments are scanned newest-first. Each segment's approximate-membership filter
//!   is consulted before the segment file itself is opened; a positive filter hit triggers a
//!   binary search (narrowed by the sparse index when an entry is available), and the first
//!   value found wins.
//!
//! ### Delete
//! A memtable-resident key is removed outright, unshadowing any older copy that may still sit on
//! disk. A key with no memtable copy is physically rewritten out of the newest on-disk segment
//! that holds it. A sentinel value recorded in the WAL marks the removal so that replaying the
//! log after a crash reproduces it instead of resurrecting the deleted key.
//!

use crate::filter::{amf_name, Amf, AmfKind};
use crate::kv::KvError;
use crate::memtable::Memtable;
use crate::metadata::{Level, MetadataStore};
use crate::segment::SegmentStore;
use crate::sparse_index::SegmentId;
use crate::timestamp::next_timestamp;
use crate::wal::WalRegistry;
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;

#[macro_use]
extern crate lazy_static;

mod bloom;
mod compaction;
mod cuckoo;
mod filter;
mod hash;
mod kv;
mod memtable;
mod metadata;
mod segment;
mod sparse_index;
mod timestamp;
mod wal;

pub use crate::filter::AmfKind;

lazy_static! {
    /// A fixed sentinel value appended to the WAL in place of a deleted key's
    /// value, so that replaying the log after a crash can tell a delete
    /// record apart from a normal write — a deterministically-seeded random
    /// string rather than a hardcoded constant, to make accidental collision
    /// with a real value astronomically unlikely without reserving a literal
    /// string.
    static ref TOMBSTONE_VALUE: String = {
        let rng: StdRng = SeedableRng::seed_from_u64(20);
        rng.sample_iter(&Alphanumeric).take(20).collect::<String>()
    };
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    InvalidInput(#[from] KvError),
    #[error(transparent)]
    Wal(#[from] wal::WalError),
    #[error(transparent)]
    Segment(#[from] segment::SegmentError),
    #[error(transparent)]
    Filter(#[from] filter::FilterError),
    #[error(transparent)]
    Compaction(#[from] compaction::CompactionError),
    #[error(transparent)]
    Metadata(#[from] metadata::MetadataError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, self::Error>;

pub struct LSMEngine {
    memtable: Memtable<String, String>,
    wal: WalRegistry,
    wal_path: PathBuf,
    segments: SegmentStore,
    segments_directory: PathBuf,
    compaction: compaction::CompactionEngine,
    meta: MetadataStore,
    size_threshold: usize,
    sparsity_factor: usize,
}

pub struct LSMBuilder {
    size_threshold: Option<usize>,
    sparsity_factor: usize,
    time_threshold_hours: f64,
    lvl1_size_mb: f64,
    lvl2_size_mb: f64,
    fpp: f64,
    amf_kind: AmfKind,
    segments_directory: PathBuf,
    wal_path: PathBuf,
}

impl LSMBuilder {
    pub fn new() -> Self {
        LSMBuilder {
            size_threshold: None,
            sparsity_factor: 100,
            time_threshold_hours: 0.25 / 40.0,
            lvl1_size_mb: 35.0,
            lvl2_size_mb: 100.0,
            fpp: 0.2,
            amf_kind: AmfKind::Bloom,
            segments_directory: PathBuf::from("segments"),
            wal_path: PathBuf::from("wal.log"),
        }
    }

    /// Memtable item-count trigger for a flush. Defaults to 50 000 for the
    /// Bloom variant or 100 000 for the Cuckoo variant, unless overridden.
    pub fn size_threshold(mut self, size_threshold: usize) -> Self {
        self.size_threshold = Some(size_threshold);
        self
    }

    pub fn sparsity_factor(mut self, sparsity_factor: usize) -> Self {
        self.sparsity_factor = sparsity_factor;
        self
    }

    pub fn time_threshold_hours(mut self, hours: f64) -> Self {
        self.time_threshold_hours = hours;
        self
    }

    pub fn lvl1_size_mb(mut self, mb: f64) -> Self {
        self.lvl1_size_mb = mb;
        self
    }

    pub fn lvl2_size_mb(mut self, mb: f64) -> Self {
        self.lvl2_size_mb = mb;
        self
    }

    pub fn fpp(mut self, fpp: f64) -> Self {
        self.fpp = fpp;
        self
    }

    pub fn amf_kind(mut self, kind: AmfKind) -> Self {
        self.amf_kind = kind;
        self
    }

    pub fn segments_directory<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.segments_directory = dir.into();
        self
    }

    pub fn wal_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.wal_path = path.into();
        self
    }

    pub fn build(self) -> Result<LSMEngine> {
        let size_threshold = self.size_threshold.unwrap_or(match self.amf_kind {
            AmfKind::Bloom => 50_000,
            AmfKind::Cuckoo => 100_000,
        });
        LSMEngine::open(
            self.segments_directory,
            self.wal_path,
            size_threshold,
            self.sparsity_factor,
            self.time_threshold_hours,
            self.lvl1_size_mb,
            self.lvl2_size_mb,
            self.fpp,
            self.amf_kind,
        )
    }
}

impl Default for LSMBuilder {
    fn default() -> Self {
        LSMBuilder::new()
    }
}

impl LSMEngine {
    #[allow(clippy::too_many_arguments)]
    fn open(
        segments_directory: PathBuf,
        wal_path: PathBuf,
        size_threshold: usize,
        sparsity_factor: usize,
        time_threshold_hours: f64,
        lvl1_size_mb: f64,
        lvl2_size_mb: f64,
        fpp: f64,
        amf_kind: AmfKind,
    ) -> Result<Self> {
        let segments = SegmentStore::new(&segments_directory)?;
        let meta = match MetadataStore::load(&segments_directory)? {
            Some(meta) => meta,
            None => MetadataStore::new(amf_kind, fpp, time_threshold_hours),
        };

        let mut memtable = Memtable::new(size_threshold);
        let mut wal = WalRegistry::new();
        let records = wal.replay(&wal_path)?;
        log::info!("replayed {} WAL records from {}", records.len(), wal_path.display());
        for record in records {
            if record.value == *TOMBSTONE_VALUE {
                memtable.delete(&record.key);
                continue;
            }
            memtable.add_bytes(record.key.len() + record.value.len());
            memtable.insert(record.key, record.value);
        }

        let compaction = compaction::CompactionEngine::new(
            time_threshold_hours,
            lvl1_size_mb,
            lvl2_size_mb,
            size_threshold,
            fpp,
        );

        Ok(LSMEngine {
            memtable,
            wal,
            wal_path,
            segments,
            segments_directory,
            compaction,
            meta,
            size_threshold,
            sparsity_factor,
        })
    }

    fn sparsity(&self) -> usize {
        (self.size_threshold / self.sparsity_factor.max(1)).max(1)
    }

    /// Writes `key, value`. An update to a key already resident in the
    /// memtable happens in place and never triggers a flush.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        kv::validate(key, value)?;

        if self.memtable.contains(key) {
            self.wal.append(&self.wal_path, key, value)?;
            self.memtable.insert(key.to_owned(), value.to_owned());
            return Ok(());
        }

        if self.memtable.at_capacity() {
            self.flush()?;
        }

        self.wal.append(&self.wal_path, key, value)?;
        self.memtable.insert(key.to_owned(), value.to_owned());
        self.memtable.add_bytes(key.len() + value.len());
        Ok(())
    }

    /// Reads the value associated with `key`, or `None` if it has never been
    /// set or has been deleted. A deleted memtable entry is removed outright,
    /// so a miss there always falls through to the on-disk segments, which
    /// may still hold an older copy.
    pub fn get(&mut self, key: &str) -> Result<Option<String>> {
        if let Some(value) = self.memtable.get(key) {
            return Ok(Some(value.clone()));
        }

        let segment_ids: Vec<SegmentId> = self.meta.segment_amfs.newest_first().cloned().collect();
        for segment_id in segment_ids {
            let amf_ids = match self.meta.segment_amfs.get(&segment_id) {
                Some(ids) => ids.clone(),
                None => continue,
            };
            let positive = amf_ids
                .iter()
                .any(|id| self.meta.amfs.get(id).map(|amf| amf.contains(key)).unwrap_or(false));
            if !positive {
                continue;
            }

            let hint = self
                .meta
                .sparse_index
                .floor(key)
                .and_then(|(seg, offset)| if seg == &segment_id { Some(offset) } else { None });

            if let Some(value) = self.segments.search(&segment_id, key, hint)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Deletes `key`. A memtable-resident key is removed outright, unshadowing
    /// whatever older copy may still sit on disk rather than shadowing it
    /// with a marker; a key with no memtable copy is physically removed from
    /// the first (newest) segment whose filter reports it present.
    pub fn delete(&mut self, key: &str) -> Result<()> {
        kv::validate(key, "")?;

        if self.memtable.contains(key) {
            self.wal.append(&self.wal_path, key, &TOMBSTONE_VALUE)?;
            self.memtable.delete(key);
            return Ok(());
        }

        let segment_ids: Vec<SegmentId> = self.meta.segment_amfs.newest_first().cloned().collect();
        for segment_id in segment_ids {
            let amf_ids = match self.meta.segment_amfs.get(&segment_id) {
                Some(ids) => ids.clone(),
                None => continue,
            };
            let mut hit = false;
            for amf_id in &amf_ids {
                if let Some(amf) = self.meta.amfs.get_mut(amf_id) {
                    if amf.contains(key) {
                        hit = true;
                        amf.delete(key);
                    }
                }
            }
            if !hit {
                continue;
            }

            let mut keys = HashSet::new();
            keys.insert(key.to_owned());
            if self.segments.delete_keys(&segment_id, &keys)? {
                log::info!("deleted key from segment {}", segment_id);
                self.persist_meta()?;
                return Ok(());
            }
        }
        Ok(())
    }

    /// Drains the memtable into a fresh L1 segment, rebuilds its filter and
    /// sparse-index entries, clears the WAL, and runs the compaction pass.
    fn flush(&mut self) -> Result<()> {
        let timestamp = next_timestamp();
        let segment_id = format!("segment-{}", timestamp);
        let filter_name = amf_name(self.meta.amf_kind, 1, &timestamp);
        let mut filter = Amf::new(self.meta.amf_kind, self.memtable.len().max(1), self.meta.fpp);

        let entries: Vec<(String, String)> = self.memtable.drain().collect();

        let outcome = self.segments.flush(
            &segment_id,
            entries.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            &mut filter,
            self.sparsity(),
        )?;

        for (key, offset) in outcome.sparse_entries {
            self.meta.sparse_index.insert(key, segment_id.clone(), offset);
        }

        self.meta.amfs.insert(filter_name.clone(), filter);
        self.meta
            .segment_amfs
            .insert(segment_id.clone(), vec![filter_name.clone()]);
        self.meta.levels.level_mut(Level::L1).push(segment_id.clone());
        self.meta.last_segment_name = Some(segment_id.clone());
        self.meta.last_amf_name = Some(filter_name);

        log::info!("flushed {} records to segment {}", outcome.record_count, segment_id);

        self.wal.clear(&self.wal_path)?;
        self.compaction.run(&self.segments, &mut self.meta)?;
        self.persist_meta()?;
        Ok(())
    }

    fn persist_meta(&mut self) -> Result<()> {
        self.meta.count = self.memtable.len();
        self.meta.save(&self.segments_directory)?;
        Ok(())
    }
}
