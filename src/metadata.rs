//! Durable bookkeeping: level memberships, segment-to-filter associations,
//! counters, and the sparse index, serialized as a single JSON blob at
//! `<segments_dir>/database_metadata`.
//!
//! The segment-to-filter mapping needs insertion order (for newest-first
//! iteration) without pulling in an `indexmap` dependency, so it is modeled
//! as an auxiliary `Vec<SegmentId>` alongside a `HashMap` — see
//! `SegmentAmfIndex`.

use crate::filter::{Amf, AmfKind};
use crate::sparse_index::{SegmentId, SparseIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type AmfId = String;

const METADATA_FILE_NAME: &str = "database_metadata";

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, MetadataError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Level {
    L1,
    L2,
    L3,
}

impl Level {
    pub fn next(self) -> Option<Level> {
        match self {
            Level::L1 => Some(Level::L2),
            Level::L2 => Some(Level::L3),
            Level::L3 => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Levels {
    l1: Vec<SegmentId>,
    l2: Vec<SegmentId>,
    l3: Vec<SegmentId>,
}

impl Levels {
    pub fn level(&self, level: Level) -> &Vec<SegmentId> {
        match level {
            Level::L1 => &self.l1,
            Level::L2 => &self.l2,
            Level::L3 => &self.l3,
        }
    }

    pub fn level_mut(&mut self, level: Level) -> &mut Vec<SegmentId> {
        match level {
            Level::L1 => &mut self.l1,
            Level::L2 => &mut self.l2,
            Level::L3 => &mut self.l3,
        }
    }
}

/// An insertion-ordered `segment id -> AMF ids` mapping, keeping order
/// explicitly in `order` rather than depending on a third-party indexmap.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentAmfIndex {
    order: Vec<SegmentId>,
    table: HashMap<SegmentId, Vec<AmfId>>,
}

impl SegmentAmfIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, segment: SegmentId, amfs: Vec<AmfId>) {
        if !self.table.contains_key(&segment) {
            self.order.push(segment.clone());
        }
        self.table.insert(segment, amfs);
    }

    pub fn remove(&mut self, segment: &str) -> Option<Vec<AmfId>> {
        self.order.retain(|s| s != segment);
        self.table.remove(segment)
    }

    pub fn get(&self, segment: &str) -> Option<&Vec<AmfId>> {
        self.table.get(segment)
    }

    /// Reverse insertion order: most recently flushed/merged segment first.
    pub fn newest_first(&self) -> impl Iterator<Item = &SegmentId> {
        self.order.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataStore {
    pub levels: Levels,
    pub segment_amfs: SegmentAmfIndex,
    pub amfs: HashMap<AmfId, Amf>,
    pub last_segment_name: Option<SegmentId>,
    pub last_amf_name: Option<AmfId>,
    pub count: usize,
    pub time_threshold_hours: f64,
    pub amf_kind: AmfKind,
    pub fpp: f64,
    pub sparse_index: SparseIndex,
}

impl MetadataStore {
    pub fn new(amf_kind: AmfKind, fpp: f64, time_threshold_hours: f64) -> Self {
        MetadataStore {
            levels: Levels::default(),
            segment_amfs: SegmentAmfIndex::new(),
            amfs: HashMap::new(),
            last_segment_name: None,
            last_amf_name: None,
            count: 0,
            time_threshold_hours,
            amf_kind,
            fpp,
            sparse_index: SparseIndex::new(),
        }
    }

    fn path(segments_dir: &Path) -> PathBuf {
        segments_dir.join(METADATA_FILE_NAME)
    }

    /// Loads the metadata blob from `segments_dir`, or `None` if this is a
    /// fresh database.
    pub fn load(segments_dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(segments_dir);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn save(&self, segments_dir: &Path) -> Result<()> {
        let path = Self::path(segments_dir);
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let mut store = MetadataStore::new(AmfKind::Bloom, 0.2, 0.25);
        store.levels.level_mut(Level::L1).push("segment-1".into());
        store.segment_amfs.insert("segment-1".into(), vec!["bf-1-ts".into()]);
        store.count = 3;
        store.save(dir.path()).unwrap();

        let loaded = MetadataStore::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.levels.level(Level::L1), &vec!["segment-1".to_string()]);
        assert_eq!(loaded.count, 3);
    }

    #[test]
    fn missing_metadata_file_yields_none() {
        let dir = tempdir().unwrap();
        assert!(MetadataStore::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn segment_amf_index_preserves_insertion_order() {
        let mut index = SegmentAmfIndex::new();
        index.insert("a".into(), vec![]);
        index.insert("b".into(), vec![]);
        index.insert("c".into(), vec![]);
        let order: Vec<&SegmentId> = index.newest_first().collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[test]
    fn level_next_has_no_successor_after_l3() {
        assert_eq!(Level::L1.next(), Some(Level::L2));
        assert_eq!(Level::L3.next(), None);
    }
}
